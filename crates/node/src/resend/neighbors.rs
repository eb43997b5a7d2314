//! L2: relay a resend through the stream's current outbound neighbors.

use super::proxied::proxied_resend;
use super::{ResendOutcome, ResendRouter, ResendSink, ResendStrategy};
use starling_api::protocol::ResendRequest;
use starling_api::transport::DynNodeTransport;
use starling_api::{BoxFut, NodeId, SlResult, StreamPartition};
use std::sync::Arc;
use std::time::Duration;

/// Answers "who could relay this stream right now".
pub type GetNeighbors =
    Arc<dyn Fn(&StreamPartition) -> Vec<NodeId> + Send + Sync>;

/// Forwards a resend request to connected neighbors, one at a time, and
/// relays whatever they answer. Serves locally originated requests only; a
/// request that already came from a peer is not relayed again.
pub struct AskNeighborsResendStrategy {
    transport: DynNodeTransport,
    router: ResendRouter,
    get_neighbors: GetNeighbors,
    max_tries: usize,
    timeout: Duration,
}

impl std::fmt::Debug for AskNeighborsResendStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AskNeighborsResendStrategy")
            .field("max_tries", &self.max_tries)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AskNeighborsResendStrategy {
    /// Construct the strategy. `max_tries` bounds how many neighbors are
    /// asked before giving up; `timeout` bounds the wait on each.
    pub fn new(
        transport: DynNodeTransport,
        router: ResendRouter,
        get_neighbors: GetNeighbors,
        max_tries: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            router,
            get_neighbors,
            max_tries,
            timeout,
        }
    }
}

impl ResendStrategy for AskNeighborsResendStrategy {
    fn resend(
        &self,
        request: ResendRequest,
        source: Option<NodeId>,
        sink: ResendSink,
    ) -> BoxFut<'static, SlResult<ResendOutcome>> {
        let transport = self.transport.clone();
        let router = self.router.clone();
        let get_neighbors = self.get_neighbors.clone();
        let max_tries = self.max_tries;
        let timeout = self.timeout;
        Box::pin(async move {
            // relayed requests stop here, only the origin fans out
            if source.is_some() {
                return Ok(ResendOutcome::NoResend);
            }
            let stream = request.stream_partition();
            proxied_resend(
                &transport,
                &router,
                request,
                &sink,
                || get_neighbors(&stream),
                max_tries,
                timeout,
            )
            .await
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    struct NoTransport;

    impl starling_api::transport::NodeTransport for NoTransport {
        fn local_node_id(&self) -> NodeId {
            "local".into()
        }

        fn register_handler(
            &self,
            _handler: starling_api::transport::DynNodeTransportHandler,
        ) {
        }

        fn connect_to_node(
            &self,
            node: NodeId,
            _via: NodeId,
        ) -> BoxFut<'_, SlResult<NodeId>> {
            Box::pin(async move { Ok(node) })
        }

        fn disconnect_from_node(
            &self,
            _node: NodeId,
            _reason: starling_api::transport::DisconnectionReason,
        ) -> BoxFut<'_, ()> {
            Box::pin(async {})
        }

        fn send(
            &self,
            _to: NodeId,
            _message: starling_api::protocol::NodeMessage,
        ) -> BoxFut<'_, SlResult<()>> {
            Box::pin(async { Ok(()) })
        }

        fn rtts(&self) -> std::collections::HashMap<NodeId, u32> {
            std::collections::HashMap::new()
        }
    }

    fn request() -> ResendRequest {
        ResendRequest::ResendLastRequest {
            request_id: "req".into(),
            stream_id: "s".to_string(),
            stream_partition: 0,
            number_last: 1,
        }
    }

    #[tokio::test]
    async fn relayed_requests_are_not_relayed_again() {
        let strategy = AskNeighborsResendStrategy::new(
            Arc::new(NoTransport),
            ResendRouter::new(),
            Arc::new(|_| vec!["peer".into()]),
            3,
            Duration::from_secs(20),
        );
        let (tx, _rx) = mpsc::channel(4);
        let outcome = strategy
            .resend(request(), Some("peer".into()), tx)
            .await
            .unwrap();
        assert_eq!(ResendOutcome::NoResend, outcome);
    }

    #[tokio::test]
    async fn no_neighbors_means_no_resend() {
        let strategy = AskNeighborsResendStrategy::new(
            Arc::new(NoTransport),
            ResendRouter::new(),
            Arc::new(|_| vec![]),
            3,
            Duration::from_secs(20),
        );
        let (tx, _rx) = mpsc::channel(4);
        let outcome = strategy.resend(request(), None, tx).await.unwrap();
        assert_eq!(ResendOutcome::NoResend, outcome);
    }
}
