//! L3: locate a storage node via the tracker and relay through it.

use super::proxied::proxied_resend;
use super::{ResendOutcome, ResendRouter, ResendSink, ResendStrategy};
use starling_api::protocol::{
    ResendRequest, StorageNodesRequest, StorageNodesResponse,
};
use starling_api::transport::{
    DisconnectionReason, DynNodeTransport, DynTrackerTransport,
};
use starling_api::{
    BoxFut, NodeId, SlResult, StreamPartition, TrackerId,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Resolves the connected tracker responsible for a stream, if any.
pub type GetTracker =
    Arc<dyn Fn(&StreamPartition) -> Option<TrackerId> + Send + Sync>;

/// Whether this node is subscribed to the given peer through any stream.
pub type IsSubscribed = Arc<dyn Fn(&NodeId) -> bool + Send + Sync>;

type PendingWaiters =
    HashMap<StreamPartition, Vec<oneshot::Sender<(Vec<NodeId>, TrackerId)>>>;

/// Asks the stream's tracker for storage nodes, opens a connection to the
/// first reachable one (possibly a temporary one) and relays the resend
/// through it. The temporary connection is released once the last resend
/// against that storage node completes, unless the node is a gossip
/// neighbor in its own right. Serves locally originated requests only.
pub struct StorageNodeResendStrategy {
    transport: DynNodeTransport,
    tracker_transport: DynTrackerTransport,
    router: ResendRouter,
    get_tracker: GetTracker,
    is_subscribed: IsSubscribed,
    timeout: Duration,
    pending: Arc<Mutex<PendingWaiters>>,
    leases: Arc<Mutex<HashMap<NodeId, usize>>>,
}

impl std::fmt::Debug for StorageNodeResendStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageNodeResendStrategy")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl StorageNodeResendStrategy {
    /// Construct the strategy. `timeout` bounds both the wait for the
    /// tracker's storage-node answer and each relay attempt.
    pub fn new(
        transport: DynNodeTransport,
        tracker_transport: DynTrackerTransport,
        router: ResendRouter,
        get_tracker: GetTracker,
        is_subscribed: IsSubscribed,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            tracker_transport,
            router,
            get_tracker,
            is_subscribed,
            timeout,
            pending: Arc::new(Mutex::new(HashMap::new())),
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Ask the tracker for storage nodes and wait for the routed answer.
    async fn locate_storage_nodes(
        &self,
        stream: &StreamPartition,
    ) -> Option<(Vec<NodeId>, TrackerId)> {
        let tracker = match (self.get_tracker)(stream) {
            Some(tracker) => tracker,
            None => {
                tracing::debug!(%stream, "no connected tracker for stream");
                return None;
            }
        };
        let request = StorageNodesRequest {
            stream_id: stream.stream_id().to_string(),
            stream_partition: stream.partition(),
        };
        if let Err(e) = self
            .tracker_transport
            .send_storage_nodes_request(tracker, request)
            .await
        {
            tracing::warn!(%stream, "failed to request storage nodes: {e}");
            return None;
        }

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .entry(stream.clone())
            .or_default()
            .push(tx);

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(answer)) => Some(answer),
            _ => {
                // drop waiters whose receivers are gone, ours included
                let mut pending = self.pending.lock().unwrap();
                if let Some(waiters) = pending.get_mut(stream) {
                    waiters.retain(|tx| !tx.is_closed());
                    if waiters.is_empty() {
                        pending.remove(stream);
                    }
                }
                None
            }
        }
    }

    /// Connect to the first reachable storage node, returning a lease that
    /// releases the connection when the last concurrent resend drops it.
    async fn connect_any(
        &self,
        node_ids: Vec<NodeId>,
        tracker: TrackerId,
    ) -> Option<ConnectionLease> {
        for node in node_ids {
            let connect =
                self.transport.connect_to_node(node.clone(), tracker.clone());
            match tokio::time::timeout(self.timeout, connect).await {
                Ok(Ok(connected)) => {
                    *self
                        .leases
                        .lock()
                        .unwrap()
                        .entry(connected.clone())
                        .or_insert(0) += 1;
                    return Some(ConnectionLease {
                        node: connected,
                        transport: self.transport.clone(),
                        is_subscribed: self.is_subscribed.clone(),
                        leases: self.leases.clone(),
                    });
                }
                Ok(Err(e)) => {
                    tracing::debug!(%node, "storage node unreachable: {e}");
                }
                Err(_) => {
                    tracing::debug!(%node, "storage node connect timed out");
                }
            }
        }
        None
    }
}

impl ResendStrategy for StorageNodeResendStrategy {
    fn resend(
        &self,
        request: ResendRequest,
        source: Option<NodeId>,
        sink: ResendSink,
    ) -> BoxFut<'static, SlResult<ResendOutcome>> {
        let this = Self {
            transport: self.transport.clone(),
            tracker_transport: self.tracker_transport.clone(),
            router: self.router.clone(),
            get_tracker: self.get_tracker.clone(),
            is_subscribed: self.is_subscribed.clone(),
            timeout: self.timeout,
            pending: self.pending.clone(),
            leases: self.leases.clone(),
        };
        Box::pin(async move {
            // relayed requests stop here, only the origin fans out
            if source.is_some() {
                return Ok(ResendOutcome::NoResend);
            }
            let stream = request.stream_partition();
            let Some((node_ids, tracker)) =
                this.locate_storage_nodes(&stream).await
            else {
                return Ok(ResendOutcome::NoResend);
            };
            let Some(lease) = this.connect_any(node_ids, tracker).await else {
                return Ok(ResendOutcome::NoResend);
            };

            let storage_node = lease.node.clone();
            let outcome = proxied_resend(
                &this.transport,
                &this.router,
                request,
                &sink,
                || vec![storage_node.clone()],
                1,
                this.timeout,
            )
            .await;
            drop(lease);
            outcome
        })
    }

    fn on_storage_nodes_response(
        &self,
        response: StorageNodesResponse,
        tracker: TrackerId,
    ) {
        let stream = response.stream_partition();
        let waiters = self.pending.lock().unwrap().remove(&stream);
        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.send((response.node_ids.clone(), tracker.clone()));
            }
        }
    }

    fn stop(&self) {
        self.pending.lock().unwrap().clear();
    }
}

/// Refcount on a (possibly temporary) storage-node connection. Dropping the
/// last lease disconnects the node unless it is also a gossip neighbor;
/// drop-based so an aborted resend still releases the connection.
struct ConnectionLease {
    node: NodeId,
    transport: DynNodeTransport,
    is_subscribed: IsSubscribed,
    leases: Arc<Mutex<HashMap<NodeId, usize>>>,
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        let mut leases = self.leases.lock().unwrap();
        let last = match leases.get_mut(&self.node) {
            Some(count) => {
                *count -= 1;
                *count == 0
            }
            None => false,
        };
        if last {
            leases.remove(&self.node);
            if !(self.is_subscribed)(&self.node) {
                let transport = self.transport.clone();
                let node = self.node.clone();
                tokio::spawn(async move {
                    transport
                        .disconnect_from_node(
                            node,
                            DisconnectionReason::ResendDone,
                        )
                        .await;
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use starling_api::protocol::{NodeMessage, ResendResponse, Status};
    use starling_api::transport::{
        DynNodeTransportHandler, DynTrackerTransportHandler, NodeTransport,
        TrackerTransport,
    };
    use tokio::sync::mpsc;

    #[derive(Debug, Default)]
    struct StubNodeTransport {
        sent: Mutex<Vec<(NodeId, NodeMessage)>>,
        disconnected: Mutex<Vec<NodeId>>,
        connect_fails: bool,
    }

    impl NodeTransport for StubNodeTransport {
        fn local_node_id(&self) -> NodeId {
            "local".into()
        }

        fn register_handler(&self, _handler: DynNodeTransportHandler) {}

        fn connect_to_node(
            &self,
            node: NodeId,
            _via: TrackerId,
        ) -> BoxFut<'_, SlResult<NodeId>> {
            let fails = self.connect_fails;
            Box::pin(async move {
                if fails {
                    Err(starling_api::SlError::other("unreachable"))
                } else {
                    Ok(node)
                }
            })
        }

        fn disconnect_from_node(
            &self,
            node: NodeId,
            _reason: DisconnectionReason,
        ) -> BoxFut<'_, ()> {
            self.disconnected.lock().unwrap().push(node);
            Box::pin(async {})
        }

        fn send(
            &self,
            to: NodeId,
            message: NodeMessage,
        ) -> BoxFut<'_, SlResult<()>> {
            self.sent.lock().unwrap().push((to, message));
            Box::pin(async { Ok(()) })
        }

        fn rtts(&self) -> HashMap<NodeId, u32> {
            HashMap::new()
        }
    }

    #[derive(Debug, Default)]
    struct StubTrackerTransport {
        requests: Mutex<Vec<StorageNodesRequest>>,
    }

    impl TrackerTransport for StubTrackerTransport {
        fn register_handler(&self, _handler: DynTrackerTransportHandler) {}

        fn connect_to_tracker(
            &self,
            _address: &str,
        ) -> BoxFut<'_, SlResult<TrackerId>> {
            Box::pin(async { Ok("tracker".into()) })
        }

        fn send_status(
            &self,
            _tracker: TrackerId,
            _status: Status,
        ) -> BoxFut<'_, SlResult<()>> {
            Box::pin(async { Ok(()) })
        }

        fn send_storage_nodes_request(
            &self,
            _tracker: TrackerId,
            request: StorageNodesRequest,
        ) -> BoxFut<'_, SlResult<()>> {
            self.requests.lock().unwrap().push(request);
            Box::pin(async { Ok(()) })
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

    fn strategy(
        transport: Arc<StubNodeTransport>,
        tracker_transport: Arc<StubTrackerTransport>,
        router: ResendRouter,
    ) -> StorageNodeResendStrategy {
        StorageNodeResendStrategy::new(
            transport,
            tracker_transport,
            router,
            Arc::new(|_| Some(TrackerId::from("tracker"))),
            Arc::new(|_| false),
            Duration::from_secs(20),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn relayed_requests_are_answered_locally_only() {
        let strategy = strategy(
            Arc::new(StubNodeTransport::default()),
            Arc::new(StubTrackerTransport::default()),
            ResendRouter::new(),
        );
        let (tx, _rx) = mpsc::channel(4);
        let outcome = strategy
            .resend(request(), Some("peer".into()), tx)
            .await
            .unwrap();
        assert_eq!(ResendOutcome::NoResend, outcome);
    }

    #[tokio::test(start_paused = true)]
    async fn no_storage_nodes_answer_is_no_resend() {
        let transport = Arc::new(StubNodeTransport::default());
        let tracker_transport = Arc::new(StubTrackerTransport::default());
        let router = ResendRouter::new();
        let strategy = Arc::new(strategy(
            transport,
            tracker_transport.clone(),
            router,
        ));

        let (tx, _rx) = mpsc::channel(4);
        let run = {
            let strategy = strategy.clone();
            tokio::spawn(async move { strategy.resend(request(), None, tx).await })
        };
        tokio::task::yield_now().await;

        // tracker answers with an empty set
        strategy.on_storage_nodes_response(
            StorageNodesResponse {
                stream_id: "s".to_string(),
                stream_partition: 0,
                node_ids: vec![],
            },
            "tracker".into(),
        );

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(ResendOutcome::NoResend, outcome);
        assert_eq!(1, tracker_transport.requests.lock().unwrap().len());
    }

    #[tokio::test(start_paused = true)]
    async fn relays_through_storage_node_and_releases_connection() {
        let transport = Arc::new(StubNodeTransport::default());
        let tracker_transport = Arc::new(StubTrackerTransport::default());
        let router = ResendRouter::new();
        let strategy = Arc::new(strategy(
            transport.clone(),
            tracker_transport,
            router.clone(),
        ));

        let (tx, _rx) = mpsc::channel(4);
        let run = {
            let strategy = strategy.clone();
            tokio::spawn(async move { strategy.resend(request(), None, tx).await })
        };
        tokio::task::yield_now().await;

        strategy.on_storage_nodes_response(
            StorageNodesResponse {
                stream_id: "s".to_string(),
                stream_partition: 0,
                node_ids: vec!["storage-1".into()],
            },
            "tracker".into(),
        );
        tokio::task::yield_now().await;

        router.route_response(
            ResendResponse::Resent {
                request_id: "req".into(),
                stream_id: "s".to_string(),
                stream_partition: 0,
            },
            "storage-1".into(),
        );

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(ResendOutcome::Fulfilled, outcome);

        // the temporary connection gets released
        tokio::task::yield_now().await;
        assert_eq!(
            vec![NodeId::from("storage-1")],
            transport.disconnected.lock().unwrap().clone()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_storage_nodes_mean_no_resend() {
        let transport = Arc::new(StubNodeTransport {
            connect_fails: true,
            ..Default::default()
        });
        let strategy = Arc::new(strategy(
            transport,
            Arc::new(StubTrackerTransport::default()),
            ResendRouter::new(),
        ));

        let (tx, _rx) = mpsc::channel(4);
        let run = {
            let strategy = strategy.clone();
            tokio::spawn(async move { strategy.resend(request(), None, tx).await })
        };
        tokio::task::yield_now().await;

        strategy.on_storage_nodes_response(
            StorageNodesResponse {
                stream_id: "s".to_string(),
                stream_partition: 0,
                node_ids: vec!["storage-1".into()],
            },
            "tracker".into(),
        );

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(ResendOutcome::NoResend, outcome);
    }
}
