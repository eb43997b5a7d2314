//! L1: answer resends straight from this node's own storage.

use super::{ResendOutcome, ResendSink, ResendStrategy};
use futures::StreamExt;
use starling_api::protocol::{ResendRequest, UnicastMessage};
use starling_api::storage::DynStorage;
use starling_api::{BoxFut, NodeId, SlResult};

/// Translates a resend request into the matching storage query and streams
/// the results back, each wrapped with the original request id. Dropping
/// the response consumer drops the storage stream, canceling the query.
#[derive(Debug)]
pub struct LocalResendStrategy {
    storage: DynStorage,
}

impl LocalResendStrategy {
    /// Construct the strategy over a storage collaborator.
    pub fn new(storage: DynStorage) -> Self {
        Self { storage }
    }
}

impl ResendStrategy for LocalResendStrategy {
    fn resend(
        &self,
        request: ResendRequest,
        _source: Option<NodeId>,
        sink: ResendSink,
    ) -> BoxFut<'static, SlResult<ResendOutcome>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            let stream = request.stream_partition();
            let mut source_stream = match &request {
                ResendRequest::ResendLastRequest { number_last, .. } => {
                    storage.request_last(&stream, *number_last)
                }
                ResendRequest::ResendFromRequest {
                    from_msg_ref,
                    publisher_id,
                    ..
                } => storage.request_from(
                    &stream,
                    *from_msg_ref,
                    publisher_id.as_deref(),
                ),
                ResendRequest::ResendRangeRequest {
                    from_msg_ref,
                    to_msg_ref,
                    publisher_id,
                    msg_chain_id,
                    ..
                } => storage.request_range(
                    &stream,
                    *from_msg_ref,
                    *to_msg_ref,
                    publisher_id,
                    msg_chain_id,
                ),
            };

            let request_id = request.request_id().clone();
            let mut any = false;
            while let Some(item) = source_stream.next().await {
                let stream_message = match item {
                    Ok(message) => message,
                    Err(e) if any => {
                        // the requester already saw data; report fulfilled
                        // rather than replaying through another tier
                        tracing::warn!(
                            %request_id,
                            "storage query failed mid-stream: {e}"
                        );
                        return Ok(ResendOutcome::Fulfilled);
                    }
                    Err(e) => return Err(e),
                };
                let unicast = UnicastMessage {
                    request_id: request_id.clone(),
                    stream_message,
                };
                if sink.send(unicast).await.is_err() {
                    break;
                }
                any = true;
            }

            Ok(if any {
                ResendOutcome::Fulfilled
            } else {
                ResendOutcome::NoResend
            })
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use starling_api::storage::{MessageStream, Storage};
    use starling_api::{
        MessageId, MessageRef, SlError, StreamMessage, StreamPartition,
    };
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    fn message(timestamp: i64) -> StreamMessage {
        StreamMessage {
            message_id: MessageId {
                stream_id: "s".into(),
                stream_partition: 0,
                timestamp,
                sequence_number: 0,
                publisher_id: "p".into(),
                msg_chain_id: "c".into(),
            },
            prev_msg_ref: None,
            payload: bytes::Bytes::new(),
        }
    }

    #[derive(Debug)]
    struct VecStorage {
        messages: Vec<SlResult<StreamMessage>>,
        seen_queries: Mutex<Vec<String>>,
    }

    impl Storage for VecStorage {
        fn request_last(
            &self,
            _stream: &StreamPartition,
            count: u64,
        ) -> MessageStream {
            self.seen_queries
                .lock()
                .unwrap()
                .push(format!("last:{count}"));
            futures::stream::iter(self.messages.clone()).boxed()
        }

        fn request_from(
            &self,
            _stream: &StreamPartition,
            from: MessageRef,
            _publisher_id: Option<&str>,
        ) -> MessageStream {
            self.seen_queries
                .lock()
                .unwrap()
                .push(format!("from:{from}"));
            futures::stream::iter(self.messages.clone()).boxed()
        }

        fn request_range(
            &self,
            _stream: &StreamPartition,
            from: MessageRef,
            to: MessageRef,
            _publisher_id: &str,
            _msg_chain_id: &str,
        ) -> MessageStream {
            self.seen_queries
                .lock()
                .unwrap()
                .push(format!("range:{from}..{to}"));
            futures::stream::iter(self.messages.clone()).boxed()
        }

        fn store(
            &self,
            _message: StreamMessage,
        ) -> BoxFut<'_, SlResult<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    async fn run(
        storage: Arc<VecStorage>,
        request: ResendRequest,
    ) -> (Vec<UnicastMessage>, SlResult<ResendOutcome>) {
        let strategy = LocalResendStrategy::new(storage);
        let (tx, mut rx) = mpsc::channel(16);
        let outcome = strategy.resend(request, None, tx).await;
        let mut collected = Vec::new();
        while let Ok(m) = rx.try_recv() {
            collected.push(m);
        }
        (collected, outcome)
    }

    #[tokio::test]
    async fn last_request_maps_to_request_last() {
        let storage = Arc::new(VecStorage {
            messages: vec![Ok(message(1)), Ok(message(2))],
            seen_queries: Mutex::new(Vec::new()),
        });
        let request = ResendRequest::ResendLastRequest {
            request_id: "req-9".into(),
            stream_id: "s".to_string(),
            stream_partition: 0,
            number_last: 2,
        };

        let (collected, outcome) = run(storage.clone(), request).await;
        assert_eq!(ResendOutcome::Fulfilled, outcome.unwrap());
        assert_eq!(2, collected.len());
        assert!(collected
            .iter()
            .all(|m| m.request_id == "req-9".into()));
        assert_eq!(
            vec!["last:2".to_string()],
            storage.seen_queries.lock().unwrap().clone()
        );
    }

    #[tokio::test]
    async fn range_request_maps_to_request_range() {
        let storage = Arc::new(VecStorage {
            messages: vec![],
            seen_queries: Mutex::new(Vec::new()),
        });
        let request = ResendRequest::ResendRangeRequest {
            request_id: "req".into(),
            stream_id: "s".to_string(),
            stream_partition: 0,
            from_msg_ref: MessageRef::new(1, 0),
            to_msg_ref: MessageRef::new(9, 0),
            publisher_id: "p".to_string(),
            msg_chain_id: "c".to_string(),
        };

        let (_, outcome) = run(storage.clone(), request).await;
        assert_eq!(ResendOutcome::NoResend, outcome.unwrap());
        assert_eq!(
            vec!["range:1|0..9|0".to_string()],
            storage.seen_queries.lock().unwrap().clone()
        );
    }

    #[tokio::test]
    async fn empty_result_is_no_resend() {
        let storage = Arc::new(VecStorage {
            messages: vec![],
            seen_queries: Mutex::new(Vec::new()),
        });
        let request = ResendRequest::ResendLastRequest {
            request_id: "req".into(),
            stream_id: "s".to_string(),
            stream_partition: 0,
            number_last: 10,
        };

        let (collected, outcome) = run(storage, request).await;
        assert!(collected.is_empty());
        assert_eq!(ResendOutcome::NoResend, outcome.unwrap());
    }

    #[tokio::test]
    async fn immediate_query_error_is_an_error() {
        let storage = Arc::new(VecStorage {
            messages: vec![Err(SlError::other("query failed"))],
            seen_queries: Mutex::new(Vec::new()),
        });
        let request = ResendRequest::ResendLastRequest {
            request_id: "req".into(),
            stream_id: "s".to_string(),
            stream_partition: 0,
            number_last: 10,
        };

        let (_, outcome) = run(storage, request).await;
        assert!(outcome.is_err());
    }
}
