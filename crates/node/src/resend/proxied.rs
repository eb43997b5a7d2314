//! Relay machinery shared by the neighbor (L2) and storage-node (L3) tiers.
//!
//! A relayed resend forwards the request to one candidate peer at a time
//! and interprets that peer's unicast/control responses, falling through to
//! the next candidate on timeout, refusal, or disconnect.

use super::{ResendOutcome, ResendSink};
use starling_api::protocol::{
    NodeMessage, ResendRequest, ResendResponse, UnicastMessage,
};
use starling_api::transport::DynNodeTransport;
use starling_api::{NodeId, RequestId, SlResult};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// A transport event relevant to one in-flight relayed resend.
#[derive(Debug, Clone)]
pub(crate) enum ProxiedEvent {
    /// A historical message arrived.
    Unicast(UnicastMessage, NodeId),
    /// A control response arrived.
    Response(ResendResponse, NodeId),
    /// Some peer disconnected.
    Disconnected(NodeId),
}

type EventSender = mpsc::UnboundedSender<ProxiedEvent>;

/// Routes incoming unicast/resend-response/disconnect events to whichever
/// relay session is waiting on them, keyed by request id.
#[derive(Debug, Clone, Default)]
pub struct ResendRouter {
    sessions: Arc<Mutex<HashMap<RequestId, EventSender>>>,
}

impl ResendRouter {
    /// Construct an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, request_id: RequestId) -> Registration {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().unwrap().insert(request_id.clone(), tx);
        Registration {
            request_id,
            sessions: self.sessions.clone(),
            rx,
        }
    }

    /// Deliver a unicast message to the session awaiting it, if any.
    pub fn route_unicast(&self, message: UnicastMessage, source: NodeId) {
        if let Some(tx) =
            self.sessions.lock().unwrap().get(&message.request_id)
        {
            let _ = tx.send(ProxiedEvent::Unicast(message, source));
        }
    }

    /// Deliver a resend control response to the session awaiting it, if any.
    pub fn route_response(&self, response: ResendResponse, source: NodeId) {
        if let Some(tx) =
            self.sessions.lock().unwrap().get(response.request_id())
        {
            let _ = tx.send(ProxiedEvent::Response(response, source));
        }
    }

    /// Tell every session that a peer disconnected.
    pub fn route_disconnected(&self, node: NodeId) {
        for tx in self.sessions.lock().unwrap().values() {
            let _ = tx.send(ProxiedEvent::Disconnected(node.clone()));
        }
    }
}

/// A live session registration; deregisters itself on drop.
pub(crate) struct Registration {
    request_id: RequestId,
    sessions: Arc<Mutex<HashMap<RequestId, EventSender>>>,
    rx: mpsc::UnboundedReceiver<ProxiedEvent>,
}

impl Registration {
    async fn recv(&mut self) -> Option<ProxiedEvent> {
        self.rx.recv().await
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.sessions.lock().unwrap().remove(&self.request_id);
    }
}

/// Forward `request` to candidate peers one at a time, relaying their
/// streamed answer into `sink`.
///
/// Candidates are re-evaluated before every attempt so a topology change
/// mid-resend is picked up. The wait deadline rolls forward on every event
/// from the current peer; a silent peer, a refusal (`NoResend`) or a
/// disconnect moves on to the next candidate. The relay ends after
/// `max_tries` peers, when candidates run out, or when a peer completes
/// the resend.
pub(crate) async fn proxied_resend(
    transport: &DynNodeTransport,
    router: &ResendRouter,
    request: ResendRequest,
    sink: &ResendSink,
    candidates: impl Fn() -> Vec<NodeId>,
    max_tries: usize,
    timeout: Duration,
) -> SlResult<ResendOutcome> {
    let mut registration = router.register(request.request_id().clone());
    let mut asked: HashSet<NodeId> = HashSet::new();
    let mut forwarded_any = false;

    'candidates: while asked.len() < max_tries {
        let next = candidates()
            .into_iter()
            .find(|candidate| !asked.contains(candidate));
        let Some(peer) = next else {
            break;
        };
        asked.insert(peer.clone());

        if let Err(e) = transport
            .send(peer.clone(), NodeMessage::ResendRequest(request.clone()))
            .await
        {
            tracing::warn!(%peer, "failed to forward resend request: {e}");
            continue;
        }

        loop {
            let event =
                match tokio::time::timeout(timeout, registration.recv()).await
                {
                    // silent peer, move on
                    Err(_) => continue 'candidates,
                    Ok(None) => break 'candidates,
                    Ok(Some(event)) => event,
                };
            match event {
                ProxiedEvent::Unicast(message, source) if source == peer => {
                    if sink.send(message).await.is_err() {
                        break 'candidates;
                    }
                    forwarded_any = true;
                }
                ProxiedEvent::Response(response, source) if source == peer => {
                    match response {
                        ResendResponse::Resending { .. } => {}
                        ResendResponse::Resent { .. } => {
                            return Ok(ResendOutcome::Fulfilled);
                        }
                        ResendResponse::NoResend { .. } => {
                            continue 'candidates;
                        }
                    }
                }
                ProxiedEvent::Disconnected(node) if node == peer => {
                    continue 'candidates;
                }
                _ => {}
            }
        }
    }

    Ok(if forwarded_any {
        ResendOutcome::Fulfilled
    } else {
        ResendOutcome::NoResend
    })
}
