//! Tiered fulfillment of historical-data requests.
//!
//! A resend request is tried against a list of strategies in order, stopping
//! at the first one that fulfills it: local storage (L1), currently
//! connected neighbors (L2), then tracker-located storage nodes (L3).

use starling_api::protocol::{
    ResendRequest, StorageNodesResponse, UnicastMessage,
};
use starling_api::{BoxFut, NodeId, RequestId, SlResult, TrackerId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

mod local;
pub use local::LocalResendStrategy;

mod proxied;
pub use proxied::ResendRouter;

mod neighbors;
pub use neighbors::{AskNeighborsResendStrategy, GetNeighbors};

mod storage_nodes;
pub use storage_nodes::{
    GetTracker, IsSubscribed, StorageNodeResendStrategy,
};

/// How a resend attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendOutcome {
    /// The request was answered, possibly with zero messages.
    Fulfilled,
    /// Nobody reachable had anything to resend.
    NoResend,
}

/// One element of a resend answer as consumed by the requester side.
#[derive(Debug, Clone, PartialEq)]
pub enum ResendResponseItem {
    /// One historical message.
    Message(UnicastMessage),
    /// Terminal marker; nothing follows.
    Done(ResendOutcome),
}

/// Where a strategy pushes the messages it produces. Bounded, so a slow
/// consumer back-pressures the producing query or relay.
pub type ResendSink = mpsc::Sender<UnicastMessage>;

/// One tier of resend fulfillment.
pub trait ResendStrategy: 'static + Send + Sync + std::fmt::Debug {
    /// Attempt to answer `request`, pushing messages into `sink`.
    ///
    /// `source` is the peer the request was relayed from, or None for a
    /// locally originated request. Strategies that would recurse through
    /// the network (L2/L3) answer [ResendOutcome::NoResend] for relayed
    /// requests.
    fn resend(
        &self,
        request: ResendRequest,
        source: Option<NodeId>,
        sink: ResendSink,
    ) -> BoxFut<'static, SlResult<ResendOutcome>>;

    /// A tracker answered a storage nodes request; only L3 cares.
    fn on_storage_nodes_response(
        &self,
        response: StorageNodesResponse,
        tracker: TrackerId,
    ) {
        drop((response, tracker));
    }

    /// Release any long-lived resources; used on shutdown.
    fn stop(&self) {}
}

/// Trait-object [ResendStrategy].
pub type DynResendStrategy = Arc<dyn ResendStrategy>;

type SessionMap = HashMap<NodeId, HashMap<RequestId, AbortHandle>>;

/// Runs resend requests through the configured strategy tiers and owns the
/// lifecycle of every in-flight resend: cancellation when a requester
/// disconnects, pausing while a requester's connection is back-pressured.
pub struct ResendHandler {
    strategies: Vec<DynResendStrategy>,
    sessions: Arc<Mutex<SessionMap>>,
    pause_flags: Mutex<HashMap<NodeId, watch::Sender<bool>>>,
}

impl std::fmt::Debug for ResendHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResendHandler")
            .field("strategies", &self.strategies)
            .finish_non_exhaustive()
    }
}

impl ResendHandler {
    /// Construct a handler trying `strategies` in order.
    pub fn new(strategies: Vec<DynResendStrategy>) -> Self {
        Self {
            strategies,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            pause_flags: Mutex::new(HashMap::new()),
        }
    }

    /// Start answering a request. The returned receiver yields the
    /// response messages followed by exactly one [ResendResponseItem::Done]
    /// marker. Dropping the receiver cancels the resend, including any
    /// underlying storage query or relay.
    pub fn handle_request(
        &self,
        request: ResendRequest,
        source: Option<NodeId>,
    ) -> mpsc::Receiver<ResendResponseItem> {
        let (out_tx, out_rx) = mpsc::channel(64);
        let strategies = self.strategies.clone();
        let request_id = request.request_id().clone();
        let session_key = source.clone();

        let task = tokio::spawn(async move {
            let outcome = run_strategies(strategies, request, source, &out_tx).await;
            let _ = out_tx.send(ResendResponseItem::Done(outcome)).await;
        });

        if let Some(node) = session_key {
            self.sessions
                .lock()
                .unwrap()
                .entry(node.clone())
                .or_default()
                .insert(request_id.clone(), task.abort_handle());
            // completed sessions clean their own entry
            let sessions = self.sessions.clone();
            tokio::spawn(async move {
                let _ = task.await;
                let mut sessions = sessions.lock().unwrap();
                if let Some(per_node) = sessions.get_mut(&node) {
                    per_node.remove(&request_id);
                    if per_node.is_empty() {
                        sessions.remove(&node);
                    }
                }
            });
        }
        out_rx
    }

    /// Abort every in-flight resend requested by `node`, returning the ids
    /// of the aborted requests.
    pub fn cancel_resends_of_node(&self, node: &NodeId) -> Vec<RequestId> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.remove(node) {
            Some(per_node) => per_node
                .into_iter()
                .map(|(request_id, task)| {
                    task.abort();
                    request_id
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Stop streaming responses to `node` until resumed.
    pub fn pause_resends_of_node(&self, node: NodeId) {
        let mut flags = self.pause_flags.lock().unwrap();
        flags
            .entry(node)
            .or_insert_with(|| watch::channel(false).0)
            .send_replace(true);
    }

    /// Resume streaming responses to `node`.
    pub fn resume_resends_of_node(&self, node: &NodeId) {
        if let Some(flag) = self.pause_flags.lock().unwrap().get(node) {
            flag.send_replace(false);
        }
    }

    /// Wait until responses to `node` are allowed to flow.
    pub async fn wait_until_resumed(&self, node: &NodeId) {
        let mut rx = {
            match self.pause_flags.lock().unwrap().get(node) {
                Some(flag) => flag.subscribe(),
                None => return,
            }
        };
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Cancel everything and release strategy resources.
    pub fn stop(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        for (_, per_node) in sessions.drain() {
            for (_, task) in per_node {
                task.abort();
            }
        }
        drop(sessions);
        for strategy in &self.strategies {
            strategy.stop();
        }
    }

    /// Forward a tracker's storage nodes answer to the strategies.
    pub fn on_storage_nodes_response(
        &self,
        response: StorageNodesResponse,
        tracker: TrackerId,
    ) {
        for strategy in &self.strategies {
            strategy.on_storage_nodes_response(response.clone(), tracker.clone());
        }
    }
}

/// Try each strategy in order until one fulfills the request. A strategy
/// error is logged and treated as "nothing to resend" from that tier.
async fn run_strategies(
    strategies: Vec<DynResendStrategy>,
    request: ResendRequest,
    source: Option<NodeId>,
    out: &mpsc::Sender<ResendResponseItem>,
) -> ResendOutcome {
    for strategy in strategies {
        let (tx, mut rx) = mpsc::channel::<UnicastMessage>(16);
        // forward concurrently so the strategy is never blocked on a full
        // channel after the requester went away
        let out_tx = out.clone();
        let forward = tokio::spawn(async move {
            let mut delivering = true;
            while let Some(message) = rx.recv().await {
                if delivering
                    && out_tx
                        .send(ResendResponseItem::Message(message))
                        .await
                        .is_err()
                {
                    delivering = false;
                }
            }
            delivering
        });

        let result = strategy.resend(request.clone(), source.clone(), tx).await;
        let requester_alive = forward.await.unwrap_or(false);
        if !requester_alive {
            return ResendOutcome::NoResend;
        }
        match result {
            Ok(ResendOutcome::Fulfilled) => return ResendOutcome::Fulfilled,
            Ok(ResendOutcome::NoResend) => continue,
            Err(e) => {
                tracing::warn!(
                    request_id = %request.request_id(),
                    strategy = ?strategy,
                    "resend strategy failed: {e}"
                );
                continue;
            }
        }
    }
    ResendOutcome::NoResend
}
