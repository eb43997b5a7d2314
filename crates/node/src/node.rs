//! The node-side gossip and reconciliation state machine.

use crate::buffer::{MessageBuffer, SeenButNotPropagatedSet};
use crate::config::NodeConfig;
use crate::detector::DetectorError;
use crate::events::NodeEvent;
use crate::resend::{
    AskNeighborsResendStrategy, DynResendStrategy, LocalResendStrategy,
    ResendHandler, ResendResponseItem, ResendRouter,
    StorageNodeResendStrategy,
};
use crate::retry::InstructionRetryManager;
use crate::stream_manager::{StreamError, StreamManager};
use crate::throttler::{InstructionHandler, InstructionThrottler};
use starling_api::protocol::{
    InstructionMessage, Location, NodeMessage, ResendRequest,
    ResendResponse, Status, StorageNodesResponse, UnicastMessage,
};
use starling_api::registry::DynTrackerRegistry;
use starling_api::storage::{
    DynStorage, DynStorageConfig, StorageConfigListener,
};
use starling_api::transport::{
    DisconnectionReason, DynNodeTransport, DynTrackerTransport,
    NodeTransportHandler, TrackerTransportHandler,
};
use starling_api::{
    NodeId, StreamMessage, StreamPartition, TrackerId,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Collaborators and configuration for constructing a [Node].
pub struct NodeOptions {
    /// The node ↔ node endpoint.
    pub node_transport: DynNodeTransport,
    /// The node → tracker endpoint.
    pub tracker_transport: DynTrackerTransport,
    /// Deterministic stream → tracker assignment.
    pub tracker_registry: DynTrackerRegistry,
    /// Local message store; present on storage-role nodes.
    pub storage: Option<DynStorage>,
    /// Stream assignments driving a storage node's subscriptions.
    pub storage_config: Option<DynStorageConfig>,
    /// This node's self-reported location, if it knows one.
    pub location: Option<Location>,
    /// Tunables.
    pub config: NodeConfig,
}

/// A starling network node.
///
/// Owns the per-stream registry, buffers undeliverable messages, reconciles
/// neighbor sets against tracker instructions, gossips data messages, and
/// delegates historical-data requests through the resend tiers. All mutable
/// state is keyed per stream and owned here; inbound transport events drive
/// every mutation.
pub struct Node {
    inner: Arc<NodeInner>,
    events_rx: Mutex<Option<mpsc::Receiver<NodeEvent>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.inner.node_id)
            .finish_non_exhaustive()
    }
}

pub(crate) struct NodeInner {
    me: Weak<NodeInner>,
    config: NodeConfig,
    node_id: NodeId,
    started: String,
    location: Option<Location>,
    is_storage: bool,
    node_transport: DynNodeTransport,
    tracker_transport: DynTrackerTransport,
    tracker_registry: DynTrackerRegistry,
    storage_config: Option<DynStorageConfig>,
    streams: Mutex<StreamManager>,
    buffer: Mutex<MessageBuffer>,
    seen_but_not_propagated: Mutex<SeenButNotPropagatedSet>,
    delivery_failures: Mutex<HashMap<NodeId, u32>>,
    /// tracker address → id, filled as bootstrap connections come up
    tracker_book: Mutex<HashMap<String, TrackerId>>,
    /// per tracker, when RTTs may next be attached to a status
    rtt_deadlines: Mutex<HashMap<TrackerId, Instant>>,
    disconnect_timers: Mutex<HashMap<NodeId, AbortHandle>>,
    throttler: InstructionThrottler,
    retry_manager: InstructionRetryManager,
    resend_handler: ResendHandler,
    resend_router: ResendRouter,
    events_tx: mpsc::Sender<NodeEvent>,
    background_tasks: Mutex<Vec<AbortHandle>>,
}

impl Node {
    /// Construct a node over its collaborators. Call [Node::start] to
    /// register transport handlers and begin the bootstrap loops.
    pub fn new(opts: NodeOptions) -> Self {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let node_id = opts.node_transport.local_node_id();
        let started = {
            let unix = std::time::SystemTime::now()
                .duration_since(std::time::SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            format!("{unix}")
        };

        let inner = Arc::new_cyclic(|weak: &Weak<NodeInner>| {
            let handler: InstructionHandler = {
                let weak = weak.clone();
                Arc::new(move |instruction, tracker, reattempt| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        if let Some(inner) = weak.upgrade() {
                            inner
                                .handle_tracker_instruction(
                                    instruction,
                                    tracker,
                                    reattempt,
                                )
                                .await;
                        }
                    })
                })
            };

            let resend_router = ResendRouter::new();
            let resend_handler = ResendHandler::new(build_strategies(
                weak.clone(),
                &opts,
                resend_router.clone(),
            ));

            NodeInner {
                me: weak.clone(),
                node_id: node_id.clone(),
                started,
                location: opts.location.clone(),
                is_storage: opts.storage.is_some(),
                node_transport: opts.node_transport.clone(),
                tracker_transport: opts.tracker_transport.clone(),
                tracker_registry: opts.tracker_registry.clone(),
                storage_config: opts.storage_config.clone(),
                streams: Mutex::new(StreamManager::new(
                    opts.config.max_gap_count,
                )),
                buffer: Mutex::new(MessageBuffer::new(
                    opts.config.buffer_timeout(),
                    opts.config.buffer_max_size,
                )),
                seen_but_not_propagated: Mutex::new(
                    SeenButNotPropagatedSet::new(
                        opts.config.seen_but_not_propagated_max_size,
                    ),
                ),
                delivery_failures: Mutex::new(HashMap::new()),
                tracker_book: Mutex::new(HashMap::new()),
                rtt_deadlines: Mutex::new(HashMap::new()),
                disconnect_timers: Mutex::new(HashMap::new()),
                throttler: InstructionThrottler::new(handler.clone()),
                retry_manager: InstructionRetryManager::new(
                    handler,
                    opts.config.instruction_retry_interval(),
                    opts.config.status_send_counter_limit,
                ),
                resend_handler,
                resend_router,
                events_tx,
                background_tasks: Mutex::new(Vec::new()),
                config: opts.config,
            }
        });

        Self {
            inner,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Register transport handlers, subscribe to assigned storage streams,
    /// and start the bootstrap-tracker and buffer-expiry loops.
    pub fn start(&self) {
        let inner = &self.inner;
        tracing::debug!(node_id = %inner.node_id, "starting node");

        inner.node_transport.register_handler(Arc::new(
            NodeTransportEvents {
                inner: Arc::downgrade(inner),
            },
        ));
        inner.tracker_transport.register_handler(Arc::new(
            TrackerTransportEvents {
                inner: Arc::downgrade(inner),
            },
        ));

        if let Some(storage_config) = &inner.storage_config {
            for stream in storage_config.streams() {
                inner.subscribe_to_stream_if_have_not_yet(&stream, true);
            }
            storage_config.register_listener(Arc::new(StorageAssignments {
                inner: Arc::downgrade(inner),
            }));
        }

        let mut tasks = inner.background_tasks.lock().unwrap();
        tasks.push(
            tokio::spawn(bootstrap_tracker_loop(Arc::downgrade(inner)))
                .abort_handle(),
        );
        tasks.push(
            tokio::spawn(buffer_sweep_loop(Arc::downgrade(inner)))
                .abort_handle(),
        );
    }

    /// Take the event stream. Yields None after the first call.
    pub fn take_events(&self) -> Option<mpsc::Receiver<NodeEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// The transport-assigned id of this node.
    pub fn node_id(&self) -> NodeId {
        self.inner.node_id.clone()
    }

    /// Streams this node is currently subscribed to.
    pub fn streams(&self) -> Vec<StreamPartition> {
        self.inner.streams.lock().unwrap().streams()
    }

    /// Every gossip neighbor across all streams.
    pub fn neighbors(&self) -> Vec<NodeId> {
        self.inner.streams.lock().unwrap().all_nodes()
    }

    /// Subscribe to a stream, telling the responsible tracker.
    pub fn subscribe_to_stream(&self, stream: &StreamPartition) {
        self.inner.subscribe_to_stream_if_have_not_yet(stream, true);
    }

    /// Unsubscribe from a stream, canceling its instruction handling and
    /// telling the responsible tracker.
    pub fn unsubscribe_from_stream(&self, stream: &StreamPartition) {
        self.inner.unsubscribe_from_stream(stream);
    }

    /// Publish a message from this node into the gossip mesh.
    pub fn publish(&self, message: StreamMessage) {
        self.inner.on_data_received(message, None);
    }

    /// Request historical data for a locally originated subscription.
    /// The receiver yields messages followed by one terminal marker.
    pub fn request_resend(
        &self,
        request: ResendRequest,
    ) -> mpsc::Receiver<ResendResponseItem> {
        self.inner.on_resend_request(request, None)
    }

    /// Stop background work and cancel all in-flight handling.
    pub fn stop(&self) {
        let inner = &self.inner;
        tracing::debug!(node_id = %inner.node_id, "stopping node");
        for task in inner.background_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        for (_, timer) in inner.disconnect_timers.lock().unwrap().drain() {
            timer.abort();
        }
        inner.throttler.reset();
        inner.retry_manager.reset();
        inner.resend_handler.stop();
        inner.buffer.lock().unwrap().clear();
    }
}

/// Compose the resend tiers: a node with local storage answers from it,
/// anyone else escalates through neighbors and then storage nodes.
fn build_strategies(
    weak: Weak<NodeInner>,
    opts: &NodeOptions,
    router: ResendRouter,
) -> Vec<DynResendStrategy> {
    match opts.storage.clone() {
        Some(storage) => vec![Arc::new(LocalResendStrategy::new(storage))],
        None => {
            let get_neighbors = {
                let weak = weak.clone();
                Arc::new(move |stream: &StreamPartition| match weak.upgrade() {
                    Some(inner) => inner
                        .streams
                        .lock()
                        .unwrap()
                        .outbound_nodes(stream)
                        .unwrap_or_default(),
                    None => Vec::new(),
                })
            };
            let get_tracker = {
                let weak = weak.clone();
                Arc::new(move |stream: &StreamPartition| {
                    weak.upgrade()?.tracker_id_for(stream)
                })
            };
            let is_subscribed = {
                let weak = weak.clone();
                Arc::new(move |node: &NodeId| match weak.upgrade() {
                    Some(inner) => {
                        inner.streams.lock().unwrap().is_node_present(node)
                    }
                    None => false,
                })
            };
            vec![
                Arc::new(AskNeighborsResendStrategy::new(
                    opts.node_transport.clone(),
                    router.clone(),
                    get_neighbors,
                    opts.config.resend_max_tries,
                    opts.config.resend_timeout(),
                )),
                Arc::new(StorageNodeResendStrategy::new(
                    opts.node_transport.clone(),
                    opts.tracker_transport.clone(),
                    router,
                    get_tracker,
                    is_subscribed,
                    opts.config.resend_timeout(),
                )),
            ]
        }
    }
}

impl NodeInner {
    /// The owning Arc; infallible while any strong reference is alive,
    /// which a `&self` borrow guarantees.
    fn to_arc(&self) -> Arc<NodeInner> {
        self.me.upgrade().expect("NodeInner is alive")
    }

    fn emit(&self, event: NodeEvent) {
        if self.events_tx.try_send(event).is_err() {
            tracing::trace!("event listener lagging, event dropped");
        }
    }

    /// The connected tracker responsible for a stream, if any.
    fn tracker_id_for(&self, stream: &StreamPartition) -> Option<TrackerId> {
        let info = self.tracker_registry.tracker_for(stream);
        self.tracker_book.lock().unwrap().get(&info.address).cloned()
    }

    fn subscribe_to_stream_if_have_not_yet(
        &self,
        stream: &StreamPartition,
        send_status: bool,
    ) {
        let fresh = {
            let mut streams = self.streams.lock().unwrap();
            !streams.is_set_up(stream)
                && streams.set_up_stream(stream.clone()).is_ok()
        };
        if fresh {
            tracing::debug!(%stream, "subscribed to stream");
            if send_status {
                self.send_stream_status(stream);
            }
        }
    }

    fn unsubscribe_from_stream(&self, stream: &StreamPartition) {
        tracing::debug!(%stream, "unsubscribing from stream");
        let removed =
            self.streams.lock().unwrap().remove_stream(stream).is_ok();
        self.throttler.remove_stream(stream);
        self.retry_manager.remove_stream(stream);
        if removed {
            self.send_stream_status(stream);
        }
    }

    /// Report a stream's state to its tracker: a single-stream status while
    /// the stream is set up, a full reconciling status right after it was
    /// removed.
    fn send_stream_status(&self, stream: &StreamPartition) {
        let Some(tracker) = self.tracker_id_for(stream) else {
            tracing::trace!(%stream, "no tracker connected for stream status");
            return;
        };
        let single = if self.streams.lock().unwrap().is_set_up(stream) {
            Some(stream.clone())
        } else {
            None
        };
        self.send_status(tracker, single);
    }

    fn send_status(
        &self,
        tracker: TrackerId,
        single: Option<StreamPartition>,
    ) {
        let status = self.build_status(&tracker, single);
        let this = self.to_arc();
        tokio::spawn(async move {
            match this.tracker_transport.send_status(tracker.clone(), status).await
            {
                Ok(()) => {
                    tracing::trace!(%tracker, "sent status to tracker");
                }
                Err(e) => {
                    tracing::debug!(%tracker, "failed to send status: {e}");
                }
            }
        });
    }

    fn build_status(
        &self,
        tracker: &TrackerId,
        single: Option<StreamPartition>,
    ) -> Status {
        let streams = self.streams.lock().unwrap().streams_with_connections(
            |stream| {
                if let Some(single) = &single {
                    if single != stream {
                        return false;
                    }
                }
                self.tracker_id_for(stream).as_ref() == Some(tracker)
            },
        );
        Status {
            streams,
            rtts: self
                .should_include_rtts(tracker)
                .then(|| self.node_transport.rtts()),
            location: self.location.clone(),
            started: self.started.clone(),
            single_stream: single.is_some(),
        }
    }

    /// RTT maps ride along at most once per interval per tracker.
    fn should_include_rtts(&self, tracker: &TrackerId) -> bool {
        let mut deadlines = self.rtt_deadlines.lock().unwrap();
        let now = Instant::now();
        match deadlines.get(tracker) {
            Some(deadline) if now < *deadline => false,
            _ => {
                deadlines.insert(
                    tracker.clone(),
                    now + self.config.rtt_update_interval(),
                );
                true
            }
        }
    }

    /// Apply one tracker instruction: diff the stream's neighbor set
    /// against the instructed one, connect and subscribe to additions,
    /// unsubscribe removals, then report status if needed.
    async fn handle_tracker_instruction(
        &self,
        instruction: InstructionMessage,
        tracker: TrackerId,
        reattempt: bool,
    ) {
        let stream = instruction.stream_partition();
        self.retry_manager.add(instruction.clone(), tracker.clone());

        let expected = self.tracker_id_for(&stream);
        if expected.as_ref() != Some(&tracker) {
            tracing::warn!(
                %stream,
                got = %tracker,
                expected = ?expected,
                "instruction from unexpected tracker, ignoring"
            );
            return;
        }

        tracing::debug!(
            %stream,
            counter = instruction.counter,
            nodes = ?instruction.node_ids,
            "handling tracker instruction"
        );
        self.subscribe_to_stream_if_have_not_yet(&stream, false);

        let current = self
            .streams
            .lock()
            .unwrap()
            .all_nodes_for_stream(&stream)
            .unwrap_or_default();
        for node in current
            .into_iter()
            .filter(|node| !instruction.node_ids.contains(node))
        {
            self.unsubscribe_from_stream_on_node(&node, &stream);
        }

        let stream_ref = &stream;
        let tracker_ref = &tracker;
        let attempts =
            instruction.node_ids.iter().map(|node| async move {
                let connect = self.node_transport.connect_to_node(
                    node.clone(),
                    tracker_ref.clone(),
                );
                match tokio::time::timeout(
                    self.config.node_connect_timeout(),
                    connect,
                )
                .await
                {
                    Ok(Ok(_)) => {
                        self.cancel_disconnect_timer(node);
                        self.subscribe_to_stream_on_node(node, stream_ref);
                        Ok(())
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(
                            %node,
                            "failed to connect to instructed node: {e}"
                        );
                        Err(())
                    }
                    Err(_) => {
                        tracing::debug!(
                            %node,
                            "connecting to instructed node timed out"
                        );
                        Err(())
                    }
                }
            });
        let results = futures::future::join_all(attempts).await;

        {
            let mut streams = self.streams.lock().unwrap();
            if streams.is_set_up(&stream) {
                let _ = streams.update_counter(&stream, instruction.counter);
            }
        }

        let failed = results.iter().any(|r| r.is_err());
        if failed {
            tracing::debug!(
                %stream,
                counter = instruction.counter,
                "failed to fulfill all tracker instructions"
            );
        }
        if !reattempt || failed {
            self.send_stream_status(&stream);
        }
    }

    fn subscribe_to_stream_on_node(
        &self,
        node: &NodeId,
        stream: &StreamPartition,
    ) {
        {
            let mut streams = self.streams.lock().unwrap();
            let _ = streams.add_inbound_node(stream, node.clone());
            let _ = streams.add_outbound_node(stream, node.clone());
        }
        self.emit(NodeEvent::NodeSubscribed {
            node: node.clone(),
            stream: stream.clone(),
        });
        // a fresh outbound neighbor may unblock buffered messages
        self.handle_buffered_messages(stream);
    }

    fn unsubscribe_from_stream_on_node(
        &self,
        node: &NodeId,
        stream: &StreamPartition,
    ) {
        let present = {
            let mut streams = self.streams.lock().unwrap();
            let _ = streams.remove_node_from_stream(stream, node);
            streams.is_node_present(node)
        };
        tracing::debug!(%node, %stream, "node unsubscribed from stream");
        self.emit(NodeEvent::NodeUnsubscribed {
            node: node.clone(),
            stream: stream.clone(),
        });
        if !present {
            self.schedule_disconnect_if_still_unused(node.clone());
        }
    }

    /// Disconnect a neighbor sharing no streams after a grace period, in
    /// case a new instruction brings it right back.
    fn schedule_disconnect_if_still_unused(&self, node: NodeId) {
        self.cancel_disconnect_timer(&node);
        let this = self.to_arc();
        let task = tokio::spawn({
            let node = node.clone();
            async move {
                tokio::time::sleep(this.config.disconnection_wait_time())
                    .await;
                this.disconnect_timers.lock().unwrap().remove(&node);
                let unused =
                    !this.streams.lock().unwrap().is_node_present(&node);
                if unused {
                    tracing::debug!(
                        %node,
                        "no shared streams with node, disconnecting"
                    );
                    this.node_transport
                        .disconnect_from_node(
                            node,
                            DisconnectionReason::NoSharedStreams,
                        )
                        .await;
                }
            }
        });
        self.disconnect_timers
            .lock()
            .unwrap()
            .insert(node, task.abort_handle());
    }

    fn cancel_disconnect_timer(&self, node: &NodeId) {
        if let Some(timer) = self.disconnect_timers.lock().unwrap().remove(node)
        {
            timer.abort();
        }
    }

    /// Ingest one data message: auto-subscribe, dedup, propagate.
    fn on_data_received(
        &self,
        message: StreamMessage,
        source: Option<NodeId>,
    ) {
        let stream = message.message_id.stream_partition();
        self.emit(NodeEvent::MessageReceived {
            message: message.clone(),
            source: source.clone(),
        });
        self.subscribe_to_stream_if_have_not_yet(&stream, true);

        let check = self
            .streams
            .lock()
            .unwrap()
            .mark_numbers_and_check_that_is_not_duplicate(
                &message.message_id,
                message.prev_msg_ref,
            );
        let unseen = match check {
            Ok(unseen) => unseen,
            Err(StreamError::Detector(DetectorError::InvalidNumbering {
                ..
            })) => {
                tracing::debug!(
                    ?source,
                    message_id = ?message.message_id,
                    "received data with invalid numbering, dropping"
                );
                return;
            }
            Err(StreamError::Detector(e @ DetectorError::GapMismatch {
                ..
            })) => {
                tracing::warn!(
                    ?source,
                    message_id = ?message.message_id,
                    "gap mismatch detected, dropping: {e}"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(
                    ?source,
                    message_id = ?message.message_id,
                    "duplicate check failed, dropping: {e}"
                );
                return;
            }
        };

        if unseen {
            self.emit(NodeEvent::UnseenMessageReceived {
                message: message.clone(),
                source: source.clone(),
            });
        }
        let pending_propagation = self
            .seen_but_not_propagated
            .lock()
            .unwrap()
            .contains(&message.message_id);
        if unseen || pending_propagation {
            self.propagate_message(message, source);
        } else {
            tracing::trace!(
                ?source,
                message_id = ?message.message_id,
                "ignoring duplicate data"
            );
            self.emit(NodeEvent::DuplicateMessageReceived {
                message_id: message.message_id,
                source,
            });
        }
    }

    /// Forward a message to every outbound neighbor except its sender,
    /// buffering it instead when no neighbor is eligible.
    fn propagate_message(
        &self,
        message: StreamMessage,
        source: Option<NodeId>,
    ) {
        let stream = message.message_id.stream_partition();
        let targets: Vec<NodeId> = self
            .streams
            .lock()
            .unwrap()
            .outbound_nodes(&stream)
            .unwrap_or_default()
            .into_iter()
            .filter(|node| Some(node) != source.as_ref())
            .collect();

        if targets.is_empty() {
            tracing::debug!(
                message_id = ?message.message_id,
                "no eligible neighbors, buffering message"
            );
            self.seen_but_not_propagated
                .lock()
                .unwrap()
                .add(&message.message_id);
            self.buffer.lock().unwrap().put(stream, message, source);
            return;
        }

        for target in targets {
            let this = self.to_arc();
            let message = message.clone();
            tokio::spawn(async move {
                this.send_data_to_neighbor(target, message).await;
            });
        }
        self.seen_but_not_propagated
            .lock()
            .unwrap()
            .remove(&message.message_id);
        self.emit(NodeEvent::MessagePropagated {
            message_id: message.message_id,
        });
    }

    /// One fire-and-forget delivery. Failures feed a consecutive-failure
    /// count that force-disconnects the neighbor once it trips the limit,
    /// correcting a transport that believes a dead connection is alive.
    async fn send_data_to_neighbor(
        &self,
        target: NodeId,
        message: StreamMessage,
    ) {
        let result = self
            .node_transport
            .send(target.clone(), NodeMessage::Broadcast(message.clone()))
            .await;
        match result {
            Ok(()) => {
                self.delivery_failures.lock().unwrap().remove(&target);
            }
            Err(e) => {
                let failures = {
                    let mut map = self.delivery_failures.lock().unwrap();
                    let count = map.entry(target.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                tracing::warn!(
                    %target,
                    failures,
                    message_id = ?message.message_id,
                    "failed to propagate message: {e}"
                );
                self.emit(NodeEvent::MessagePropagationFailed {
                    message_id: message.message_id,
                    node: target.clone(),
                });
                if failures >= self.config.max_consecutive_delivery_failures {
                    tracing::warn!(
                        %target,
                        "too many consecutive delivery failures, disconnecting"
                    );
                    self.delivery_failures.lock().unwrap().remove(&target);
                    self.node_transport
                        .disconnect_from_node(
                            target.clone(),
                            DisconnectionReason::DeadConnection,
                        )
                        .await;
                    self.on_node_disconnected(target);
                }
            }
        }
    }

    /// Re-ingest messages parked for a stream, now that it has a neighbor.
    fn handle_buffered_messages(&self, stream: &StreamPartition) {
        let buffered = self.buffer.lock().unwrap().pop_all(stream);
        for (message, source) in buffered {
            self.on_data_received(message, source);
        }
    }

    /// Handle a resend request from a peer or the local application.
    fn on_resend_request(
        &self,
        request: ResendRequest,
        source: Option<NodeId>,
    ) -> mpsc::Receiver<ResendResponseItem> {
        tracing::debug!(
            request_id = %request.request_id(),
            ?source,
            "resend request received"
        );
        self.emit(NodeEvent::ResendRequestReceived {
            request: request.clone(),
            source: source.clone(),
        });
        if self.is_storage {
            self.subscribe_to_stream_if_have_not_yet(
                &request.stream_partition(),
                true,
            );
        }
        let rx = self.resend_handler.handle_request(request.clone(), source.clone());
        match source {
            Some(peer) => {
                let this = self.to_arc();
                tokio::spawn(async move {
                    proxy_request_stream(this, peer, request, rx).await;
                });
                // remote requesters are answered over the wire
                let (_, empty) = mpsc::channel(1);
                empty
            }
            None => rx,
        }
    }

    fn on_node_connected(&self, node: NodeId) {
        tracing::debug!(%node, "node connected");
        self.emit(NodeEvent::NodeConnected { node });
    }

    /// A neighbor went away: abandon its resends, scrub it from every
    /// stream, and re-report the affected streams to their trackers.
    fn on_node_disconnected(&self, node: NodeId) {
        let canceled = self.resend_handler.cancel_resends_of_node(&node);
        if !canceled.is_empty() {
            tracing::debug!(
                %node,
                requests = ?canceled,
                "canceled resends of disconnected node"
            );
        }
        self.resend_router.route_disconnected(node.clone());
        self.delivery_failures.lock().unwrap().remove(&node);
        self.cancel_disconnect_timer(&node);

        let affected = self
            .streams
            .lock()
            .unwrap()
            .remove_node_from_all_streams(&node);
        tracing::debug!(%node, "removed all subscriptions of node");

        let trackers: HashSet<TrackerId> = affected
            .iter()
            .filter_map(|stream| self.tracker_id_for(stream))
            .collect();
        for tracker in trackers {
            self.send_status(tracker, None);
        }
        self.emit(NodeEvent::NodeDisconnected { node });
    }

    fn on_tracker_connected(&self, tracker: TrackerId) {
        tracing::debug!(%tracker, "connected to tracker");
        self.send_status(tracker, None);
    }

    fn on_tracker_disconnected(&self, tracker: TrackerId) {
        tracing::debug!(%tracker, "disconnected from tracker");
        self.tracker_book.lock().unwrap().retain(|_, id| *id != tracker);
        self.rtt_deadlines.lock().unwrap().remove(&tracker);
    }

    fn on_storage_nodes_response(
        &self,
        response: StorageNodesResponse,
        tracker: TrackerId,
    ) {
        self.resend_handler.on_storage_nodes_response(response, tracker);
    }
}

/// Stream a resend answer back to a remote requester, framed exactly as
/// the requester's own relay expects: `Resending` before the first message,
/// then the messages, then `Resent`; or a bare `NoResend` when no data
/// flowed. A failed send cancels all of that requester's resends.
async fn proxy_request_stream(
    inner: Arc<NodeInner>,
    peer: NodeId,
    request: ResendRequest,
    mut rx: mpsc::Receiver<ResendResponseItem>,
) {
    let stream = request.stream_partition();
    let request_id = request.request_id().clone();
    let mut sent_any = false;

    let send = |message: NodeMessage| {
        let inner = inner.clone();
        let peer = peer.clone();
        async move { inner.node_transport.send(peer, message).await }
    };

    while let Some(item) = rx.recv().await {
        match item {
            ResendResponseItem::Message(unicast) => {
                inner.resend_handler.wait_until_resumed(&peer).await;
                if !sent_any {
                    let resending = ResendResponse::Resending {
                        request_id: request_id.clone(),
                        stream_id: stream.stream_id().to_string(),
                        stream_partition: stream.partition(),
                    };
                    if let Err(e) =
                        send(NodeMessage::ResendResponse(resending)).await
                    {
                        cancel_after_send_failure(&inner, &peer, e);
                        return;
                    }
                }
                let unicast = UnicastMessage {
                    request_id: request_id.clone(),
                    ..unicast
                };
                if let Err(e) = send(NodeMessage::Unicast(unicast)).await {
                    cancel_after_send_failure(&inner, &peer, e);
                    return;
                }
                sent_any = true;
            }
            ResendResponseItem::Done(outcome) => {
                tracing::trace!(
                    %request_id,
                    ?outcome,
                    sent_any,
                    "resend for peer finished"
                );
                let terminal = if sent_any {
                    ResendResponse::Resent {
                        request_id: request_id.clone(),
                        stream_id: stream.stream_id().to_string(),
                        stream_partition: stream.partition(),
                    }
                } else {
                    ResendResponse::NoResend {
                        request_id: request_id.clone(),
                        stream_id: stream.stream_id().to_string(),
                        stream_partition: stream.partition(),
                    }
                };
                if let Err(e) =
                    send(NodeMessage::ResendResponse(terminal)).await
                {
                    cancel_after_send_failure(&inner, &peer, e);
                }
                return;
            }
        }
    }
}

fn cancel_after_send_failure(
    inner: &Arc<NodeInner>,
    peer: &NodeId,
    error: starling_api::SlError,
) {
    let canceled = inner.resend_handler.cancel_resends_of_node(peer);
    tracing::warn!(
        %peer,
        requests = ?canceled,
        "failed to send resend response, canceling peer's resends: {error}"
    );
}

/// Keeps bootstrap connections to every configured tracker alive.
async fn bootstrap_tracker_loop(weak: Weak<NodeInner>) {
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let interval = inner.config.tracker_connection_maintenance_interval();
        for info in inner.tracker_registry.all_trackers() {
            match inner
                .tracker_transport
                .connect_to_tracker(&info.address)
                .await
            {
                Ok(tracker_id) => {
                    inner
                        .tracker_book
                        .lock()
                        .unwrap()
                        .insert(info.address.clone(), tracker_id);
                }
                Err(e) => {
                    tracing::warn!(
                        address = %info.address,
                        "could not connect to tracker: {e}"
                    );
                }
            }
        }
        drop(inner);
        tokio::time::sleep(interval).await;
    }
}

/// Periodically expires aged-out buffered messages.
async fn buffer_sweep_loop(weak: Weak<NodeInner>) {
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let interval = inner.config.buffer_timeout() / 2;
        inner.buffer.lock().unwrap().sweep();
        drop(inner);
        tokio::time::sleep(interval).await;
    }
}

/// Routes node ↔ node transport events into the node.
struct NodeTransportEvents {
    inner: Weak<NodeInner>,
}

impl std::fmt::Debug for NodeTransportEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTransportEvents").finish_non_exhaustive()
    }
}

impl NodeTransportHandler for NodeTransportEvents {
    fn on_node_connected(&self, node: NodeId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_node_connected(node);
        }
    }

    fn on_node_disconnected(&self, node: NodeId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_node_disconnected(node);
        }
    }

    fn on_message(&self, message: NodeMessage, source: NodeId) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match message {
            NodeMessage::Broadcast(message) => {
                inner.on_data_received(message, Some(source));
            }
            NodeMessage::ResendRequest(request) => {
                let _ = inner.on_resend_request(request, Some(source));
            }
            NodeMessage::ResendResponse(response) => {
                inner.resend_router.route_response(response, source);
            }
            NodeMessage::Unicast(unicast) => {
                inner.resend_router.route_unicast(unicast, source);
            }
        }
    }

    fn on_back_pressure_high(&self, node: NodeId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.resend_handler.pause_resends_of_node(node);
        }
    }

    fn on_back_pressure_low(&self, node: NodeId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.resend_handler.resume_resends_of_node(&node);
        }
    }
}

/// Routes tracker transport events into the node.
struct TrackerTransportEvents {
    inner: Weak<NodeInner>,
}

impl std::fmt::Debug for TrackerTransportEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerTransportEvents").finish_non_exhaustive()
    }
}

impl TrackerTransportHandler for TrackerTransportEvents {
    fn on_tracker_connected(&self, tracker: TrackerId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_tracker_connected(tracker);
        }
    }

    fn on_tracker_disconnected(&self, tracker: TrackerId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_tracker_disconnected(tracker);
        }
    }

    fn on_instruction(
        &self,
        instruction: InstructionMessage,
        tracker: TrackerId,
    ) {
        if let Some(inner) = self.inner.upgrade() {
            inner.throttler.add(instruction, tracker);
        }
    }

    fn on_storage_nodes_response(
        &self,
        response: StorageNodesResponse,
        tracker: TrackerId,
    ) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_storage_nodes_response(response, tracker);
        }
    }
}

/// Follows storage assignment changes with subscriptions.
struct StorageAssignments {
    inner: Weak<NodeInner>,
}

impl std::fmt::Debug for StorageAssignments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAssignments").finish_non_exhaustive()
    }
}

impl StorageConfigListener for StorageAssignments {
    fn on_stream_added(&self, stream: StreamPartition) {
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribe_to_stream_if_have_not_yet(&stream, true);
        }
    }

    fn on_stream_removed(&self, stream: StreamPartition) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unsubscribe_from_stream(&stream);
        }
    }
}
