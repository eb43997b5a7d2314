//! Serializes tracker instruction handling per stream.

use starling_api::protocol::InstructionMessage;
use starling_api::{BoxFut, StreamPartition, TrackerId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::AbortHandle;

/// The function instructions are applied through. The final `bool` is the
/// reattempt flag: retries pass true to skip the optional status report.
pub type InstructionHandler = Arc<
    dyn Fn(InstructionMessage, TrackerId, bool) -> BoxFut<'static, ()>
        + Send
        + Sync,
>;

#[derive(Default)]
struct ThrottlerState {
    /// At most one pending instruction per stream; newer replaces older.
    pending: HashMap<StreamPartition, (InstructionMessage, TrackerId)>,
    /// Highest instruction counter seen per stream.
    last_counters: HashMap<StreamPartition, u64>,
    /// Streams with a handling task currently running.
    running: HashMap<StreamPartition, AbortHandle>,
}

/// Collapses instruction bursts so each stream has at most one handling
/// task in flight and at most one instruction queued behind it. A burst for
/// one stream resolves to "first handled, then only the latest"; different
/// streams are fully independent.
#[derive(Clone)]
pub struct InstructionThrottler {
    handler: InstructionHandler,
    state: Arc<Mutex<ThrottlerState>>,
}

impl std::fmt::Debug for InstructionThrottler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstructionThrottler").finish_non_exhaustive()
    }
}

impl InstructionThrottler {
    /// Construct a throttler applying instructions through `handler`.
    pub fn new(handler: InstructionHandler) -> Self {
        Self {
            handler,
            state: Arc::new(Mutex::new(ThrottlerState::default())),
        }
    }

    /// Queue an instruction, starting a handling task for its stream if
    /// none is running. Instructions older than the newest one seen for the
    /// stream are dropped.
    pub fn add(&self, instruction: InstructionMessage, tracker: TrackerId) {
        let stream = instruction.stream_partition();
        let mut state = self.state.lock().expect("throttler lock poisoned");
        if let Some(last) = state.last_counters.get(&stream) {
            if instruction.counter < *last {
                tracing::debug!(
                    %stream,
                    counter = instruction.counter,
                    last = *last,
                    "dropping stale instruction"
                );
                return;
            }
        }
        state.last_counters.insert(stream.clone(), instruction.counter);
        state.pending.insert(stream.clone(), (instruction, tracker));
        if !state.running.contains_key(&stream) {
            let task = tokio::spawn(run_stream(
                stream.clone(),
                self.handler.clone(),
                self.state.clone(),
            ));
            state.running.insert(stream, task.abort_handle());
        }
    }

    /// Cancel any in-flight handling and drop pending state for a stream.
    pub fn remove_stream(&self, stream: &StreamPartition) {
        let mut state = self.state.lock().expect("throttler lock poisoned");
        state.pending.remove(stream);
        state.last_counters.remove(stream);
        if let Some(task) = state.running.remove(stream) {
            task.abort();
        }
    }

    /// Cancel everything; used on shutdown.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("throttler lock poisoned");
        state.pending.clear();
        state.last_counters.clear();
        for (_, task) in state.running.drain() {
            task.abort();
        }
    }
}

/// Drains pending instructions for one stream, exiting once none remain.
/// Exit and enqueue race under the same lock, so an instruction added while
/// the task is winding down either gets picked up here or respawns a task.
async fn run_stream(
    stream: StreamPartition,
    handler: InstructionHandler,
    state: Arc<Mutex<ThrottlerState>>,
) {
    loop {
        let next = {
            let mut state = state.lock().expect("throttler lock poisoned");
            match state.pending.remove(&stream) {
                Some(entry) => entry,
                None => {
                    state.running.remove(&stream);
                    return;
                }
            }
        };
        let (instruction, tracker) = next;
        handler(instruction, tracker, false).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn instruction(stream: &str, counter: u64) -> InstructionMessage {
        InstructionMessage {
            request_id: format!("req-{counter}").as_str().into(),
            stream_id: stream.to_string(),
            stream_partition: 0,
            node_ids: vec![],
            counter,
        }
    }

    fn recording_handler(
        handled: Arc<Mutex<Vec<(String, u64)>>>,
        delay: Duration,
    ) -> InstructionHandler {
        Arc::new(move |instruction, _tracker, _reattempt| {
            let handled = handled.clone();
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                handled
                    .lock()
                    .unwrap()
                    .push((instruction.stream_id.clone(), instruction.counter));
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_first_and_latest() {
        let handled = Arc::new(Mutex::new(Vec::new()));
        let throttler = InstructionThrottler::new(recording_handler(
            handled.clone(),
            Duration::from_millis(100),
        ));

        for counter in 1..=5 {
            throttler.add(instruction("s", counter), "tracker".into());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(
            vec![("s".to_string(), 1), ("s".to_string(), 5)],
            handled.lock().unwrap().clone()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_instructions_are_all_handled_in_order() {
        let handled = Arc::new(Mutex::new(Vec::new()));
        let throttler = InstructionThrottler::new(recording_handler(
            handled.clone(),
            Duration::from_millis(10),
        ));

        for counter in 1..=5 {
            throttler.add(instruction("s", counter), "tracker".into());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(
            vec![
                ("s".to_string(), 1),
                ("s".to_string(), 2),
                ("s".to_string(), 3),
                ("s".to_string(), 4),
                ("s".to_string(), 5)
            ],
            handled.lock().unwrap().clone()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn streams_are_independent() {
        let handled = Arc::new(Mutex::new(Vec::new()));
        let throttler = InstructionThrottler::new(recording_handler(
            handled.clone(),
            Duration::from_millis(100),
        ));

        throttler.add(instruction("a", 1), "tracker".into());
        throttler.add(instruction("b", 1), "tracker".into());
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut result = handled.lock().unwrap().clone();
        result.sort();
        assert_eq!(
            vec![("a".to_string(), 1), ("b".to_string(), 1)],
            result
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_counter_is_dropped() {
        let handled = Arc::new(Mutex::new(Vec::new()));
        let throttler = InstructionThrottler::new(recording_handler(
            handled.clone(),
            Duration::from_millis(10),
        ));

        throttler.add(instruction("s", 5), "tracker".into());
        tokio::time::sleep(Duration::from_millis(50)).await;
        throttler.add(instruction("s", 3), "tracker".into());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            vec![("s".to_string(), 5)],
            handled.lock().unwrap().clone()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn remove_stream_cancels_in_flight_handling() {
        let handled = Arc::new(Mutex::new(Vec::new()));
        let throttler = InstructionThrottler::new(recording_handler(
            handled.clone(),
            Duration::from_millis(100),
        ));

        throttler.add(instruction("s", 1), "tracker".into());
        tokio::time::sleep(Duration::from_millis(10)).await;
        throttler.remove_stream(&StreamPartition::new("s", 0));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(handled.lock().unwrap().is_empty());
    }
}
