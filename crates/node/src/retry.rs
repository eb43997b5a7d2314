//! Periodic re-application of the last tracker instruction per stream.

use crate::throttler::InstructionHandler;
use starling_api::protocol::InstructionMessage;
use starling_api::{StreamPartition, TrackerId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;

struct RetryEntry {
    instruction: InstructionMessage,
    tracker: TrackerId,
    /// Cycles 0..=limit; a retry at 0 forces a status report.
    status_send_counter: u32,
    task: AbortHandle,
}

/// Re-applies the most recent instruction for each stream on an interval,
/// self-healing streams whose reconciliation failed silently or whose
/// status reports were lost.
///
/// Most retries run with the reattempt flag set so a fully-converged stream
/// does not spam the tracker; every `status_send_counter_limit + 1`th retry
/// clears the flag to force a re-synchronizing status report.
#[derive(Clone)]
pub struct InstructionRetryManager {
    handler: InstructionHandler,
    interval: Duration,
    status_send_counter_limit: u32,
    entries: Arc<Mutex<HashMap<StreamPartition, RetryEntry>>>,
}

impl std::fmt::Debug for InstructionRetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstructionRetryManager")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl InstructionRetryManager {
    /// Construct a manager retrying through `handler` every `interval`.
    pub fn new(
        handler: InstructionHandler,
        interval: Duration,
        status_send_counter_limit: u32,
    ) -> Self {
        Self {
            handler,
            interval,
            status_send_counter_limit,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register the latest instruction for a stream. The retry cadence and
    /// status counter survive re-registration; only the instruction content
    /// is replaced.
    pub fn add(&self, instruction: InstructionMessage, tracker: TrackerId) {
        let stream = instruction.stream_partition();
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&stream) {
            Some(entry) => {
                entry.instruction = instruction;
                entry.tracker = tracker;
            }
            None => {
                let task = tokio::spawn(retry_loop(
                    stream.clone(),
                    self.handler.clone(),
                    self.interval,
                    self.status_send_counter_limit,
                    self.entries.clone(),
                ));
                entries.insert(
                    stream,
                    RetryEntry {
                        instruction,
                        tracker,
                        status_send_counter: 0,
                        task: task.abort_handle(),
                    },
                );
            }
        }
    }

    /// Stop retrying a stream; used on unsubscribe.
    pub fn remove_stream(&self, stream: &StreamPartition) {
        if let Some(entry) = self.entries.lock().unwrap().remove(stream) {
            entry.task.abort();
        }
    }

    /// Stop all retry timers; used on shutdown.
    pub fn reset(&self) {
        for (_, entry) in self.entries.lock().unwrap().drain() {
            entry.task.abort();
        }
    }
}

async fn retry_loop(
    stream: StreamPartition,
    handler: InstructionHandler,
    interval: Duration,
    status_send_counter_limit: u32,
    entries: Arc<Mutex<HashMap<StreamPartition, RetryEntry>>>,
) {
    loop {
        tokio::time::sleep(interval).await;
        let next = {
            let mut entries = entries.lock().unwrap();
            match entries.get_mut(&stream) {
                Some(entry) => {
                    let reattempt = entry.status_send_counter != 0;
                    entry.status_send_counter += 1;
                    if entry.status_send_counter > status_send_counter_limit {
                        entry.status_send_counter = 0;
                    }
                    Some((
                        entry.instruction.clone(),
                        entry.tracker.clone(),
                        reattempt,
                    ))
                }
                None => None,
            }
        };
        let Some((instruction, tracker, reattempt)) = next else {
            return;
        };
        tracing::debug!(%stream, reattempt, "retrying instruction");
        handler(instruction, tracker, reattempt).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use starling_api::BoxFut;

    fn instruction(stream: &str, counter: u64) -> InstructionMessage {
        InstructionMessage {
            request_id: "req".into(),
            stream_id: stream.to_string(),
            stream_partition: 0,
            node_ids: vec![],
            counter,
        }
    }

    type Calls = Arc<Mutex<Vec<(u64, bool)>>>;

    fn recording_handler(calls: Calls) -> InstructionHandler {
        Arc::new(move |instruction, _tracker, reattempt| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.lock().unwrap().push((instruction.counter, reattempt));
            }) as BoxFut<'static, ()>
        })
    }

    #[tokio::test(start_paused = true)]
    async fn first_and_every_tenth_retry_force_a_status_report() {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let manager = InstructionRetryManager::new(
            recording_handler(calls.clone()),
            Duration::from_secs(60),
            9,
        );
        manager.add(instruction("s", 1), "tracker".into());

        for _ in 0..12 {
            tokio::time::sleep(Duration::from_secs(61)).await;
        }

        let reattempts: Vec<bool> =
            calls.lock().unwrap().iter().map(|(_, r)| *r).collect();
        assert_eq!(12, reattempts.len());
        // the 1st and 11th retries carry reattempt = false
        assert!(!reattempts[0]);
        assert!(reattempts[1..10].iter().all(|r| *r));
        assert!(!reattempts[10]);
        assert!(reattempts[11]);
    }

    #[tokio::test(start_paused = true)]
    async fn re_add_replaces_instruction_without_restarting_cadence() {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let manager = InstructionRetryManager::new(
            recording_handler(calls.clone()),
            Duration::from_secs(60),
            9,
        );
        manager.add(instruction("s", 1), "tracker".into());
        tokio::time::sleep(Duration::from_secs(61)).await;
        manager.add(instruction("s", 2), "tracker".into());
        tokio::time::sleep(Duration::from_secs(61)).await;

        let counters: Vec<u64> =
            calls.lock().unwrap().iter().map(|(c, _)| *c).collect();
        assert_eq!(vec![1, 2], counters);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_stream_stops_retrying() {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let manager = InstructionRetryManager::new(
            recording_handler(calls.clone()),
            Duration::from_secs(60),
            9,
        );
        manager.add(instruction("s", 1), "tracker".into());
        tokio::time::sleep(Duration::from_secs(61)).await;
        manager.remove_stream(&StreamPartition::new("s", 0));
        tokio::time::sleep(Duration::from_secs(200)).await;

        assert_eq!(1, calls.lock().unwrap().len());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_stops_all_streams() {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let manager = InstructionRetryManager::new(
            recording_handler(calls.clone()),
            Duration::from_secs(60),
            9,
        );
        manager.add(instruction("a", 1), "tracker".into());
        manager.add(instruction("b", 1), "tracker".into());
        manager.reset();
        tokio::time::sleep(Duration::from_secs(200)).await;

        assert!(calls.lock().unwrap().is_empty());
    }
}
