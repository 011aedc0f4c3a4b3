//! Timer scheduling
//!
//! The proxy's only timeout is the grant expiry/challenge timer. The
//! executor owns the clock: deadlines are absolute wall-clock milliseconds
//! read from the same source `now_millis` reports. Delivery is at most
//! once per schedule, and cancelling an already-fired timer is harmless.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::trace;

/// Handle for a single scheduled signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(pub u64);

/// Schedules SIGNAL delivery to a `(route_id, stream_id)` pair.
pub trait SignalingExecutor {
    /// Current wall-clock time in milliseconds.
    fn now_millis(&self) -> i64;

    /// Deliver `signal_id` to `(route_id, stream_id)` once `at_millis` is
    /// reached. A deadline in the past fires as soon as possible.
    fn schedule(&mut self, at_millis: i64, route_id: u64, stream_id: u64, signal_id: u64)
        -> TimerKey;

    /// Cancel a scheduled signal. Either prevents delivery or does nothing
    /// if the signal already fired.
    fn cancel(&mut self, key: TimerKey);
}

/// A signal that reached its deadline, ready to be dispatched back into
/// the worker as a SIGNAL frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledSignal {
    pub route_id: u64,
    pub stream_id: u64,
    pub signal_id: u64,
}

/// Tokio-backed executor for hosts that run the worker inside an async
/// runtime. Each schedule spawns a sleep task that pushes the signal onto
/// an unbounded channel; the host drains the receiver on its worker loop.
pub struct TokioExecutor {
    tx: mpsc::UnboundedSender<ScheduledSignal>,
    tasks: HashMap<u64, tokio::task::JoinHandle<()>>,
    next_key: u64,
}

impl TokioExecutor {
    /// Create an executor and the receiver the host drains.
    ///
    /// Must be called within a tokio runtime.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScheduledSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                tasks: HashMap::new(),
                next_key: 1,
            },
            rx,
        )
    }
}

impl SignalingExecutor for TokioExecutor {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    fn schedule(
        &mut self,
        at_millis: i64,
        route_id: u64,
        stream_id: u64,
        signal_id: u64,
    ) -> TimerKey {
        // Drop handles of timers that already fired.
        self.tasks.retain(|_, task| !task.is_finished());

        let key = TimerKey(self.next_key);
        self.next_key += 1;

        let delay = (at_millis - self.now_millis()).max(0) as u64;
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let _ = tx.send(ScheduledSignal {
                route_id,
                stream_id,
                signal_id,
            });
        });

        trace!(stream_id, signal_id, delay_ms = delay, "scheduled signal");
        self.tasks.insert(key.0, task);
        key
    }

    fn cancel(&mut self, key: TimerKey) {
        if let Some(task) = self.tasks.remove(&key.0) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test(start_paused = true)]
    async fn test_schedule_delivers_signal() {
        let (mut executor, mut rx) = TokioExecutor::new();
        let deadline = executor.now_millis() + 50;
        executor.schedule(deadline, 7, 42, 1);

        let signal = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("signal within deadline")
            .expect("channel open");

        assert_eq!(
            signal,
            ScheduledSignal {
                route_id: 7,
                stream_id: 42,
                signal_id: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_delivery() {
        let (mut executor, mut rx) = TokioExecutor::new();
        let key = executor.schedule(executor.now_millis() + 50, 7, 42, 1);
        executor.cancel(key);

        let result = timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(result.is_err(), "cancelled signal must not be delivered");
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_fires_immediately() {
        let (mut executor, mut rx) = TokioExecutor::new();
        executor.schedule(executor.now_millis() - 1_000, 1, 2, 1);

        let signal = timeout(Duration::from_millis(50), rx.recv())
            .await
            .expect("immediate fire")
            .expect("channel open");
        assert_eq!(signal.stream_id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fire_is_harmless() {
        let (mut executor, mut rx) = TokioExecutor::new();
        let key = executor.schedule(executor.now_millis(), 1, 2, 1);

        let _ = timeout(Duration::from_millis(50), rx.recv()).await;
        executor.cancel(key);
        executor.cancel(key);
    }
}
