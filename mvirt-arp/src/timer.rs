//! Entry timers.
//!
//! A timer never references entry memory: firing posts an [`ArpEvent`]
//! carrying the key, and the handler looks the entry up again. Each entry
//! keeps one [`TimerSlot`] per timer; re-arming a slot cancels the previous
//! instance and records a new deadline, so an expiry that was already in
//! flight when the slot was re-armed is recognised as not due and dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::trace;

use crate::event::ArpEvent;

/// Identifies one scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// Schedules delayed events.
pub trait TimerScheduler: Send + Sync {
    /// Deliver `event` after `delay`.
    fn schedule(&self, delay: Duration, event: ArpEvent) -> TimerHandle;

    /// Cancel a scheduled timer. Unknown or already fired handles are ignored.
    fn cancel(&self, handle: TimerHandle);
}

/// Receives events posted by timers.
pub trait EventSink: Send + Sync {
    fn post(&self, event: ArpEvent);
}

#[derive(Debug, Clone, Copy)]
struct Armed {
    handle: TimerHandle,
    deadline: Instant,
}

/// At most one armed timer.
#[derive(Debug, Default)]
pub struct TimerSlot {
    armed: Option<Armed>,
}

impl TimerSlot {
    /// Arm the slot, cancelling any previous instance.
    pub fn arm(&mut self, timers: &dyn TimerScheduler, delay: Duration, event: ArpEvent) {
        self.cancel(timers);
        let deadline = Instant::now() + delay;
        let handle = timers.schedule(delay, event);
        self.armed = Some(Armed { handle, deadline });
    }

    /// Cancel the armed instance, if any.
    pub fn cancel(&mut self, timers: &dyn TimerScheduler) {
        if let Some(armed) = self.armed.take() {
            timers.cancel(armed.handle);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// The armed instance has reached its deadline.
    ///
    /// An unarmed slot is never due: its expiry was cancelled or already
    /// consumed.
    pub fn is_due(&self, now: Instant) -> bool {
        self.armed.is_some_and(|armed| now >= armed.deadline)
    }

    /// Consume a due expiry. Returns false when the expiry is stale.
    pub fn take_expired(&mut self, now: Instant) -> bool {
        if self.is_due(now) {
            self.armed = None;
            true
        } else {
            false
        }
    }

    pub fn handle(&self) -> Option<TimerHandle> {
        self.armed.map(|armed| armed.handle)
    }
}

/// Timer scheduler backed by tokio sleeps.
pub struct TokioTimers {
    runtime: Handle,
    sink: Arc<dyn EventSink>,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, AbortHandle>>>,
}

impl TokioTimers {
    /// Create a scheduler on the current runtime.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self::with_runtime(Handle::current(), sink)
    }

    pub fn with_runtime(runtime: Handle, sink: Arc<dyn EventSink>) -> Self {
        TokioTimers {
            runtime,
            sink,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of timers that have neither fired nor been cancelled.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Cancel every outstanding timer.
    pub fn cancel_all(&self) {
        let drained: Vec<AbortHandle> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in drained {
            task.abort();
        }
    }
}

impl TimerScheduler for TokioTimers {
    fn schedule(&self, delay: Duration, event: ArpEvent) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pending_for_task = Arc::clone(&self.pending);
        let sink = Arc::clone(&self.sink);

        // Hold the lock across spawn + insert so a zero-delay timer cannot
        // look itself up before it is registered.
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let still_armed = pending_for_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id)
                .is_some();
            if still_armed {
                trace!(timer = id, event = event.name(), "Timer fired");
                sink.post(event);
            }
        });
        pending.insert(id, task.abort_handle());
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        let task = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.0);
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ResolutionKey;
    use crate::oper::VrfId;
    use crate::test_util::ManualTimers;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<ArpEvent>);

    impl EventSink for ChannelSink {
        fn post(&self, event: ArpEvent) {
            let _ = self.0.send(event);
        }
    }

    fn key() -> ResolutionKey {
        ResolutionKey::new(Ipv4Addr::new(10, 0, 0, 5), VrfId(1))
    }

    #[test]
    fn test_slot_rearm_cancels_previous() {
        let timers = ManualTimers::new();
        let mut slot = TimerSlot::default();

        slot.arm(&timers, Duration::ZERO, ArpEvent::RetryExpired { key: key() });
        let first = slot.handle().unwrap();
        slot.arm(&timers, Duration::ZERO, ArpEvent::RetryExpired { key: key() });

        assert!(timers.is_cancelled(first));
        assert_eq!(timers.armed().len(), 1);
        assert!(slot.is_due(Instant::now()));
        assert!(slot.take_expired(Instant::now()));
        assert!(!slot.is_armed());
        assert!(!slot.take_expired(Instant::now()));
    }

    #[test]
    fn test_slot_not_due_before_deadline() {
        let timers = ManualTimers::new();
        let mut slot = TimerSlot::default();
        slot.arm(
            &timers,
            Duration::from_secs(60),
            ArpEvent::AgingExpired { key: key() },
        );

        assert!(slot.is_armed());
        assert!(!slot.take_expired(Instant::now()));
        assert!(slot.is_armed());

        slot.cancel(&timers);
        assert!(!slot.is_armed());
        assert!(timers.armed().is_empty());
    }

    #[tokio::test]
    async fn test_tokio_timer_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = TokioTimers::new(Arc::new(ChannelSink(tx)));

        timers.schedule(
            Duration::from_millis(10),
            ArpEvent::RetryExpired { key: key() },
        );
        assert_eq!(timers.pending(), 1);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timer should fire")
            .unwrap();
        assert!(matches!(event, ArpEvent::RetryExpired { key: k } if k == key()));
        assert_eq!(timers.pending(), 0);
    }

    #[tokio::test]
    async fn test_tokio_timer_cancel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = TokioTimers::new(Arc::new(ChannelSink(tx)));

        let handle = timers.schedule(
            Duration::from_millis(20),
            ArpEvent::AgingExpired { key: key() },
        );
        timers.cancel(handle);
        assert_eq!(timers.pending(), 0);

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err(), "cancelled timer must not fire");
    }

    #[tokio::test]
    async fn test_tokio_cancel_all() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = TokioTimers::new(Arc::new(ChannelSink(tx)));

        for _ in 0..3 {
            timers.schedule(
                Duration::from_millis(20),
                ArpEvent::RetryExpired { key: key() },
            );
        }
        timers.cancel_all();
        assert_eq!(timers.pending(), 0);

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err());
    }
}
