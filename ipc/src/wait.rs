//! Wait events and per-object wait queues
//!
//! A [`WaitEvent`] is a sequence counter guarded by a mutex plus a condition
//! variable. Waiters snapshot the counter, evaluate readiness, and block only
//! while the counter still holds the snapshot:
//!
//! ```text
//!   loop {
//!       seen = event.sequence()
//!       if poll() != 0 { return }          <- readiness is level-triggered
//!       event.wait_since(seen, deadline)   <- returns at once if signalled
//!   }                                         after the snapshot
//! ```
//!
//! A signal that lands between the poll and the block bumps the counter, so
//! the block returns immediately and the next poll observes the new state.
//! Signals are never consumed, which lets any number of threads wait on the
//! same event.
//!
//! A [`WaitQueue`] belongs to one kernel object. It owns the object's event
//! and a list of subscribed events (the event of the Handle List the object
//! is a member of). `notify` signals all of them.

use crate::sync::lock;
use kernel_api::{Deadline, KernelError, KernelResult};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Blocking synchronisation point
#[derive(Debug, Default)]
pub struct WaitEvent {
    seq: Mutex<u64>,
    cond: Condvar,
}

impl WaitEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current signal sequence number
    pub fn sequence(&self) -> u64 {
        *lock(&self.seq)
    }

    /// Wakes every thread blocked on this event
    pub fn signal(&self) {
        let mut seq = lock(&self.seq);
        *seq = seq.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Blocks until the event is signalled after `seen` was observed
    ///
    /// Returns [`KernelError::TimedOut`] if the deadline passes first. An
    /// already expired deadline still succeeds when a signal is pending.
    pub fn wait_since(&self, seen: u64, deadline: &Deadline) -> KernelResult<()> {
        let mut seq = lock(&self.seq);
        while *seq == seen {
            match deadline.remaining() {
                None => {
                    seq = self.cond.wait(seq).unwrap_or_else(PoisonError::into_inner);
                }
                Some(left) if left.is_zero() => return Err(KernelError::TimedOut),
                Some(left) => {
                    let (guard, _) = self
                        .cond
                        .wait_timeout(seq, left)
                        .unwrap_or_else(PoisonError::into_inner);
                    seq = guard;
                }
            }
        }
        Ok(())
    }
}

/// Wait queue of one kernel object
#[derive(Debug, Default)]
pub struct WaitQueue {
    event: Arc<WaitEvent>,
    subscribers: Mutex<Vec<Arc<WaitEvent>>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Event that direct waiters on this object block on
    pub fn event(&self) -> &Arc<WaitEvent> {
        &self.event
    }

    /// Wakes direct waiters and every subscribed event
    pub fn notify(&self) {
        self.event.signal();
        for subscriber in lock(&self.subscribers).iter() {
            subscriber.signal();
        }
    }

    /// Routes future notifications to `event` as well
    pub fn subscribe(&self, event: Arc<WaitEvent>) {
        lock(&self.subscribers).push(event);
    }

    /// Stops routing notifications to `event`
    pub fn unsubscribe(&self, event: &Arc<WaitEvent>) {
        lock(&self.subscribers).retain(|s| !Arc::ptr_eq(s, event));
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_api::Timeout;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_zero_timeout_without_signal_times_out() {
        let event = WaitEvent::new();
        let seen = event.sequence();
        assert_eq!(
            event.wait_since(seen, &Timeout::ZERO.start()),
            Err(KernelError::TimedOut)
        );
    }

    #[test]
    fn test_signal_before_wait_is_not_lost() {
        let event = WaitEvent::new();
        let seen = event.sequence();
        event.signal();
        assert_eq!(event.wait_since(seen, &Timeout::ZERO.start()), Ok(()));
    }

    #[test]
    fn test_signal_wakes_blocked_thread() {
        let event = Arc::new(WaitEvent::new());
        let seen = event.sequence();
        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.wait_since(seen, &Timeout::INFINITE.start()))
        };
        thread::sleep(Duration::from_millis(20));
        event.signal();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_finite_timeout_expires() {
        let event = WaitEvent::new();
        let seen = event.sequence();
        let started = std::time::Instant::now();
        assert_eq!(
            event.wait_since(seen, &Timeout::from_millis(30).start()),
            Err(KernelError::TimedOut)
        );
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_queue_notifies_subscribers() {
        let queue = WaitQueue::new();
        let list_event = Arc::new(WaitEvent::new());
        queue.subscribe(list_event.clone());
        assert_eq!(queue.subscriber_count(), 1);

        let seen_own = queue.event().sequence();
        let seen_list = list_event.sequence();
        queue.notify();
        assert_ne!(queue.event().sequence(), seen_own);
        assert_ne!(list_event.sequence(), seen_list);

        queue.unsubscribe(&list_event);
        assert_eq!(queue.subscriber_count(), 0);
        let seen_list = list_event.sequence();
        queue.notify();
        assert_eq!(list_event.sequence(), seen_list);
    }
}
