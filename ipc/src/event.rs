//! Plain event objects
//!
//! The simplest handle kind: a one-shot READY bit raised by [`EventObject::signal`]
//! and cleared when a wait delivers it. Kernel services use it to hand an
//! application something to wait on; tests use the destroy hook to observe
//! handle release.

use crate::handle::HandleOps;
use crate::sync::lock;
use crate::wait::WaitQueue;
use kernel_api::ReadyFlags;
use log::trace;
use std::fmt;
use std::sync::{Arc, Mutex};

type DestroyHook = Box<dyn FnOnce() + Send>;

#[derive(Debug, Default)]
struct EventState {
    signaled: bool,
    closed: bool,
}

/// Auto-reset event usable as a handle
pub struct EventObject {
    state: Mutex<EventState>,
    waitq: Arc<WaitQueue>,
    on_destroy: Mutex<Option<DestroyHook>>,
}

impl EventObject {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EventState::default()),
            waitq: Arc::new(WaitQueue::new()),
            on_destroy: Mutex::new(None),
        })
    }

    /// Creates an event that runs `hook` when its handle is destroyed
    pub fn with_destroy_hook(hook: impl FnOnce() + Send + 'static) -> Arc<Self> {
        let event = Self::new();
        *lock(&event.on_destroy) = Some(Box::new(hook));
        event
    }

    /// Raises READY and wakes waiters
    pub fn signal(&self) {
        lock(&self.state).signaled = true;
        self.waitq.notify();
    }

    /// Drops a pending READY without waking anyone
    pub fn clear(&self) {
        lock(&self.state).signaled = false;
    }

    pub fn is_signaled(&self) -> bool {
        lock(&self.state).signaled
    }
}

impl HandleOps for EventObject {
    fn poll(&self) -> ReadyFlags {
        let state = lock(&self.state);
        if state.closed {
            ReadyFlags::HUP
        } else if state.signaled {
            ReadyFlags::READY
        } else {
            ReadyFlags::empty()
        }
    }

    fn finalize_event(&self, event: ReadyFlags) {
        if event.contains(ReadyFlags::READY) {
            lock(&self.state).signaled = false;
        }
    }

    fn shutdown(&self) {
        lock(&self.state).closed = true;
        self.waitq.notify();
    }

    fn destroy(&self) {
        trace!("event destroyed");
        let hook = lock(&self.on_destroy).take();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn wait_queue(&self) -> &Arc<WaitQueue> {
        &self.waitq
    }
}

impl fmt::Debug for EventObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("EventObject")
            .field("signaled", &state.signaled)
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_is_one_shot() {
        let event = EventObject::new();
        assert!(event.poll().is_empty());
        event.signal();
        assert!(event.is_signaled());
        assert_eq!(event.poll(), ReadyFlags::READY);
        event.finalize_event(ReadyFlags::READY);
        assert!(event.poll().is_empty());
    }

    #[test]
    fn test_clear_drops_pending_signal() {
        let event = EventObject::new();
        event.signal();
        event.clear();
        assert!(!event.is_signaled());
        assert!(event.poll().is_empty());
    }

    #[test]
    fn test_shutdown_reports_hup() {
        let event = EventObject::new();
        event.signal();
        event.shutdown();
        assert_eq!(event.poll(), ReadyFlags::HUP);
    }

    #[test]
    fn test_destroy_hook_runs_once() {
        let (tx, rx) = std::sync::mpsc::channel();
        let event = EventObject::with_destroy_hook(move || tx.send(()).unwrap());
        event.destroy();
        event.destroy();
        assert_eq!(rx.try_iter().count(), 1);
    }
}
