//! Kernel handles
//!
//! A [`Handle`] is the kernel-side capability for one object: a port, a
//! channel endpoint or a plain event. Applications never see it directly;
//! they see small integer ids that their handle table maps to [`HandleRef`]s.
//!
//! ## Reference counting
//!
//! [`HandleRef`] is a counted reference. Cloning takes a reference, dropping
//! releases one, and the object's `destroy` runs exactly once when the last
//! reference goes away. Handle Lists hold [`WeakHandleRef`]s so list
//! membership never keeps a handle alive.
//!
//! ## Dispatch
//!
//! The set of handle kinds is closed ([`HandleObject`]); each kind implements
//! [`HandleOps`] and the handle forwards poll, finalize, shutdown and destroy
//! to it.

use crate::channel::ChannelEnd;
use crate::event::EventObject;
use crate::handle_list::ListShared;
use crate::port::Port;
use crate::sync::lock;
use crate::wait::WaitQueue;
use kernel_api::{KernelError, KernelResult, ReadyFlags, Timeout};
use log::trace;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Behaviour every handle kind provides
pub trait HandleOps {
    /// Current readiness; must not block
    fn poll(&self) -> ReadyFlags;

    /// Clears one-shot bits after a wait delivered `event`
    fn finalize_event(&self, _event: ReadyFlags) {}

    /// Moves the object to its closing state and wakes its waiters
    fn shutdown(&self);

    /// Releases the object; runs once, after the last reference is gone
    fn destroy(&self);

    /// Wait queue notified on readiness changes
    fn wait_queue(&self) -> &Arc<WaitQueue>;
}

/// Object behind a handle
#[derive(Clone)]
pub enum HandleObject {
    Port(Arc<Port>),
    Channel(Arc<ChannelEnd>),
    Event(Arc<EventObject>),
}

impl HandleObject {
    fn ops(&self) -> &dyn HandleOps {
        match self {
            HandleObject::Port(port) => port.as_ref(),
            HandleObject::Channel(chan) => chan.as_ref(),
            HandleObject::Event(event) => event.as_ref(),
        }
    }

    pub fn kind(&self) -> HandleKind {
        match self {
            HandleObject::Port(_) => HandleKind::Port,
            HandleObject::Channel(_) => HandleKind::Channel,
            HandleObject::Event(_) => HandleKind::Event,
        }
    }
}

/// Kind tag of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Port,
    Channel,
    Event,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Port => write!(f, "port"),
            HandleKind::Channel => write!(f, "channel"),
            HandleKind::Event => write!(f, "event"),
        }
    }
}

/// A kernel capability
pub struct Handle {
    object_id: u64,
    object: HandleObject,
    cookie: AtomicU64,
    /// Handle List this handle belongs to, if any
    list: Mutex<Option<Weak<ListShared>>>,
}

impl Handle {
    /// Wraps `object` in a new handle with one reference
    pub fn new(object: HandleObject) -> HandleRef {
        let object_id = NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed);
        trace!("handle {} created ({})", object_id, object.kind());
        HandleRef(Arc::new(Handle {
            object_id,
            object,
            cookie: AtomicU64::new(0),
            list: Mutex::new(None),
        }))
    }

    pub(crate) fn list_slot(&self) -> &Mutex<Option<Weak<ListShared>>> {
        &self.list
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        trace!("handle {} destroyed ({})", self.object_id, self.object.kind());
        self.object.ops().destroy();
        // a list waiter must re-scan once a member disappears
        let list = self.list.get_mut().ok().and_then(|slot| slot.take());
        if let Some(list) = list.and_then(|weak| weak.upgrade()) {
            list.member_gone(self.object.ops().wait_queue());
        }
    }
}

/// Counted reference to a [`Handle`]
#[derive(Clone)]
pub struct HandleRef(Arc<Handle>);

impl HandleRef {
    /// Unique id of the underlying object, for logs and identity checks
    pub fn object_id(&self) -> u64 {
        self.0.object_id
    }

    pub fn object(&self) -> &HandleObject {
        &self.0.object
    }

    pub fn kind(&self) -> HandleKind {
        self.0.object.kind()
    }

    pub fn is_port(&self) -> bool {
        self.kind() == HandleKind::Port
    }

    pub fn is_channel(&self) -> bool {
        self.kind() == HandleKind::Channel
    }

    /// Takes another reference; same as `clone`
    pub fn incref(&self) -> HandleRef {
        self.clone()
    }

    /// Releases this reference; same as `drop`
    pub fn decref(self) {}

    /// Number of live references
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn cookie(&self) -> u64 {
        self.0.cookie.load(Ordering::Acquire)
    }

    pub fn set_cookie(&self, cookie: u64) {
        self.0.cookie.store(cookie, Ordering::Release);
    }

    pub fn poll(&self) -> ReadyFlags {
        self.0.object.ops().poll()
    }

    pub fn finalize_event(&self, event: ReadyFlags) {
        self.0.object.ops().finalize_event(event)
    }

    pub fn wait_queue(&self) -> &Arc<WaitQueue> {
        self.0.object.ops().wait_queue()
    }

    /// Wakes every waiter on this handle and on its Handle List
    pub fn notify(&self) {
        self.wait_queue().notify();
    }

    /// Shuts the object down; the handle stays valid until released
    pub fn shutdown(&self) {
        trace!("handle {} shutdown ({})", self.0.object_id, self.kind());
        self.0.object.ops().shutdown();
    }

    /// Shuts the object down and releases this reference
    pub fn close(self) {
        self.shutdown();
    }

    /// Waits until the handle reports a non-empty readiness set
    ///
    /// A zero timeout polls once. The returned event has already been
    /// finalized.
    pub fn wait(&self, timeout: Timeout) -> KernelResult<ReadyFlags> {
        let deadline = timeout.start();
        let event = self.wait_queue().event().clone();
        loop {
            let seen = event.sequence();
            let ready = self.poll();
            if !ready.is_empty() {
                self.finalize_event(ready);
                return Ok(ready);
            }
            event.wait_since(seen, &deadline)?;
        }
    }

    pub fn downgrade(&self) -> WeakHandleRef {
        WeakHandleRef(Arc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &HandleRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.0
    }

    /// Returns the port behind this handle
    pub fn as_port(&self) -> KernelResult<&Arc<Port>> {
        match &self.0.object {
            HandleObject::Port(port) => Ok(port),
            _ => Err(KernelError::InvalidArgs),
        }
    }

    /// Returns the channel endpoint behind this handle
    pub fn as_channel(&self) -> KernelResult<&Arc<ChannelEnd>> {
        match &self.0.object {
            HandleObject::Channel(chan) => Ok(chan),
            _ => Err(KernelError::InvalidArgs),
        }
    }

    /// Returns the event object behind this handle
    pub fn as_event(&self) -> KernelResult<&Arc<EventObject>> {
        match &self.0.object {
            HandleObject::Event(event) => Ok(event),
            _ => Err(KernelError::InvalidArgs),
        }
    }

    /// Whether this handle currently belongs to a Handle List
    pub fn in_list(&self) -> bool {
        lock(&self.0.list)
            .as_ref()
            .map(|weak| weak.strong_count() > 0)
            .unwrap_or(false)
    }
}

impl fmt::Debug for HandleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRef")
            .field("object_id", &self.0.object_id)
            .field("kind", &self.kind())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Non-owning reference to a [`Handle`]
#[derive(Clone, Default)]
pub struct WeakHandleRef(Weak<Handle>);

impl WeakHandleRef {
    pub fn upgrade(&self) -> Option<HandleRef> {
        self.0.upgrade().map(HandleRef)
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }

    pub fn refers_to(&self, handle: &HandleRef) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&handle.0))
    }
}

impl fmt::Debug for WeakHandleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakHandleRef(alive: {})", self.is_alive())
    }
}
