//! Handle Lists
//!
//! A Handle List is a set of handles that one thread can wait on at once.
//! Every member's wait queue carries the list's shared event, so a readiness
//! change on any member wakes a `wait_any` caller, which then re-polls the
//! members under the list lock.
//!
//! Scanning starts just after the member returned last time, so a member
//! that is always ready cannot starve the others.
//!
//! Lock order: member's list slot, then the list, then member object locks
//! (through `poll`), then wait queues.

use crate::handle::{HandleRef, WeakHandleRef};
use crate::sync::lock;
use crate::wait::{WaitEvent, WaitQueue};
use kernel_api::{KernelError, KernelResult, ReadyFlags, Timeout};
use log::trace;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct ListInner {
    members: Vec<WeakHandleRef>,
    /// Index the next scan starts from
    cursor: usize,
}

impl ListInner {
    fn prune(&mut self) {
        self.members.retain(WeakHandleRef::is_alive);
        if self.cursor >= self.members.len() {
            self.cursor = 0;
        }
    }

    fn position(&self, handle: &HandleRef) -> Option<usize> {
        self.members.iter().position(|m| m.refers_to(handle))
    }

    /// Finds the next ready member, starting at the cursor
    fn poll_next(&mut self) -> Option<(HandleRef, ReadyFlags)> {
        let count = self.members.len();
        for step in 0..count {
            let index = (self.cursor + step) % count;
            let Some(member) = self.members[index].upgrade() else {
                continue;
            };
            let ready = member.poll();
            if !ready.is_empty() {
                self.cursor = (index + 1) % count;
                return Some((member, ready));
            }
        }
        None
    }
}

#[derive(Debug, Default)]
pub(crate) struct ListShared {
    inner: Mutex<ListInner>,
    event: Arc<WaitEvent>,
}

impl ListShared {
    /// Called when a member handle is destroyed without being removed
    ///
    /// `waitq` is the dying member's queue; it may outlive the member.
    pub(crate) fn member_gone(&self, waitq: &WaitQueue) {
        waitq.unsubscribe(&self.event);
        self.event.signal();
    }
}

/// Set of handles waited on together
#[derive(Debug, Clone, Default)]
pub struct HandleList {
    shared: Arc<ListShared>,
}

impl HandleList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handle to the list
    ///
    /// A handle belongs to at most one list. If the handle is already ready,
    /// a thread blocked in [`HandleList::wait_any`] is woken.
    pub fn add(&self, handle: &HandleRef) -> KernelResult<()> {
        let mut slot = lock(handle.handle().list_slot());
        if slot.as_ref().is_some_and(|list| list.strong_count() > 0) {
            return Err(KernelError::AlreadyExists);
        }
        let mut inner = lock(&self.shared.inner);
        inner.prune();
        *slot = Some(Arc::downgrade(&self.shared));
        inner.members.push(handle.downgrade());
        handle.wait_queue().subscribe(self.shared.event.clone());
        if !handle.poll().is_empty() {
            self.shared.event.signal();
        }
        trace!("handle {} added to list", handle.object_id());
        Ok(())
    }

    /// Removes a handle from the list
    ///
    /// Returns [`KernelError::NotFound`] if the handle is not a member.
    /// Removing the last member wakes a waiter, which then observes the
    /// empty list.
    pub fn remove(&self, handle: &HandleRef) -> KernelResult<()> {
        let mut slot = lock(handle.handle().list_slot());
        let member_of_self = slot
            .as_ref()
            .is_some_and(|list| std::ptr::eq(list.as_ptr(), Arc::as_ptr(&self.shared)));
        if !member_of_self {
            return Err(KernelError::NotFound);
        }
        let mut inner = lock(&self.shared.inner);
        let index = inner.position(handle).ok_or(KernelError::NotFound)?;
        inner.members.remove(index);
        if inner.cursor > index {
            inner.cursor -= 1;
        }
        inner.prune();
        *slot = None;
        handle.wait_queue().unsubscribe(&self.shared.event);
        if inner.members.is_empty() {
            self.shared.event.signal();
        }
        trace!("handle {} removed from list", handle.object_id());
        Ok(())
    }

    /// Removes every member
    pub fn remove_all(&self) {
        let members: Vec<HandleRef> = {
            let inner = lock(&self.shared.inner);
            inner.members.iter().filter_map(WeakHandleRef::upgrade).collect()
        };
        for member in &members {
            // a concurrent remove may already have taken it
            let _ = self.remove(member);
        }
    }

    pub fn contains(&self, handle: &HandleRef) -> bool {
        lock(&self.shared.inner).position(handle).is_some()
    }

    /// Number of live members
    pub fn len(&self) -> usize {
        let mut inner = lock(&self.shared.inner);
        inner.prune();
        inner.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until any member is ready
    ///
    /// Returns a new reference to the ready member and its finalized event.
    /// Fails with [`KernelError::NotFound`] when the list is empty, including
    /// when it becomes empty during the wait, and with
    /// [`KernelError::TimedOut`] when the timeout expires first. A zero
    /// timeout polls once.
    pub fn wait_any(&self, timeout: Timeout) -> KernelResult<(HandleRef, ReadyFlags)> {
        let deadline = timeout.start();
        loop {
            let seen = self.shared.event.sequence();
            {
                let mut inner = lock(&self.shared.inner);
                inner.prune();
                if inner.members.is_empty() {
                    return Err(KernelError::NotFound);
                }
                if let Some((member, ready)) = inner.poll_next() {
                    member.finalize_event(ready);
                    return Ok((member, ready));
                }
            }
            self.shared.event.wait_since(seen, &deadline)?;
        }
    }
}

impl Drop for ListShared {
    fn drop(&mut self) {
        let members = match self.inner.get_mut() {
            Ok(inner) => std::mem::take(&mut inner.members),
            Err(poisoned) => std::mem::take(&mut poisoned.into_inner().members),
        };
        for member in members.iter().filter_map(WeakHandleRef::upgrade) {
            member.wait_queue().unsubscribe(&self.event);
        }
    }
}
