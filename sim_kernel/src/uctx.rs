//! User contexts
//!
//! A user context is the handle table of one application. Applications name
//! kernel objects only through the small ids it hands out, so an id from
//! one application means nothing in another.
//!
//! Every installed handle is also a member of the context's [`HandleList`],
//! which is what `wait_any` blocks on.
//!
//! Released handles are always dropped after the table lock is released;
//! destroying a handle can reach port and channel locks.

use core_types::{AlsSlotId, AppUuid, HandleId};
use ipc::{HandleList, HandleRef};
use kernel_api::{KernelError, KernelResult, Timeout, UEvent};
use lifecycle::{App, AppNotifier};
use log::{debug, trace, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One entry of a handle table
#[derive(Debug, Clone)]
enum Slot {
    Free,
    Used(HandleRef),
    /// The handle is travelling in a message; the id stays taken until the
    /// send settles
    Reserved,
}

impl Slot {
    fn is_free(&self) -> bool {
        matches!(self, Slot::Free)
    }

    fn handle(&self) -> Option<&HandleRef> {
        match self {
            Slot::Used(handle) => Some(handle),
            Slot::Free | Slot::Reserved => None,
        }
    }

    fn take_used(&mut self) -> Option<HandleRef> {
        match std::mem::replace(self, Slot::Free) {
            Slot::Used(handle) => Some(handle),
            other => {
                *self = other;
                None
            }
        }
    }
}

/// Handle table of one application
#[derive(Debug)]
pub struct UserContext {
    owner: AppUuid,
    slots: Mutex<Vec<Slot>>,
    list: HandleList,
}

impl UserContext {
    /// Creates an empty table with room for `capacity` handles
    pub fn new(owner: AppUuid, capacity: usize) -> Self {
        Self {
            owner,
            slots: Mutex::new(vec![Slot::Free; capacity]),
            list: HandleList::new(),
        }
    }

    pub fn owner(&self) -> AppUuid {
        self.owner
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().len()
    }

    /// Number of installed handles
    pub fn len(&self) -> usize {
        self.lock().iter().filter(|slot| slot.handle().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn install_locked(
        &self,
        slots: &mut [Slot],
        handle: HandleRef,
    ) -> Result<HandleId, (KernelError, HandleRef)> {
        let Some(index) = slots.iter().position(Slot::is_free) else {
            return Err((KernelError::NoSpace, handle));
        };
        if let Err(err) = self.list.add(&handle) {
            return Err((err, handle));
        }
        slots[index] = Slot::Used(handle);
        Ok(HandleId::new(index as u32))
    }

    /// Takes ownership of `handle` and assigns it the lowest free id
    ///
    /// Fails with [`KernelError::NoSpace`] when the table is full. The
    /// handle is released on failure.
    pub fn install(&self, handle: HandleRef) -> KernelResult<HandleId> {
        let result = {
            let mut slots = self.lock();
            self.install_locked(&mut slots, handle)
        };
        match result {
            Ok(id) => {
                trace!("{}: installed {}", self.owner, id);
                Ok(id)
            }
            Err((err, handle)) => {
                drop(handle);
                Err(err)
            }
        }
    }

    /// Installs every handle or none of them
    ///
    /// On failure the handles come back to the caller untouched.
    pub fn install_all(
        &self,
        handles: Vec<HandleRef>,
    ) -> Result<Vec<HandleId>, (KernelError, Vec<HandleRef>)> {
        let mut slots = self.lock();
        let free = slots.iter().filter(|slot| slot.is_free()).count();
        if free < handles.len() {
            return Err((KernelError::NoSpace, handles));
        }
        let mut ids = Vec::with_capacity(handles.len());
        let mut pending = handles.into_iter();
        while let Some(handle) = pending.next() {
            match self.install_locked(&mut slots, handle) {
                Ok(id) => ids.push(id),
                Err((err, failed)) => {
                    let mut back: Vec<HandleRef> = ids
                        .iter()
                        .filter_map(|id| slots[id.index()].take_used())
                        .collect();
                    for handle in &back {
                        let _ = self.list.remove(handle);
                    }
                    back.push(failed);
                    back.extend(pending);
                    return Err((err, back));
                }
            }
        }
        Ok(ids)
    }

    fn slot(slots: &[Slot], id: HandleId) -> KernelResult<&HandleRef> {
        slots
            .get(id.index())
            .and_then(Slot::handle)
            .ok_or(KernelError::InvalidHandle)
    }

    /// Returns a new reference to the handle installed at `id`
    pub fn get(&self, id: HandleId) -> KernelResult<HandleRef> {
        let slots = self.lock();
        Self::slot(&slots, id).map(HandleRef::incref)
    }

    /// Detaches `id` and hands the table's reference to the caller
    pub fn remove(&self, id: HandleId) -> KernelResult<HandleRef> {
        let mut slots = self.lock();
        let handle = slots
            .get_mut(id.index())
            .and_then(Slot::take_used)
            .ok_or(KernelError::InvalidHandle)?;
        // a freshly removed member is always in our list
        let _ = self.list.remove(&handle);
        trace!("{}: removed {}", self.owner, id);
        Ok(handle)
    }

    /// Detaches the handles at `ids` for a send, keeping their ids taken
    ///
    /// Either every id names an installed handle and all of them are taken
    /// out, or nothing changes and [`KernelError::InvalidHandle`] is
    /// returned. Settle the reservation with
    /// [`UserContext::release_reserved`] or
    /// [`UserContext::restore_reserved`].
    pub fn reserve(&self, ids: &[HandleId]) -> KernelResult<Vec<HandleRef>> {
        let mut slots = self.lock();
        for &id in ids {
            Self::slot(&slots, id)?;
        }
        let mut handles = Vec::with_capacity(ids.len());
        for &id in ids {
            let slot = &mut slots[id.index()];
            if let Some(handle) = slot.take_used() {
                let _ = self.list.remove(&handle);
                handles.push(handle);
                *slot = Slot::Reserved;
            }
        }
        Ok(handles)
    }

    /// Frees ids whose handles were handed off
    pub fn release_reserved(&self, ids: &[HandleId]) {
        let mut slots = self.lock();
        for &id in ids {
            if let Some(slot) = slots.get_mut(id.index()) {
                if matches!(slot, Slot::Reserved) {
                    *slot = Slot::Free;
                }
            }
        }
        trace!("{}: released {} reserved ids", self.owner, ids.len());
    }

    /// Puts handles back under the ids they were reserved from
    ///
    /// `handles` must be in the order [`UserContext::reserve`] returned
    /// them.
    pub fn restore_reserved(&self, ids: &[HandleId], handles: Vec<HandleRef>) {
        let mut slots = self.lock();
        for (&id, handle) in ids.iter().zip(handles) {
            let Some(slot) = slots.get_mut(id.index()) else {
                continue;
            };
            if !matches!(slot, Slot::Reserved) {
                continue;
            }
            if let Err(err) = self.list.add(&handle) {
                warn!("{}: restored {} outside the wait list: {}", self.owner, id, err);
            }
            *slot = Slot::Used(handle);
        }
    }

    /// Finds the id under which `handle` is installed
    pub fn id_of(&self, handle: &HandleRef) -> Option<HandleId> {
        self.lock()
            .iter()
            .position(|slot| slot.handle().is_some_and(|h| h.ptr_eq(handle)))
            .map(|index| HandleId::new(index as u32))
    }

    /// Waits for any installed handle to become ready
    ///
    /// Fails with [`KernelError::NotFound`] when the table is empty and
    /// with [`KernelError::TimedOut`] when nothing becomes ready in time.
    pub fn wait_any(&self, timeout: Timeout) -> KernelResult<UEvent> {
        let deadline = timeout.start();
        loop {
            let left = deadline
                .remaining()
                .map_or(Timeout::INFINITE, Timeout::from_duration);
            let (handle, event) = self.list.wait_any(left)?;
            // removed by another thread after it became ready
            let Some(id) = self.id_of(&handle) else {
                continue;
            };
            return Ok(UEvent {
                handle: id,
                event,
                cookie: handle.cookie(),
            });
        }
    }

    /// Closes every remaining handle
    ///
    /// Runs when the application goes away. A non-empty table is logged
    /// since well-behaved applications close their handles first.
    pub fn destroy(&self) {
        let remaining: Vec<HandleRef> = {
            let mut slots = self.lock();
            slots.iter_mut().filter_map(Slot::take_used).collect()
        };
        if remaining.is_empty() {
            return;
        }
        warn!(
            "destroying non-empty user context of {} ({} handles)",
            self.owner,
            remaining.len()
        );
        for handle in remaining {
            let _ = self.list.remove(&handle);
            handle.close();
        }
    }
}

impl Drop for UserContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Attaches a [`UserContext`] to every application that starts
pub struct UctxNotifier {
    slot: AlsSlotId,
    capacity: usize,
}

impl UctxNotifier {
    pub fn new(slot: AlsSlotId, capacity: usize) -> Self {
        Self { slot, capacity }
    }

    pub fn slot(&self) -> AlsSlotId {
        self.slot
    }
}

impl AppNotifier for UctxNotifier {
    fn name(&self) -> &str {
        "uctx"
    }

    fn startup(&self, app: &App) -> KernelResult<()> {
        let uctx = Arc::new(UserContext::new(app.uuid(), self.capacity));
        app.als_set(self.slot, uctx)?;
        debug!("user context created for {}", app.uuid());
        Ok(())
    }

    fn shutdown(&self, app: &App) -> KernelResult<()> {
        if let Some(uctx) = app.als_take::<UserContext>(self.slot) {
            uctx.destroy();
        }
        Ok(())
    }
}
