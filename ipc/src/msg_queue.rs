//! Fixed-slot message queue for channel endpoints
//!
//! Every channel direction owns one queue sized when the connection is
//! attached: `num_items` slots of `item_size` bytes each. Slots cycle
//! through three states:
//!
//! ```text
//!   Free --enqueue--> Filled --get_next--> Read --consume--> Free
//! ```
//!
//! Filled slots are handed out in FIFO order. A Read slot stays pinned,
//! together with any handles it carries, until the receiver consumes it.
//!
//! The queue has no lock of its own; the owning connection's lock guards it.
//! Operations that release handles return them instead of dropping them so
//! the caller can release them after unlocking.

use crate::handle::HandleRef;
use crate::iovec;
use core_types::MsgId;
use kernel_api::{KernelError, KernelResult, MsgInfo};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Filled,
    Read,
}

#[derive(Debug)]
struct MsgSlot {
    state: SlotState,
    len: usize,
    handles: Vec<HandleRef>,
}

/// Bounded queue of fixed-size message slots
#[derive(Debug)]
pub struct MsgQueue {
    item_size: usize,
    max_handles: usize,
    buf: Vec<u8>,
    slots: Vec<MsgSlot>,
    free: VecDeque<usize>,
    filled: VecDeque<usize>,
}

impl MsgQueue {
    /// Creates a queue of `num_items` slots of `item_size` bytes
    ///
    /// Each slot may carry up to `max_handles` handles.
    pub fn new(num_items: usize, item_size: usize, max_handles: usize) -> KernelResult<Self> {
        if num_items == 0 || item_size == 0 {
            return Err(KernelError::InvalidArgs);
        }
        let bytes = num_items
            .checked_mul(item_size)
            .ok_or(KernelError::TooBig)?;
        let slots = (0..num_items)
            .map(|_| MsgSlot {
                state: SlotState::Free,
                len: 0,
                handles: Vec::new(),
            })
            .collect();
        Ok(Self {
            item_size,
            max_handles,
            buf: vec![0; bytes],
            slots,
            free: (0..num_items).collect(),
            filled: VecDeque::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Number of messages waiting to be retrieved
    pub fn len(&self) -> usize {
        self.filled.len()
    }

    /// Whether no message is waiting to be retrieved
    pub fn is_empty(&self) -> bool {
        self.filled.is_empty()
    }

    /// Whether every slot is in use
    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// Copies a message into the next free slot
    ///
    /// On success the handles are moved out of `handles` into the slot. On
    /// failure nothing changes: `handles` keeps its contents and the queue
    /// is untouched.
    pub fn enqueue(
        &mut self,
        segments: &[&[u8]],
        handles: &mut Vec<HandleRef>,
    ) -> KernelResult<usize> {
        let len = iovec::total_len(segments);
        if len > self.item_size {
            return Err(KernelError::BadLen);
        }
        if handles.len() > self.max_handles {
            return Err(KernelError::BadLen);
        }
        let index = self.free.pop_front().ok_or(KernelError::QueueFull)?;

        let start = index * self.item_size;
        iovec::gather(segments, &mut self.buf[start..start + len]);
        let slot = &mut self.slots[index];
        slot.state = SlotState::Filled;
        slot.len = len;
        slot.handles = std::mem::take(handles);
        self.filled.push_back(index);
        Ok(len)
    }

    fn info(&self, index: usize) -> MsgInfo {
        let slot = &self.slots[index];
        MsgInfo {
            len: slot.len,
            id: MsgId::new(index as u32),
            num_handles: slot.handles.len(),
        }
    }

    /// Describes the oldest waiting message without retrieving it
    pub fn peek_next(&self) -> KernelResult<MsgInfo> {
        let index = *self.filled.front().ok_or(KernelError::NoMessage)?;
        Ok(self.info(index))
    }

    /// Retrieves the oldest waiting message
    ///
    /// The slot moves to the Read state and stays pinned until consumed.
    pub fn get_next(&mut self) -> KernelResult<MsgInfo> {
        let index = self.filled.pop_front().ok_or(KernelError::NoMessage)?;
        self.slots[index].state = SlotState::Read;
        Ok(self.info(index))
    }

    fn read_slot(&self, id: MsgId) -> KernelResult<usize> {
        let index = id.index();
        match self.slots.get(index) {
            Some(slot) if slot.state == SlotState::Read => Ok(index),
            _ => Err(KernelError::InvalidArgs),
        }
    }

    /// Copies payload bytes of a retrieved message into `dst`
    ///
    /// Copying starts `offset` bytes into the payload. Returns the number
    /// of bytes copied, which is short when `dst` is smaller than the rest
    /// of the payload.
    pub fn read(&self, id: MsgId, offset: usize, dst: &mut [&mut [u8]]) -> KernelResult<usize> {
        let index = self.read_slot(id)?;
        let len = self.slots[index].len;
        if offset > len {
            return Err(KernelError::InvalidArgs);
        }
        let start = index * self.item_size;
        Ok(iovec::scatter(&self.buf[start + offset..start + len], dst))
    }

    /// Moves the handles carried by a retrieved message out of its slot
    pub fn take_handles(&mut self, id: MsgId) -> KernelResult<Vec<HandleRef>> {
        let index = self.read_slot(id)?;
        Ok(std::mem::take(&mut self.slots[index].handles))
    }

    /// Puts handles back into a retrieved message's slot
    pub fn restore_handles(&mut self, id: MsgId, handles: Vec<HandleRef>) -> KernelResult<()> {
        let index = self.read_slot(id)?;
        self.slots[index].handles = handles;
        Ok(())
    }

    /// Handles still attached to a retrieved message
    pub fn handle_count(&self, id: MsgId) -> KernelResult<usize> {
        let index = self.read_slot(id)?;
        Ok(self.slots[index].handles.len())
    }

    /// Returns a retrieved message's slot to the free list
    ///
    /// Handles the receiver never installed are returned for release.
    pub fn consume(&mut self, id: MsgId) -> KernelResult<Vec<HandleRef>> {
        let index = self.read_slot(id)?;
        let slot = &mut self.slots[index];
        slot.state = SlotState::Free;
        slot.len = 0;
        let handles = std::mem::take(&mut slot.handles);
        self.free.push_front(index);
        Ok(handles)
    }

    /// Frees every slot, returning all handles still queued
    pub fn clear(&mut self) -> Vec<HandleRef> {
        let mut released = Vec::new();
        self.filled.clear();
        self.free.clear();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            slot.state = SlotState::Free;
            slot.len = 0;
            released.append(&mut slot.handles);
            self.free.push_back(index);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventObject;
    use crate::handle::{Handle, HandleObject};

    fn event_handle() -> HandleRef {
        Handle::new(HandleObject::Event(EventObject::new()))
    }

    fn read_all(queue: &MsgQueue, info: &MsgInfo) -> Vec<u8> {
        let mut out = vec![0u8; info.len];
        let n = queue.read(info.id, 0, &mut [&mut out[..]]).unwrap();
        out.truncate(n);
        out
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = MsgQueue::new(4, 16, 8).unwrap();
        for payload in [&b"a"[..], b"bb", b"ccc"] {
            queue.enqueue(&[payload], &mut Vec::new()).unwrap();
        }
        assert_eq!(queue.len(), 3);

        for expected in [&b"a"[..], b"bb", b"ccc"] {
            let info = queue.get_next().unwrap();
            assert_eq!(read_all(&queue, &info), expected);
            queue.consume(info.id).unwrap();
        }
        assert_eq!(queue.get_next(), Err(KernelError::NoMessage));
    }

    #[test]
    fn test_full_queue_is_not_mutated() {
        let mut queue = MsgQueue::new(1, 16, 8).unwrap();
        queue.enqueue(&[b"first"], &mut Vec::new()).unwrap();

        let mut handles = vec![event_handle()];
        assert_eq!(
            queue.enqueue(&[b"second"], &mut handles),
            Err(KernelError::QueueFull)
        );
        assert_eq!(handles.len(), 1);
        assert_eq!(queue.len(), 1);

        let info = queue.get_next().unwrap();
        assert_eq!(read_all(&queue, &info), b"first");
        assert_eq!(info.num_handles, 0);
    }

    #[test]
    fn test_read_slot_blocks_reuse_until_consumed() {
        let mut queue = MsgQueue::new(1, 8, 8).unwrap();
        queue.enqueue(&[b"x"], &mut Vec::new()).unwrap();
        let info = queue.get_next().unwrap();
        assert!(queue.is_full());
        assert_eq!(
            queue.enqueue(&[b"y"], &mut Vec::new()),
            Err(KernelError::QueueFull)
        );
        queue.consume(info.id).unwrap();
        assert!(!queue.is_full());
        queue.enqueue(&[b"y"], &mut Vec::new()).unwrap();
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut queue = MsgQueue::new(2, 4, 8).unwrap();
        assert_eq!(
            queue.enqueue(&[b"abc", b"de"], &mut Vec::new()),
            Err(KernelError::BadLen)
        );
        assert_eq!(queue.free_slots(), 2);
        assert_eq!(queue.enqueue(&[b"ab", b"cd"], &mut Vec::new()), Ok(4));
    }

    #[test]
    fn test_too_many_handles_rejected() {
        let mut queue = MsgQueue::new(2, 4, 1).unwrap();
        let mut handles = vec![event_handle(), event_handle()];
        assert_eq!(
            queue.enqueue(&[b"a"], &mut handles),
            Err(KernelError::BadLen)
        );
        assert_eq!(handles.len(), 2);
    }

    #[test]
    fn test_read_with_offset_and_short_buffer() {
        let mut queue = MsgQueue::new(1, 16, 8).unwrap();
        queue.enqueue(&[b"hello world"], &mut Vec::new()).unwrap();
        let info = queue.get_next().unwrap();

        let mut part = [0u8; 5];
        assert_eq!(queue.read(info.id, 6, &mut [&mut part[..]]), Ok(5));
        assert_eq!(&part, b"world");
        assert_eq!(queue.read(info.id, 11, &mut [&mut part[..]]), Ok(0));
        assert_eq!(
            queue.read(info.id, 12, &mut [&mut part[..]]),
            Err(KernelError::InvalidArgs)
        );
    }

    #[test]
    fn test_read_requires_retrieved_message() {
        let mut queue = MsgQueue::new(2, 16, 8).unwrap();
        queue.enqueue(&[b"x"], &mut Vec::new()).unwrap();
        let info = queue.peek_next().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(
            queue.read(info.id, 0, &mut [&mut buf[..]]),
            Err(KernelError::InvalidArgs)
        );
        assert_eq!(queue.consume(info.id).err(), Some(KernelError::InvalidArgs));
        assert_eq!(
            queue.read(MsgId::new(7), 0, &mut [&mut buf[..]]),
            Err(KernelError::InvalidArgs)
        );
    }

    #[test]
    fn test_handles_travel_with_message() {
        let mut queue = MsgQueue::new(2, 16, 8).unwrap();
        let handle = event_handle();
        let mut handles = vec![handle.clone()];
        queue.enqueue(&[b"h"], &mut handles).unwrap();
        assert!(handles.is_empty());
        assert_eq!(handle.ref_count(), 2);

        let info = queue.get_next().unwrap();
        assert_eq!(info.num_handles, 1);
        let taken = queue.take_handles(info.id).unwrap();
        assert!(taken[0].ptr_eq(&handle));
        assert_eq!(queue.handle_count(info.id), Ok(0));

        queue.restore_handles(info.id, taken).unwrap();
        let released = queue.consume(info.id).unwrap();
        assert_eq!(released.len(), 1);
        drop(released);
        assert_eq!(handle.ref_count(), 1);
    }

    #[test]
    fn test_clear_returns_queued_handles() {
        let mut queue = MsgQueue::new(3, 16, 8).unwrap();
        queue.enqueue(&[b"a"], &mut vec![event_handle()]).unwrap();
        queue.enqueue(&[b"b"], &mut vec![event_handle(), event_handle()]).unwrap();
        queue.get_next().unwrap();

        let released = queue.clear();
        assert_eq!(released.len(), 3);
        assert!(queue.is_empty());
        assert_eq!(queue.free_slots(), 3);
    }

    #[test]
    fn test_zero_sized_queue_rejected() {
        assert_eq!(MsgQueue::new(0, 16, 8).err(), Some(KernelError::InvalidArgs));
        assert_eq!(MsgQueue::new(4, 0, 8).err(), Some(KernelError::InvalidArgs));
    }
}
