//! Syscall ABI shared with applications
//!
//! Trap numbers, flag words and the fixed layouts of the structures that
//! cross the user/kernel boundary. Layouts are little-endian and packed by
//! hand so the kernel never depends on the application's struct padding.

use bitflags::bitflags;
use core_types::{HandleId, MsgId};
use serde::{Deserialize, Serialize};

bitflags! {
    /// Readiness bits reported by `poll` and delivered by `wait`
    ///
    /// Several bits may be set at once. Condition bits (`MSG`, `HUP`, a
    /// port's `READY`) stay set for as long as the condition holds; event
    /// bits (`SEND_UNBLOCKED`, a channel's `READY`) are cleared once a wait
    /// delivers them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ReadyFlags: u32 {
        const READY = 0x1;
        const ERROR = 0x2;
        const HUP = 0x4;
        const MSG = 0x8;
        const SEND_UNBLOCKED = 0x10;
    }
}

bitflags! {
    /// Who may connect to a port
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PortFlags: u32 {
        /// Other secure applications
        const ALLOW_TA_CONNECT = 0x1;
        /// Clients in the non-secure world
        const ALLOW_NS_CONNECT = 0x2;
    }
}

bitflags! {
    /// Options for `connect`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ConnectFlags: u32 {
        /// Park the connection until a port is published at the path
        const WAIT_FOR_PORT = 0x1;
        /// Return immediately; readiness reports the outcome later
        const ASYNC = 0x2;
    }
}

bitflags! {
    /// Options for `send_msg`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SendFlags: u32 {
        /// Fail with `WouldBlock` instead of waiting for a free slot
        const NONBLOCK = 0x1;
    }
}

/// Numbered entry points of the syscall table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum SyscallNr {
    PortCreate = 0x10,
    Connect = 0x11,
    Accept = 0x12,
    Close = 0x13,
    SetCookie = 0x14,
    Wait = 0x18,
    WaitAny = 0x19,
    GetMsg = 0x20,
    ReadMsg = 0x21,
    PutMsg = 0x22,
    SendMsg = 0x23,
}

impl SyscallNr {
    pub const ALL: [SyscallNr; 11] = [
        SyscallNr::PortCreate,
        SyscallNr::Connect,
        SyscallNr::Accept,
        SyscallNr::Close,
        SyscallNr::SetCookie,
        SyscallNr::Wait,
        SyscallNr::WaitAny,
        SyscallNr::GetMsg,
        SyscallNr::ReadMsg,
        SyscallNr::PutMsg,
        SyscallNr::SendMsg,
    ];

    pub fn from_raw(raw: u32) -> Option<SyscallNr> {
        Self::ALL.iter().copied().find(|nr| *nr as u32 == raw)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyscallNr::PortCreate => "port_create",
            SyscallNr::Connect => "connect",
            SyscallNr::Accept => "accept",
            SyscallNr::Close => "close",
            SyscallNr::SetCookie => "set_cookie",
            SyscallNr::Wait => "wait",
            SyscallNr::WaitAny => "wait_any",
            SyscallNr::GetMsg => "get_msg",
            SyscallNr::ReadMsg => "read_msg",
            SyscallNr::PutMsg => "put_msg",
            SyscallNr::SendMsg => "send_msg",
        }
    }
}

/// Event record written by `wait` and `wait_any`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UEvent {
    pub handle: HandleId,
    pub event: ReadyFlags,
    pub cookie: u64,
}

impl UEvent {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.handle.as_u32().to_le_bytes());
        out[4..8].copy_from_slice(&self.event.bits().to_le_bytes());
        out[8..16].copy_from_slice(&self.cookie.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            handle: HandleId::new(read_u32(bytes, 0)),
            event: ReadyFlags::from_bits_retain(read_u32(bytes, 4)),
            cookie: read_u64(bytes, 8),
        }
    }
}

/// Description of the next message in a receive queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgInfo {
    /// Payload length in bytes
    pub len: usize,
    /// Slot to pass to `read_msg` and `put_msg`
    pub id: MsgId,
    /// Handles travelling with the message
    pub num_handles: usize,
}

impl MsgInfo {
    pub const SIZE: usize = 12;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&(self.len as u32).to_le_bytes());
        out[4..8].copy_from_slice(&self.id.as_u32().to_le_bytes());
        out[8..12].copy_from_slice(&(self.num_handles as u32).to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            len: read_u32(bytes, 0) as usize,
            id: MsgId::new(read_u32(bytes, 4)),
            num_handles: read_u32(bytes, 8) as usize,
        }
    }
}

/// One scatter/gather segment in user memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IovecUser {
    pub base: u64,
    pub len: u64,
}

impl IovecUser {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.base.to_le_bytes());
        out[8..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            base: read_u64(bytes, 0),
            len: read_u64(bytes, 8),
        }
    }
}

/// Message descriptor passed to `send_msg` and `read_msg`
///
/// `iov` points at `num_iov` [`IovecUser`] records; `handles` points at
/// `num_handles` little-endian `u32` handle ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcMsgUser {
    pub num_iov: u32,
    pub iov: u64,
    pub num_handles: u32,
    pub handles: u64,
}

impl IpcMsgUser {
    pub const SIZE: usize = 24;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.num_iov.to_le_bytes());
        out[4..8].copy_from_slice(&self.num_handles.to_le_bytes());
        out[8..16].copy_from_slice(&self.iov.to_le_bytes());
        out[16..24].copy_from_slice(&self.handles.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            num_iov: read_u32(bytes, 0),
            num_handles: read_u32(bytes, 4),
            iov: read_u64(bytes, 8),
            handles: read_u64(bytes, 16),
        }
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_numbers() {
        assert_eq!(SyscallNr::from_raw(0x10), Some(SyscallNr::PortCreate));
        assert_eq!(SyscallNr::from_raw(0x23), Some(SyscallNr::SendMsg));
        assert_eq!(SyscallNr::from_raw(0x15), None);
        assert_eq!(SyscallNr::WaitAny.name(), "wait_any");
    }

    #[test]
    fn test_ready_flags_combine() {
        let flags = ReadyFlags::MSG | ReadyFlags::HUP;
        assert!(flags.contains(ReadyFlags::MSG));
        assert!(!flags.contains(ReadyFlags::READY));
        assert_eq!(flags.bits(), 0xc);
    }

    #[test]
    fn test_uevent_layout() {
        let event = UEvent {
            handle: HandleId::new(3),
            event: ReadyFlags::MSG,
            cookie: 0xdead_beef,
        };
        let bytes = event.to_bytes();
        assert_eq!(&bytes[0..4], &[3, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[8, 0, 0, 0]);
        assert_eq!(UEvent::from_bytes(&bytes), event);
    }

    #[test]
    fn test_ipc_msg_user_layout() {
        let msg = IpcMsgUser {
            num_iov: 2,
            iov: 0x1000,
            num_handles: 1,
            handles: 0x2000,
        };
        let bytes = msg.to_bytes();
        assert_eq!(&bytes[0..4], &[2, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[1, 0, 0, 0]);
        assert_eq!(IpcMsgUser::from_bytes(&bytes), msg);
    }
}
