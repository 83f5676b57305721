//! Identifiers for applications, handles and message slots

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of a loaded application
///
/// Every secure application carries a UUID from its manifest. Channels
/// record the peer's `AppUuid` at connection time so a server always knows
/// who it is talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppUuid(Uuid);

impl AppUuid {
    /// Identity used for clients connecting from the non-secure world
    pub const NS_CLIENT: AppUuid = AppUuid(Uuid::nil());

    /// Creates a new random application identity
    pub fn new() -> Self {
        Self(crate::uuid_tools::new_uuid())
    }

    /// Creates an application identity from a UUID
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates an application identity from raw bytes
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Returns the raw bytes, as copied out to user space
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Checks whether this identity denotes a non-secure world client
    pub fn is_ns_client(&self) -> bool {
        *self == Self::NS_CLIENT
    }
}

impl Default for AppUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AppUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "App({})", self.0)
    }
}

/// Small integer naming a handle inside one application's handle table
///
/// Handle ids are only meaningful relative to the user context that issued
/// them. The same number in two applications names unrelated objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(u32);

impl HandleId {
    /// Distinguished "no handle" value
    pub const INVALID: HandleId = HandleId(u32::MAX);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Table index for this id
    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    pub const fn is_valid(&self) -> bool {
        self.0 != u32::MAX
    }
}

impl From<u32> for HandleId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Handle({})", self.0)
        } else {
            write!(f, "Handle(invalid)")
        }
    }
}

/// Slot number of a message inside a channel's receive queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MsgId(u32);

impl MsgId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Msg({})", self.0)
    }
}

/// Application-local-storage slot
///
/// Slots are allocated at boot, before any application starts, and are
/// numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlsSlotId(u32);

impl AlsSlotId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Zero-based index into an application's slot array
    pub const fn index(&self) -> usize {
        (self.0 as usize).saturating_sub(1)
    }
}

impl fmt::Display for AlsSlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AlsSlot({})", self.0)
    }
}
