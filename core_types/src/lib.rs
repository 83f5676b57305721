//! # Core Types
//!
//! Identifiers shared by every crate in the IPC kernel.
//!
//! ## Philosophy
//!
//! - **Explicit over implicit**: handle ids, message ids and slot ids are
//!   distinct types and cannot be confused with each other.
//! - **No ambient authority**: an application can only name objects through
//!   a [`HandleId`] issued by its own handle table.
//!
//! ## Key Types
//!
//! - [`AppUuid`]: identity of a secure application (or the non-secure client)
//! - [`HandleId`]: small integer naming a handle in one application's table
//! - [`MsgId`]: slot number of a message in a channel receive queue
//! - [`AlsSlotId`]: application-local-storage slot

pub mod ids;
pub mod uuid_tools;

pub use ids::{AlsSlotId, AppUuid, HandleId, MsgId};
pub use uuid_tools::{new_uuid, uuid_from_fields};
