//! # IPC
//!
//! Handles, waiting, and the port/channel connection model.
//!
//! ## Philosophy
//!
//! - **Capabilities are counted references**: a [`HandleRef`] keeps its
//!   object alive; the object is destroyed exactly once, when the last
//!   reference is released
//! - **Readiness is level-triggered**: waiters re-poll after every wakeup,
//!   so a missed notification can only cost a loop iteration
//! - **Connections lock as a pair**: both endpoints of a channel share one
//!   lock, so a close can never race a send on the other side
//!
//! ## Contents
//!
//! - [`Handle`], [`HandleRef`], [`HandleOps`]: the capability object
//! - [`WaitEvent`], [`WaitQueue`], [`HandleList`]: blocking and multiplexing
//! - [`MsgQueue`]: fixed-slot receive queue
//! - [`PortRegistry`], [`Port`], [`ChannelEnd`]: the connection model

mod sync;

pub mod channel;
pub mod event;
pub mod handle;
pub mod handle_list;
pub mod iovec;
pub mod msg_queue;
pub mod port;
pub mod registry;
pub mod wait;

pub use channel::{AuxState, ChanState, ChannelEnd, Side};
pub use event::EventObject;
pub use handle::{Handle, HandleKind, HandleObject, HandleOps, HandleRef, WeakHandleRef};
pub use handle_list::HandleList;
pub use msg_queue::MsgQueue;
pub use port::{Port, PortParams, PortState};
pub use registry::PortRegistry;
pub use wait::{WaitEvent, WaitQueue};
