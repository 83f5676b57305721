//! # Kernel API
//!
//! This crate defines the contract between secure applications and the
//! kernel IPC subsystem.
//!
//! ## Philosophy
//!
//! The kernel provides **mechanisms**, not policies:
//! - Named ports and connection-oriented channels (not shared memory)
//! - Capabilities addressed by small per-application ids
//! - Explicit timeouts on every blocking call
//! - A closed, numbered syscall table
//!
//! ## Contents
//!
//! - [`KernelError`]: the error taxonomy and its status codes
//! - [`Timeout`] / [`Deadline`]: blocking-call timeouts
//! - [`KernelConfig`]: table sizes and message limits
//! - [`abi`]: trap numbers, flag words and user-visible layouts

pub mod abi;
pub mod config;
pub mod error;
pub mod time;

pub use abi::{
    ConnectFlags, IovecUser, IpcMsgUser, MsgInfo, PortFlags, ReadyFlags, SendFlags, SyscallNr,
    UEvent,
};
pub use config::{
    KernelConfig, DEFAULT_MAX_HANDLES, IPC_CHAN_MAX_BUFS, IPC_CHAN_MAX_BUF_SIZE,
    DEFAULT_MAX_IOVECS, DEFAULT_MAX_PENDING, IPC_PORT_PATH_MAX, MAX_MSG_HANDLES,
};
pub use error::{to_status, KernelError, KernelResult};
pub use time::{Deadline, Timeout};
