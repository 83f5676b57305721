//! # Lifecycle
//!
//! Loaded applications, their local storage, and the hooks kernel
//! subsystems run when an application starts or stops.
//!
//! ## Philosophy
//!
//! - **Registration closes before boot**: notifiers and storage slots are
//!   collected by a builder; the built registry is immutable
//! - **Startup is all or nothing**: a failing startup hook unwinds the hooks
//!   that already ran
//! - **Subsystems own their slot**: each notifier keeps its per-application
//!   state in an ALS slot it allocated, not in a global map
//!
//! ## Core Concepts
//!
//! - [`AppProps`]: what the manifest says about an application
//! - [`App`]: a loaded application with its ALS slots
//! - [`AppNotifier`]: startup/shutdown hook
//! - [`NotifierRegistryBuilder`] / [`NotifierRegistry`]: hook registration

pub mod app;
pub mod notifier;
pub mod props;

pub use app::{App, AppState};
pub use notifier::{AppNotifier, NotifierRegistry, NotifierRegistryBuilder};
pub use props::{AppProps, ConfigKey, MmioMapping};
