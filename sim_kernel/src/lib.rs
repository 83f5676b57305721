//! # Simulated Kernel
//!
//! The IPC kernel running in-process: applications, their handle tables
//! and the syscall surface they use.
//!
//! ## Purpose
//!
//! - Runs under `cargo test` with real threads and real blocking
//! - Inspectable (every application and port can be looked up)
//! - Reaches the IPC core only through the same calls an application makes
//!
//! ## Philosophy
//!
//! **Applications hold ids, never objects.** Every syscall resolves ids
//! through the caller's [`UserContext`], so an application can only touch
//! what it created, accepted or was sent.
//!
//! Per-application state hangs off lifecycle notifiers. The user context
//! notifier is always registered first, so every other notifier sees a
//! ready handle table and tears down before it.

pub mod syscall_gate;
pub mod syscalls;
pub mod uctx;
pub mod user_memory;

pub use syscall_gate::{SyscallAuditLog, SyscallEvent, SyscallGate};
pub use uctx::{UctxNotifier, UserContext};
pub use user_memory::{Access, UserMemory};

use core_types::{AlsSlotId, AppUuid};
use ipc::PortRegistry;
use kernel_api::{KernelConfig, KernelError, KernelResult};
use lifecycle::{App, AppNotifier, AppProps, NotifierRegistry, NotifierRegistryBuilder};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Kernel state shared by every application thread
pub struct SimulatedKernel {
    config: KernelConfig,
    registry: PortRegistry,
    notifiers: NotifierRegistry,
    uctx_slot: AlsSlotId,
    apps: Mutex<HashMap<AppUuid, Arc<App>>>,
}

/// Boot-time configuration of a [`SimulatedKernel`]
pub struct SimulatedKernelBuilder {
    config: KernelConfig,
    registry: NotifierRegistryBuilder,
    uctx_slot: AlsSlotId,
    notifiers: Vec<Arc<dyn AppNotifier>>,
}

impl SimulatedKernelBuilder {
    fn new() -> Self {
        let mut registry = NotifierRegistryBuilder::new();
        let uctx_slot = registry.alloc_als_slot();
        Self {
            config: KernelConfig::default(),
            registry,
            uctx_slot,
            notifiers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    /// Reserves an application-local storage slot for a notifier
    pub fn alloc_als_slot(&mut self) -> AlsSlotId {
        self.registry.alloc_als_slot()
    }

    /// Adds a lifecycle notifier; it runs after the user context notifier
    pub fn register_notifier(mut self, notifier: Arc<dyn AppNotifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Boots the kernel
    ///
    /// Fails with [`KernelError::InvalidArgs`] or [`KernelError::TooBig`]
    /// if the configuration does not validate.
    pub fn build(self) -> KernelResult<SimulatedKernel> {
        self.config.validate()?;
        Ok(self.boot())
    }

    fn boot(self) -> SimulatedKernel {
        let mut registry = self.registry;
        registry.register(Arc::new(UctxNotifier::new(
            self.uctx_slot,
            self.config.max_handles,
        )));
        for notifier in self.notifiers {
            registry.register(notifier);
        }
        let notifiers = registry.build();
        info!(
            "kernel booted: {} handles per app, {} notifiers",
            self.config.max_handles,
            notifiers.len()
        );
        SimulatedKernel {
            registry: PortRegistry::new(self.config.clone()),
            config: self.config,
            notifiers,
            uctx_slot: self.uctx_slot,
            apps: Mutex::new(HashMap::new()),
        }
    }
}

impl SimulatedKernel {
    pub fn builder() -> SimulatedKernelBuilder {
        SimulatedKernelBuilder::new()
    }

    /// Boots a kernel with the default configuration
    pub fn new() -> Self {
        SimulatedKernelBuilder::new().boot()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn registry(&self) -> &PortRegistry {
        &self.registry
    }

    pub fn notifiers(&self) -> &NotifierRegistry {
        &self.notifiers
    }

    fn apps(&self) -> MutexGuard<'_, HashMap<AppUuid, Arc<App>>> {
        self.apps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads an application and runs its startup notifiers
    ///
    /// Fails with [`KernelError::AlreadyExists`] if an application with the
    /// same UUID is loaded. If a notifier fails the application is not
    /// loaded and the notifier's error is returned.
    pub fn load_app(&self, props: AppProps) -> KernelResult<Arc<App>> {
        let uuid = props.uuid;
        if self.apps().contains_key(&uuid) {
            return Err(KernelError::AlreadyExists);
        }
        let app = Arc::new(App::new(props, self.notifiers.als_slot_count()));
        self.notifiers.startup(&app)?;

        let mut apps = self.apps();
        if apps.contains_key(&uuid) {
            drop(apps);
            // lost a race with a concurrent load of the same app
            if let Err(err) = self.notifiers.shutdown(&app) {
                warn!("unwinding duplicate load of {} failed: {}", uuid, err);
            }
            return Err(KernelError::AlreadyExists);
        }
        apps.insert(uuid, app.clone());
        debug!("loaded {}", uuid);
        Ok(app)
    }

    /// Runs the shutdown notifiers of an application and forgets it
    pub fn unload_app(&self, uuid: &AppUuid) -> KernelResult<()> {
        let app = self.apps().remove(uuid).ok_or(KernelError::NotFound)?;
        let result = self.notifiers.shutdown(&app);
        debug!("unloaded {}", uuid);
        result
    }

    pub fn find_app(&self, uuid: &AppUuid) -> Option<Arc<App>> {
        self.apps().get(uuid).cloned()
    }

    pub fn app_count(&self) -> usize {
        self.apps().len()
    }

    /// Returns the handle table of a running application
    pub fn uctx(&self, app: &App) -> KernelResult<Arc<UserContext>> {
        app.als_get::<UserContext>(self.uctx_slot)
            .ok_or(KernelError::NotFound)
    }
}

impl Default for SimulatedKernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingNotifier {
        started: AtomicUsize,
        stopped: AtomicUsize,
        fail: bool,
    }

    impl CountingNotifier {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                started: AtomicUsize::new(0),
                stopped: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl AppNotifier for CountingNotifier {
        fn name(&self) -> &str {
            "counting"
        }

        fn startup(&self, _app: &App) -> KernelResult<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(KernelError::NoSpace)
            } else {
                Ok(())
            }
        }

        fn shutdown(&self, _app: &App) -> KernelResult<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_load_app_attaches_uctx() {
        let kernel = SimulatedKernel::new();
        let app = kernel.load_app(AppProps::new(AppUuid::new())).unwrap();
        let uctx = kernel.uctx(&app).unwrap();
        assert_eq!(uctx.capacity(), kernel.config().max_handles);
        assert_eq!(uctx.owner(), app.uuid());
        assert!(kernel.find_app(&app.uuid()).is_some());
    }

    #[test]
    fn test_duplicate_load_rejected() {
        let kernel = SimulatedKernel::new();
        let props = AppProps::new(AppUuid::new());
        kernel.load_app(props.clone()).unwrap();
        assert_eq!(kernel.load_app(props).err(), Some(KernelError::AlreadyExists));
        assert_eq!(kernel.app_count(), 1);
    }

    #[test]
    fn test_builder_runs_uctx_first() {
        let counting = CountingNotifier::new(false);
        let kernel = SimulatedKernel::builder()
            .with_config(KernelConfig::default().with_max_handles(4))
            .register_notifier(counting.clone())
            .build()
            .unwrap();
        assert_eq!(kernel.notifiers().len(), 2);

        let app = kernel.load_app(AppProps::new(AppUuid::new())).unwrap();
        assert_eq!(kernel.uctx(&app).unwrap().capacity(), 4);
        assert_eq!(counting.started.load(Ordering::SeqCst), 1);

        kernel.unload_app(&app.uuid()).unwrap();
        assert_eq!(counting.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(kernel.uctx(&app).err(), Some(KernelError::NotFound));
        assert_eq!(kernel.unload_app(&app.uuid()), Err(KernelError::NotFound));
    }

    #[test]
    fn test_failed_startup_aborts_load() {
        let failing = CountingNotifier::new(true);
        let kernel = SimulatedKernel::builder()
            .register_notifier(failing)
            .build()
            .unwrap();
        let props = AppProps::new(AppUuid::new());
        assert_eq!(kernel.load_app(props.clone()).err(), Some(KernelError::NoSpace));
        assert!(kernel.find_app(&props.uuid).is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = SimulatedKernel::builder()
            .with_config(KernelConfig::default().with_max_handles(0))
            .build();
        assert!(matches!(result, Err(KernelError::InvalidArgs)));
    }

    struct RendezvousNotifier {
        barrier: std::sync::Barrier,
        unwound: AtomicUsize,
    }

    impl AppNotifier for RendezvousNotifier {
        fn name(&self) -> &str {
            "rendezvous"
        }

        fn startup(&self, _app: &App) -> KernelResult<()> {
            self.barrier.wait();
            Ok(())
        }

        fn shutdown(&self, _app: &App) -> KernelResult<()> {
            self.unwound.fetch_add(1, Ordering::SeqCst);
            Err(KernelError::NotReady)
        }
    }

    #[test]
    fn test_racing_duplicate_load_unwinds_loser() {
        let notifier = Arc::new(RendezvousNotifier {
            barrier: std::sync::Barrier::new(2),
            unwound: AtomicUsize::new(0),
        });
        let kernel = Arc::new(
            SimulatedKernel::builder()
                .register_notifier(notifier.clone())
                .build()
                .unwrap(),
        );
        let props = AppProps::new(AppUuid::new());

        let loaders: Vec<_> = (0..2)
            .map(|_| {
                let kernel = kernel.clone();
                let props = props.clone();
                std::thread::spawn(move || kernel.load_app(props).map(|app| app.uuid()))
            })
            .collect();
        let results: Vec<_> = loaders.into_iter().map(|t| t.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.contains(&Err(KernelError::AlreadyExists)));
        // the failing shutdown hook still ran and the winner stays loaded
        assert_eq!(notifier.unwound.load(Ordering::SeqCst), 1);
        assert_eq!(kernel.app_count(), 1);
    }
}
