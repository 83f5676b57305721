//! Application lifecycle notifiers
//!
//! Kernel subsystems that keep per-application state register a notifier
//! while the kernel boots. Registration and ALS slot allocation happen on a
//! [`NotifierRegistryBuilder`]; once built, the [`NotifierRegistry`] cannot
//! change.

use crate::app::{App, AppState};
use core_types::AlsSlotId;
use kernel_api::KernelResult;
use log::{debug, warn};
use std::sync::Arc;

/// Hooks run when an application starts and stops
pub trait AppNotifier: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Sets up per-application state
    fn startup(&self, app: &App) -> KernelResult<()>;

    /// Tears down per-application state
    fn shutdown(&self, _app: &App) -> KernelResult<()> {
        Ok(())
    }
}

/// Collects notifiers and ALS slots during boot
#[derive(Default)]
pub struct NotifierRegistryBuilder {
    notifiers: Vec<Arc<dyn AppNotifier>>,
    als_slots: u32,
}

impl NotifierRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a new ALS slot; ids start at 1
    pub fn alloc_als_slot(&mut self) -> AlsSlotId {
        self.als_slots += 1;
        AlsSlotId::new(self.als_slots)
    }

    /// Adds a notifier; startups run in registration order
    pub fn register(&mut self, notifier: Arc<dyn AppNotifier>) -> &mut Self {
        debug!("registered app notifier '{}'", notifier.name());
        self.notifiers.push(notifier);
        self
    }

    pub fn build(self) -> NotifierRegistry {
        NotifierRegistry {
            notifiers: self.notifiers,
            als_slots: self.als_slots as usize,
        }
    }
}

/// Immutable set of lifecycle notifiers
pub struct NotifierRegistry {
    notifiers: Vec<Arc<dyn AppNotifier>>,
    als_slots: usize,
}

impl NotifierRegistry {
    /// Number of ALS slots every application must carry
    pub fn als_slot_count(&self) -> usize {
        self.als_slots
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Runs every startup hook in registration order
    ///
    /// On the first failure the notifiers that already started are shut
    /// down in reverse order and the error is returned.
    pub fn startup(&self, app: &App) -> KernelResult<()> {
        for (started, notifier) in self.notifiers.iter().enumerate() {
            if let Err(err) = notifier.startup(app) {
                warn!(
                    "startup notifier '{}' failed for {}: {}",
                    notifier.name(),
                    app.uuid(),
                    err
                );
                for done in self.notifiers[..started].iter().rev() {
                    if let Err(undo_err) = done.shutdown(app) {
                        warn!("rollback of '{}' failed: {}", done.name(), undo_err);
                    }
                }
                return Err(err);
            }
        }
        app.set_state(AppState::Running);
        Ok(())
    }

    /// Runs every shutdown hook in reverse registration order
    ///
    /// All hooks run even if one fails; the first error is returned.
    pub fn shutdown(&self, app: &App) -> KernelResult<()> {
        let mut first_err = None;
        for notifier in self.notifiers.iter().rev() {
            if let Err(err) = notifier.shutdown(app) {
                warn!(
                    "shutdown notifier '{}' failed for {}: {}",
                    notifier.name(),
                    app.uuid(),
                    err
                );
                first_err.get_or_insert(err);
            }
        }
        app.set_state(AppState::Stopped);
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::AppProps;
    use core_types::AppUuid;
    use kernel_api::KernelError;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        journal: Arc<Mutex<Vec<String>>>,
        fail_startup: bool,
    }

    impl AppNotifier for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn startup(&self, _app: &App) -> KernelResult<()> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("start {}", self.name));
            if self.fail_startup {
                Err(KernelError::NoSpace)
            } else {
                Ok(())
            }
        }

        fn shutdown(&self, _app: &App) -> KernelResult<()> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("stop {}", self.name));
            Ok(())
        }
    }

    fn recorder(
        name: &'static str,
        journal: &Arc<Mutex<Vec<String>>>,
        fail_startup: bool,
    ) -> Arc<dyn AppNotifier> {
        Arc::new(Recorder {
            name,
            journal: journal.clone(),
            fail_startup,
        })
    }

    fn app(registry: &NotifierRegistry) -> App {
        App::new(AppProps::new(AppUuid::new()), registry.als_slot_count())
    }

    #[test]
    fn test_als_slots_are_one_based() {
        let mut builder = NotifierRegistryBuilder::new();
        assert_eq!(builder.alloc_als_slot(), AlsSlotId::new(1));
        assert_eq!(builder.alloc_als_slot(), AlsSlotId::new(2));
        let registry = builder.build();
        assert_eq!(registry.als_slot_count(), 2);
        assert_eq!(app(&registry).als_slot_count(), 2);
    }

    #[test]
    fn test_startup_order_and_reverse_shutdown() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut builder = NotifierRegistryBuilder::new();
        builder
            .register(recorder("a", &journal, false))
            .register(recorder("b", &journal, false));
        let registry = builder.build();
        let app = app(&registry);

        registry.startup(&app).unwrap();
        assert_eq!(app.state(), AppState::Running);
        registry.shutdown(&app).unwrap();
        assert_eq!(app.state(), AppState::Stopped);
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["start a", "start b", "stop b", "stop a"]
        );
    }

    #[test]
    fn test_failed_startup_rolls_back() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut builder = NotifierRegistryBuilder::new();
        builder
            .register(recorder("a", &journal, false))
            .register(recorder("b", &journal, false))
            .register(recorder("c", &journal, true))
            .register(recorder("d", &journal, false));
        let registry = builder.build();
        let app = app(&registry);

        assert_eq!(registry.startup(&app), Err(KernelError::NoSpace));
        assert_eq!(app.state(), AppState::Loaded);
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["start a", "start b", "start c", "stop b", "stop a"]
        );
    }
}
