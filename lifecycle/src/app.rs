//! Loaded applications and application-local storage

use crate::props::AppProps;
use core_types::{AlsSlotId, AppUuid};
use kernel_api::{KernelError, KernelResult};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type AlsValue = Arc<dyn Any + Send + Sync>;

/// Where an application is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppState {
    /// Loaded, startup hooks not yet run
    Loaded,
    Running,
    /// Shutdown hooks have run
    Stopped,
}

/// A loaded secure application
///
/// Each kernel subsystem that registered an ALS slot keeps its
/// per-application state in that slot.
pub struct App {
    props: AppProps,
    state: Mutex<AppState>,
    als: Mutex<Vec<Option<AlsValue>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl App {
    /// Creates an application with `als_slots` empty storage slots
    pub fn new(props: AppProps, als_slots: usize) -> Self {
        Self {
            props,
            state: Mutex::new(AppState::Loaded),
            als: Mutex::new(vec![None; als_slots]),
        }
    }

    pub fn uuid(&self) -> AppUuid {
        self.props.uuid
    }

    pub fn props(&self) -> &AppProps {
        &self.props
    }

    pub fn state(&self) -> AppState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: AppState) {
        *lock(&self.state) = state;
    }

    /// Number of ALS slots this application carries
    pub fn als_slot_count(&self) -> usize {
        lock(&self.als).len()
    }

    fn check_slot(slot: AlsSlotId, count: usize) -> KernelResult<usize> {
        if slot.as_u32() == 0 || slot.index() >= count {
            return Err(KernelError::InvalidArgs);
        }
        Ok(slot.index())
    }

    /// Stores `value` in `slot`, replacing what was there
    pub fn als_set<T: Any + Send + Sync>(&self, slot: AlsSlotId, value: Arc<T>) -> KernelResult<()> {
        let mut als = lock(&self.als);
        let index = Self::check_slot(slot, als.len())?;
        als[index] = Some(value);
        Ok(())
    }

    /// Returns the value in `slot` if it holds a `T`
    pub fn als_get<T: Any + Send + Sync>(&self, slot: AlsSlotId) -> Option<Arc<T>> {
        let als = lock(&self.als);
        let index = Self::check_slot(slot, als.len()).ok()?;
        als[index].clone()?.downcast::<T>().ok()
    }

    /// Empties `slot`, returning its value if it holds a `T`
    pub fn als_take<T: Any + Send + Sync>(&self, slot: AlsSlotId) -> Option<Arc<T>> {
        let value = {
            let mut als = lock(&self.als);
            let index = Self::check_slot(slot, als.len()).ok()?;
            als[index].take()?
        };
        value.downcast::<T>().ok()
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("uuid", &self.props.uuid)
            .field("state", &self.state())
            .field("als_slots", &self.als_slot_count())
            .finish()
    }
}
