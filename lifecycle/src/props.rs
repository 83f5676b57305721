//! Application properties
//!
//! The manifest of a secure application carries its UUID followed by a
//! flat list of `u32` config words: a key, then the key's values. The
//! kernel reads stack and heap minimums from it at load time and looks up
//! MMIO mapping requests later, when the application asks for them.

use core_types::AppUuid;
use kernel_api::{KernelError, KernelResult};
use serde::{Deserialize, Serialize};

pub const PAGE_SIZE: usize = 4096;

pub const DEFAULT_MIN_STACK_SIZE: usize = PAGE_SIZE;

pub const DEFAULT_MIN_HEAP_SIZE: usize = 4 * PAGE_SIZE;

/// Config word keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ConfigKey {
    /// One value: minimum stack size in bytes
    MinStackSize = 1,
    /// One value: minimum heap size in bytes
    MinHeapSize = 2,
    /// Three values: mapping id, physical offset, size
    MapMem = 3,
}

impl ConfigKey {
    pub fn from_raw(raw: u32) -> Option<ConfigKey> {
        match raw {
            1 => Some(ConfigKey::MinStackSize),
            2 => Some(ConfigKey::MinHeapSize),
            3 => Some(ConfigKey::MapMem),
            _ => None,
        }
    }

    /// Number of value words following the key
    pub fn value_count(&self) -> usize {
        match self {
            ConfigKey::MinStackSize | ConfigKey::MinHeapSize => 1,
            ConfigKey::MapMem => 3,
        }
    }
}

/// A device memory range an application may map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmioMapping {
    pub id: u32,
    pub offset: u64,
    pub size: u64,
}

/// Load-time description of an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppProps {
    pub uuid: AppUuid,
    #[serde(default = "default_stack")]
    pub min_stack_size: usize,
    #[serde(default = "default_heap")]
    pub min_heap_size: usize,
    #[serde(default)]
    pub map_io_mem: Vec<MmioMapping>,
    /// Raw config words as found in the manifest
    #[serde(default)]
    pub config_entries: Vec<u32>,
}

fn default_stack() -> usize {
    DEFAULT_MIN_STACK_SIZE
}

fn default_heap() -> usize {
    DEFAULT_MIN_HEAP_SIZE
}

fn round_up_page(value: usize) -> usize {
    value.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

impl AppProps {
    /// Properties with default sizes and no config words
    pub fn new(uuid: AppUuid) -> Self {
        Self {
            uuid,
            min_stack_size: DEFAULT_MIN_STACK_SIZE,
            min_heap_size: DEFAULT_MIN_HEAP_SIZE,
            map_io_mem: Vec::new(),
            config_entries: Vec::new(),
        }
    }

    /// Decodes the manifest config words
    ///
    /// Sizes are rounded up to whole pages. An unknown key, a key missing
    /// its values, or a zero size fails with [`KernelError::InvalidArgs`].
    pub fn from_config_entries(uuid: AppUuid, entries: &[u32]) -> KernelResult<Self> {
        let mut props = Self::new(uuid);
        let mut i = 0;
        while i < entries.len() {
            let key = ConfigKey::from_raw(entries[i]).ok_or(KernelError::InvalidArgs)?;
            let values = entries
                .get(i + 1..i + 1 + key.value_count())
                .ok_or(KernelError::InvalidArgs)?;
            match key {
                ConfigKey::MinStackSize => {
                    props.min_stack_size = round_up_page(values[0] as usize);
                    if props.min_stack_size == 0 {
                        return Err(KernelError::InvalidArgs);
                    }
                }
                ConfigKey::MinHeapSize => {
                    props.min_heap_size = round_up_page(values[0] as usize);
                    if props.min_heap_size == 0 {
                        return Err(KernelError::InvalidArgs);
                    }
                }
                ConfigKey::MapMem => props.map_io_mem.push(MmioMapping {
                    id: values[0],
                    offset: u64::from(values[1]),
                    size: round_up_page(values[2] as usize) as u64,
                }),
            }
            i += 1 + key.value_count();
        }
        props.config_entries = entries.to_vec();
        Ok(props)
    }

    /// Finds the mapping request with `id` that can hold `map_size` bytes
    pub fn mmio(&self, id: u32, map_size: u64) -> KernelResult<&MmioMapping> {
        let mapping = self
            .map_io_mem
            .iter()
            .find(|m| m.id == id)
            .ok_or(KernelError::NotFound)?;
        if round_up_page(map_size as usize) as u64 > mapping.size {
            return Err(KernelError::InvalidArgs);
        }
        Ok(mapping)
    }
}
