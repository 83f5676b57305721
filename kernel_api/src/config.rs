//! Kernel limits
//!
//! These are compile-time constants in a firmware build. Keeping them in a
//! serde-backed struct lets a board configuration or a test pick smaller
//! tables without touching the IPC code.

use crate::error::KernelError;
use serde::{Deserialize, Serialize};

/// Handles a single application may hold at once
pub const DEFAULT_MAX_HANDLES: usize = 64;

/// Handles that may travel in one message
pub const MAX_MSG_HANDLES: usize = 8;

/// Upper bound on receive buffers per channel
pub const IPC_CHAN_MAX_BUFS: usize = 32;

/// Upper bound on a single receive buffer
pub const IPC_CHAN_MAX_BUF_SIZE: usize = 4096;

/// Port path capacity, including the terminator
pub const IPC_PORT_PATH_MAX: usize = 64;

/// Scatter/gather segments accepted per message
pub const DEFAULT_MAX_IOVECS: usize = 16;

/// Connections a port queues before `accept`
pub const DEFAULT_MAX_PENDING: usize = 32;

/// Configurable limits for one kernel instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Handle table capacity per application
    pub max_handles: usize,
    /// Handles per message
    pub max_msg_handles: usize,
    /// Receive buffers per channel
    pub max_chan_bufs: usize,
    /// Size of one receive buffer
    pub max_chan_buf_size: usize,
    /// Port path capacity, including the terminator
    pub port_path_max: usize,
    /// Scatter/gather segments per message
    pub max_iovecs: usize,
    /// Connections a port queues before they are accepted
    pub max_pending_connections: usize,
    /// How long a blocking connect waits before logging a warning and
    /// continuing to wait; `u64::MAX` disables the warning
    pub connect_warn_timeout_ms: u64,
}

impl KernelConfig {
    /// Sets the handle table capacity
    pub fn with_max_handles(mut self, max_handles: usize) -> Self {
        self.max_handles = max_handles;
        self
    }

    /// Sets the per-channel receive buffer limits
    pub fn with_chan_limits(mut self, max_bufs: usize, max_buf_size: usize) -> Self {
        self.max_chan_bufs = max_bufs;
        self.max_chan_buf_size = max_buf_size;
        self
    }

    /// Sets the connect warning timeout
    pub fn with_connect_warn_timeout_ms(mut self, millis: u64) -> Self {
        self.connect_warn_timeout_ms = millis;
        self
    }

    /// Parses a configuration from JSON; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, KernelError> {
        let config: KernelConfig =
            serde_json::from_str(json).map_err(|_| KernelError::InvalidArgs)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every limit is usable
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.max_handles == 0
            || self.max_chan_bufs == 0
            || self.max_chan_buf_size == 0
            || self.max_iovecs == 0
            || self.max_pending_connections == 0
        {
            return Err(KernelError::InvalidArgs);
        }
        if self.port_path_max < 2 {
            return Err(KernelError::InvalidArgs);
        }
        if self.max_msg_handles > MAX_MSG_HANDLES {
            return Err(KernelError::TooBig);
        }
        // handle ids are u32 and u32::MAX is the invalid sentinel
        if self.max_handles >= u32::MAX as usize {
            return Err(KernelError::TooBig);
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_handles: DEFAULT_MAX_HANDLES,
            max_msg_handles: MAX_MSG_HANDLES,
            max_chan_bufs: IPC_CHAN_MAX_BUFS,
            max_chan_buf_size: IPC_CHAN_MAX_BUF_SIZE,
            port_path_max: IPC_PORT_PATH_MAX,
            max_iovecs: DEFAULT_MAX_IOVECS,
            max_pending_connections: DEFAULT_MAX_PENDING,
            connect_warn_timeout_ms: u64::MAX,
        }
    }
}
