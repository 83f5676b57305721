//! Named ports
//!
//! A port is the server side of the connection model: an application
//! creates it, the registry publishes it under a path, and clients connect
//! to that path. Every connection attempt leaves a server endpoint in the
//! port's pending queue until the owner accepts it.

use crate::channel::ChannelEnd;
use crate::handle::{Handle, HandleObject, HandleOps, HandleRef};
use crate::registry::RegistryShared;
use crate::sync::lock;
use crate::wait::WaitQueue;
use core_types::AppUuid;
use kernel_api::{KernelError, KernelResult, PortFlags, ReadyFlags};
use log::{debug, trace};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

/// Lifecycle state of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortState {
    /// Created, not yet published
    Invalid,
    /// Published and accepting connections
    Listening,
    /// Shut down
    Closing,
}

/// Parameters every connection to a port inherits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortParams {
    pub num_recv_bufs: usize,
    pub recv_buf_size: usize,
    pub flags: PortFlags,
}

#[derive(Debug)]
struct PortInner {
    state: PortState,
    pending: VecDeque<Arc<ChannelEnd>>,
}

/// A named endpoint accepting connections
pub struct Port {
    path: String,
    owner: AppUuid,
    params: PortParams,
    max_pending: usize,
    max_msg_handles: usize,
    inner: Mutex<PortInner>,
    waitq: Arc<WaitQueue>,
    registry: Weak<RegistryShared>,
}

impl Port {
    pub(crate) fn new(
        path: &str,
        owner: AppUuid,
        params: PortParams,
        max_pending: usize,
        max_msg_handles: usize,
        registry: Weak<RegistryShared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            path: path.to_string(),
            owner,
            params,
            max_pending,
            max_msg_handles,
            inner: Mutex::new(PortInner {
                state: PortState::Invalid,
                pending: VecDeque::new(),
            }),
            waitq: Arc::new(WaitQueue::new()),
            registry,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn owner(&self) -> AppUuid {
        self.owner
    }

    pub fn params(&self) -> PortParams {
        self.params
    }

    pub fn state(&self) -> PortState {
        lock(&self.inner).state
    }

    /// Connections waiting to be accepted
    pub fn pending_count(&self) -> usize {
        lock(&self.inner).pending.len()
    }

    /// Checks whether `client` may connect
    ///
    /// Non-secure clients need ALLOW_NS_CONNECT; secure applications need
    /// ALLOW_TA_CONNECT.
    pub fn check_access(&self, client: AppUuid) -> KernelResult<()> {
        let required = if client.is_ns_client() {
            PortFlags::ALLOW_NS_CONNECT
        } else {
            PortFlags::ALLOW_TA_CONNECT
        };
        if self.params.flags.contains(required) {
            Ok(())
        } else {
            Err(KernelError::AccessDenied)
        }
    }

    /// Moves a fresh port to Listening
    pub(crate) fn start_listening(&self) -> KernelResult<()> {
        let mut inner = lock(&self.inner);
        match inner.state {
            PortState::Invalid => {
                inner.state = PortState::Listening;
                Ok(())
            }
            PortState::Listening => Err(KernelError::AlreadyExists),
            PortState::Closing => Err(KernelError::PeerClosed),
        }
    }

    /// Queues a connection from `client`
    pub(crate) fn attach_client(&self, client: &Arc<ChannelEnd>) -> KernelResult<()> {
        let mut inner = lock(&self.inner);
        if inner.state != PortState::Listening {
            trace!("port '{}' is not listening", self.path);
            return Err(KernelError::NotReady);
        }
        let client_uuid = client.own_uuid().ok_or(KernelError::InvalidArgs)?;
        self.check_access(client_uuid)?;
        if inner.pending.len() >= self.max_pending {
            debug!("port '{}' pending queue full", self.path);
            return Err(KernelError::NoSpace);
        }
        let server = client.attach_server(
            self.owner,
            self.params.num_recv_bufs,
            self.params.recv_buf_size,
            self.max_msg_handles,
        )?;
        inner.pending.push_back(server);
        self.waitq.notify();
        Ok(())
    }

    /// Accepts the oldest pending connection
    ///
    /// Returns the new channel handle and the connecting application's
    /// identity. Fails with [`KernelError::NoMessage`] when nothing is
    /// pending and [`KernelError::PeerClosed`] when the port is shut down or
    /// the client gave up before being accepted.
    pub fn accept(&self) -> KernelResult<(HandleRef, AppUuid)> {
        let server = {
            let mut inner = lock(&self.inner);
            if inner.state != PortState::Listening {
                return Err(KernelError::PeerClosed);
            }
            inner.pending.pop_front().ok_or(KernelError::NoMessage)?
        };
        server.complete_accept()?;
        let peer = server.peer_uuid().ok_or(KernelError::PeerClosed)?;
        debug!("port '{}' accepted connection from {}", self.path, peer);
        Ok((Handle::new(HandleObject::Channel(server)), peer))
    }
}

impl HandleOps for Port {
    fn poll(&self) -> ReadyFlags {
        let inner = lock(&self.inner);
        match inner.state {
            PortState::Listening if !inner.pending.is_empty() => ReadyFlags::READY,
            PortState::Listening => ReadyFlags::empty(),
            PortState::Invalid | PortState::Closing => ReadyFlags::ERROR,
        }
    }

    fn shutdown(&self) {
        let pending = {
            let mut inner = lock(&self.inner);
            if inner.state == PortState::Closing {
                return;
            }
            inner.state = PortState::Closing;
            std::mem::take(&mut inner.pending)
        };
        if let Some(registry) = self.registry.upgrade() {
            registry.unbind(self);
        }
        debug!(
            "port '{}' shut down, dropping {} pending connections",
            self.path,
            pending.len()
        );
        for server in pending {
            server.shutdown();
        }
        self.waitq.notify();
    }

    fn destroy(&self) {
        trace!("destroying port '{}'", self.path);
        self.shutdown();
    }

    fn wait_queue(&self) -> &Arc<WaitQueue> {
        &self.waitq
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("path", &self.path)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .finish()
    }
}
