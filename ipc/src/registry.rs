//! Port registry
//!
//! The registry maps paths to published ports and parks clients that asked
//! to wait for a port that does not exist yet. One registry belongs to one
//! kernel instance.
//!
//! Lock order: registry, then port, then link.

use crate::channel::ChannelEnd;
use crate::handle::{Handle, HandleObject, HandleOps, HandleRef};
use crate::port::{Port, PortParams};
use crate::sync::lock;
use core_types::AppUuid;
use kernel_api::{ConnectFlags, KernelConfig, KernelError, KernelResult, ReadyFlags, Timeout};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct RegistryState {
    ports: HashMap<String, Arc<Port>>,
    waiting: Vec<Arc<ChannelEnd>>,
}

#[derive(Debug)]
pub(crate) struct RegistryShared {
    config: KernelConfig,
    state: Mutex<RegistryState>,
}

impl RegistryShared {
    /// Removes `port` from the path table if it is the port bound there
    pub(crate) fn unbind(&self, port: &Port) {
        let mut state = lock(&self.state);
        let bound_here = state
            .ports
            .get(port.path())
            .is_some_and(|bound| std::ptr::eq(Arc::as_ptr(bound), port));
        if bound_here {
            state.ports.remove(port.path());
            debug!("port '{}' unpublished", port.path());
        }
    }
}

/// Path-to-port table of one kernel
#[derive(Debug, Clone)]
pub struct PortRegistry {
    shared: Arc<RegistryShared>,
}

impl PortRegistry {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                config,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.shared.config
    }

    /// Creates an unpublished port owned by `owner`
    ///
    /// Buffer parameters must be non-zero and within the configured channel
    /// limits. An empty path is rejected with [`KernelError::InvalidArgs`];
    /// a path that does not fit the path buffer with
    /// [`KernelError::TooBig`].
    pub fn port_create(
        &self,
        owner: AppUuid,
        path: &str,
        params: PortParams,
    ) -> KernelResult<HandleRef> {
        let config = &self.shared.config;
        if params.num_recv_bufs == 0
            || params.num_recv_bufs > config.max_chan_bufs
            || params.recv_buf_size == 0
            || params.recv_buf_size > config.max_chan_buf_size
        {
            debug!(
                "invalid buffer sizes: {} x {}",
                params.num_recv_bufs, params.recv_buf_size
            );
            return Err(KernelError::InvalidArgs);
        }
        if path.is_empty() {
            return Err(KernelError::InvalidArgs);
        }
        if path.len() >= config.port_path_max {
            return Err(KernelError::TooBig);
        }
        let port = Port::new(
            path,
            owner,
            params,
            config.max_pending_connections,
            config.max_msg_handles,
            Arc::downgrade(&self.shared),
        );
        debug!("port '{}' created by {}", path, owner);
        Ok(Handle::new(HandleObject::Port(port)))
    }

    /// Makes a port reachable under its path
    ///
    /// Clients parked on the path are attached right away; a client that
    /// cannot be attached is shut down so its owner sees the failure.
    pub fn publish(&self, port_handle: &HandleRef) -> KernelResult<()> {
        let port = port_handle.as_port()?;
        let mut state = lock(&self.shared.state);
        if state.ports.contains_key(port.path()) {
            debug!("port '{}' already exists", port.path());
            return Err(KernelError::AlreadyExists);
        }
        port.start_listening()?;
        state.ports.insert(port.path().to_string(), port.clone());
        debug!("port '{}' published", port.path());

        let (parked, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.waiting)
            .into_iter()
            .partition(|client| client.path() == port.path());
        state.waiting = rest;
        for client in parked {
            if !client.is_waiting_for_port() {
                continue;
            }
            if let Err(err) = port.attach_client(&client) {
                debug!("failed ({}) to attach parked client to '{}'", err, port.path());
                client.shutdown();
            }
        }
        Ok(())
    }

    /// Looks up a published port
    pub fn find(&self, path: &str) -> Option<Arc<Port>> {
        lock(&self.shared.state).ports.get(path).cloned()
    }

    /// Number of published ports
    pub fn port_count(&self) -> usize {
        lock(&self.shared.state).ports.len()
    }

    /// Number of clients parked until their port is published
    pub fn waiting_count(&self) -> usize {
        let mut state = lock(&self.shared.state);
        state.waiting.retain(|c| c.is_waiting_for_port());
        state.waiting.len()
    }

    /// Starts a connection without waiting for it to be accepted
    ///
    /// The returned handle reports READY once the server accepts and HUP if
    /// the connection is refused or dropped. Without WAIT_FOR_PORT a missing
    /// port fails with [`KernelError::NotFound`].
    pub fn connect_async(
        &self,
        client_uuid: AppUuid,
        path: &str,
        flags: ConnectFlags,
    ) -> KernelResult<HandleRef> {
        if path.is_empty() || path.len() >= self.shared.config.port_path_max {
            return Err(KernelError::InvalidArgs);
        }
        let client = ChannelEnd::new_client(client_uuid, path);
        {
            let mut state = lock(&self.shared.state);
            state.waiting.retain(|c| c.is_waiting_for_port());
            match state.ports.get(path).cloned() {
                Some(port) => port.attach_client(&client)?,
                None if flags.contains(ConnectFlags::WAIT_FOR_PORT) => {
                    debug!("{} waiting for port '{}'", client_uuid, path);
                    client.set_waiting_for_port();
                    state.waiting.push(client.clone());
                }
                None => return Err(KernelError::NotFound),
            }
        }
        Ok(Handle::new(HandleObject::Channel(client)))
    }

    /// Connects to `path`, waiting for the server unless ASYNC is set
    ///
    /// A blocking connect logs a warning once the configured connect warning
    /// timeout passes and keeps waiting. If the server closes the connection
    /// without sending anything the call fails with
    /// [`KernelError::PeerClosed`].
    pub fn connect(
        &self,
        client_uuid: AppUuid,
        path: &str,
        flags: ConnectFlags,
    ) -> KernelResult<HandleRef> {
        let handle = self.connect_async(client_uuid, path, flags)?;
        if flags.contains(ConnectFlags::ASYNC) {
            return Ok(handle);
        }
        let warn_after = Timeout::from_millis(self.shared.config.connect_warn_timeout_ms);
        let event = match handle.wait(warn_after) {
            Err(KernelError::TimedOut) => {
                warn!("{} still waiting for '{}' to accept", client_uuid, path);
                handle.wait(Timeout::INFINITE)
            }
            other => other,
        };
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                handle.close();
                return Err(err);
            }
        };
        if event.contains(ReadyFlags::HUP) && !event.contains(ReadyFlags::MSG) {
            handle.close();
            return Err(KernelError::PeerClosed);
        }
        if !event.contains(ReadyFlags::READY) {
            handle.close();
            return Err(KernelError::NotReady);
        }
        Ok(handle)
    }
}
