//! Resilience Test Utilities
//!
//! Shared fixtures for the cross-crate IPC tests.
//!
//! ## Test Philosophy
//!
//! - **Real blocking**: waits, connects and sends block real threads
//! - **No leaks**: every handle is released exactly once, whichever side goes away first
//! - **No partial effects**: a failed call leaves queues and handle tables untouched

use core_types::{AppUuid, HandleId};
use kernel_api::{ConnectFlags, KernelConfig, KernelResult, PortFlags, SendFlags};
use lifecycle::{App, AppProps};
use sim_kernel::SimulatedKernel;
use std::sync::Arc;

/// Boots a kernel with the default configuration
pub fn test_kernel() -> SimulatedKernel {
    SimulatedKernel::new()
}

/// Boots a kernel with a custom configuration
pub fn test_kernel_with(config: KernelConfig) -> SimulatedKernel {
    match SimulatedKernel::builder().with_config(config).build() {
        Ok(kernel) => kernel,
        Err(err) => panic!("test kernel config rejected: {}", err),
    }
}

/// Loads a fresh secure application
pub fn load_test_app(kernel: &SimulatedKernel) -> Arc<App> {
    match kernel.load_app(AppProps::new(AppUuid::new())) {
        Ok(app) => app,
        Err(err) => panic!("failed to load test app: {}", err),
    }
}

/// An accepted connection between two applications
pub struct Connection {
    pub server: Arc<App>,
    pub client: Arc<App>,
    pub port: HandleId,
    pub server_chan: HandleId,
    pub client_chan: HandleId,
}

/// Publishes `path` from a new server app and connects a new client app
///
/// The client connects asynchronously, so no second thread is needed.
pub fn connect_pair(
    kernel: &SimulatedKernel,
    path: &str,
    num_bufs: usize,
    buf_size: usize,
) -> KernelResult<Connection> {
    let server = load_test_app(kernel);
    let client = load_test_app(kernel);
    let port = kernel.sys_port_create(
        &server,
        path,
        num_bufs,
        buf_size,
        PortFlags::ALLOW_TA_CONNECT,
    )?;
    let client_chan = kernel.sys_connect(&client, path, ConnectFlags::ASYNC)?;
    let (server_chan, _) = kernel.sys_accept(&server, port)?;
    Ok(Connection {
        server,
        client,
        port,
        server_chan,
        client_chan,
    })
}

/// Sends `bytes` without blocking and without handles
pub fn send_bytes(
    kernel: &SimulatedKernel,
    app: &App,
    chan: HandleId,
    bytes: &[u8],
) -> KernelResult<usize> {
    kernel.sys_send_msg(app, chan, &[bytes], &[], SendFlags::NONBLOCK)
}

/// Retrieves, reads and releases the next message
pub fn recv_bytes(kernel: &SimulatedKernel, app: &App, chan: HandleId) -> KernelResult<Vec<u8>> {
    let info = kernel.sys_get_msg(app, chan)?;
    let mut buf = vec![0u8; info.len];
    let len = kernel.sys_read_msg(app, chan, info.id, 0, &mut [buf.as_mut_slice()])?;
    buf.truncate(len);
    kernel.sys_put_msg(app, chan, info.id)?;
    Ok(buf)
}
