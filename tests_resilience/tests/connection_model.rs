//! Connection Model Integration Tests
//!
//! These tests validate ports and connection establishment:
//! - Access control for secure and non-secure clients
//! - Waiting for ports that do not exist yet
//! - Concurrent acceptors never hand out a connection twice
//! - Port shutdown refuses everything still pending

use core_types::AppUuid;
use kernel_api::{ConnectFlags, KernelConfig, KernelError, PortFlags, ReadyFlags, Timeout};
use lifecycle::AppProps;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tests_resilience::{load_test_app, recv_bytes, send_bytes, test_kernel, test_kernel_with};

#[test]
fn test_connect_to_missing_port() {
    let kernel = test_kernel();
    let client = load_test_app(&kernel);
    assert_eq!(
        kernel.sys_connect(&client, "com.example.none", ConnectFlags::ASYNC),
        Err(KernelError::NotFound)
    );
    let long = "x".repeat(kernel.config().port_path_max);
    assert_eq!(
        kernel.sys_connect(&client, &long, ConnectFlags::ASYNC),
        Err(KernelError::InvalidArgs)
    );
    assert!(kernel.uctx(&client).unwrap().is_empty());
}

#[test]
fn test_port_access_flags() {
    let kernel = test_kernel();
    let server = load_test_app(&kernel);
    let ta = load_test_app(&kernel);
    let ns = kernel.load_app(AppProps::new(AppUuid::NS_CLIENT)).unwrap();

    kernel
        .sys_port_create(&server, "com.example.ta", 1, 16, PortFlags::ALLOW_TA_CONNECT)
        .unwrap();
    kernel
        .sys_port_create(&server, "com.example.ns", 1, 16, PortFlags::ALLOW_NS_CONNECT)
        .unwrap();

    assert!(kernel
        .sys_connect(&ta, "com.example.ta", ConnectFlags::ASYNC)
        .is_ok());
    assert_eq!(
        kernel.sys_connect(&ns, "com.example.ta", ConnectFlags::ASYNC),
        Err(KernelError::AccessDenied)
    );
    assert!(kernel
        .sys_connect(&ns, "com.example.ns", ConnectFlags::ASYNC)
        .is_ok());
    assert_eq!(
        kernel.sys_connect(&ta, "com.example.ns", ConnectFlags::ASYNC),
        Err(KernelError::AccessDenied)
    );
}

#[test]
fn test_duplicate_path_rejected() {
    let kernel = test_kernel();
    let a = load_test_app(&kernel);
    let b = load_test_app(&kernel);
    kernel
        .sys_port_create(&a, "com.example.dup", 1, 16, PortFlags::ALLOW_TA_CONNECT)
        .unwrap();
    assert_eq!(
        kernel.sys_port_create(&b, "com.example.dup", 1, 16, PortFlags::ALLOW_TA_CONNECT),
        Err(KernelError::AlreadyExists)
    );
    assert!(kernel.uctx(&b).unwrap().is_empty());
}

#[test]
fn test_blocking_connect_waits_for_port() {
    let kernel = Arc::new(test_kernel());
    let server = load_test_app(&kernel);
    let client = load_test_app(&kernel);

    let connector = {
        let kernel = kernel.clone();
        let client = client.clone();
        thread::spawn(move || {
            kernel.sys_connect(&client, "com.example.later", ConnectFlags::WAIT_FOR_PORT)
        })
    };
    thread::sleep(Duration::from_millis(30));
    assert_eq!(kernel.registry().waiting_count(), 1);

    let port = kernel
        .sys_port_create(&server, "com.example.later", 2, 32, PortFlags::ALLOW_TA_CONNECT)
        .unwrap();
    let event = kernel
        .sys_wait(&server, port, Timeout::from_millis(5_000))
        .unwrap();
    assert!(event.event.contains(ReadyFlags::READY));
    let (server_chan, peer) = kernel.sys_accept(&server, port).unwrap();
    assert_eq!(peer, client.uuid());

    let client_chan = connector.join().unwrap().unwrap();
    send_bytes(&kernel, &client, client_chan, b"ping").unwrap();
    assert_eq!(
        recv_bytes(&kernel, &server, server_chan).unwrap(),
        b"ping".to_vec()
    );
}

#[test]
fn test_blocking_connect_refused_on_port_close() {
    let kernel = Arc::new(test_kernel());
    let server = load_test_app(&kernel);
    let client = load_test_app(&kernel);
    let port = kernel
        .sys_port_create(&server, "com.example.refuse", 1, 16, PortFlags::ALLOW_TA_CONNECT)
        .unwrap();

    let connector = {
        let kernel = kernel.clone();
        let client = client.clone();
        thread::spawn(move || kernel.sys_connect(&client, "com.example.refuse", ConnectFlags::empty()))
    };
    kernel
        .sys_wait(&server, port, Timeout::from_millis(5_000))
        .unwrap();
    kernel.sys_close(&server, port).unwrap();

    assert_eq!(connector.join().unwrap(), Err(KernelError::PeerClosed));
    assert!(kernel.uctx(&client).unwrap().is_empty());
    assert!(kernel.registry().find("com.example.refuse").is_none());
}

#[test]
fn test_pending_connection_limit() {
    let mut config = KernelConfig::default();
    config.max_pending_connections = 2;
    let kernel = test_kernel_with(config);
    let server = load_test_app(&kernel);
    let client = load_test_app(&kernel);
    let port = kernel
        .sys_port_create(&server, "com.example.busy", 1, 16, PortFlags::ALLOW_TA_CONNECT)
        .unwrap();

    for _ in 0..2 {
        kernel
            .sys_connect(&client, "com.example.busy", ConnectFlags::ASYNC)
            .unwrap();
    }
    assert_eq!(
        kernel.sys_connect(&client, "com.example.busy", ConnectFlags::ASYNC),
        Err(KernelError::NoSpace)
    );

    kernel.sys_accept(&server, port).unwrap();
    assert!(kernel
        .sys_connect(&client, "com.example.busy", ConnectFlags::ASYNC)
        .is_ok());
}

#[test]
fn test_concurrent_acceptors_each_connection_once() {
    const CLIENTS: usize = 8;
    let kernel = Arc::new(test_kernel());
    let server = load_test_app(&kernel);
    let port = kernel
        .sys_port_create(&server, "com.example.pool", 1, 16, PortFlags::ALLOW_TA_CONNECT)
        .unwrap();

    let accepted = Arc::new(AtomicUsize::new(0));
    let peers = Arc::new(Mutex::new(Vec::new()));
    let acceptors: Vec<_> = (0..2)
        .map(|_| {
            let kernel = kernel.clone();
            let server = server.clone();
            let accepted = accepted.clone();
            let peers = peers.clone();
            thread::spawn(move || {
                while accepted.load(Ordering::SeqCst) < CLIENTS {
                    match kernel.sys_wait(&server, port, Timeout::from_millis(20)) {
                        Ok(_) | Err(KernelError::TimedOut) => {}
                        Err(err) => panic!("wait failed: {}", err),
                    }
                    match kernel.sys_accept(&server, port) {
                        Ok((_, peer)) => {
                            peers.lock().unwrap().push(peer);
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(KernelError::NoMessage) => {}
                        Err(err) => panic!("accept failed: {}", err),
                    }
                }
            })
        })
        .collect();

    let clients: Vec<_> = (0..CLIENTS).map(|_| load_test_app(&kernel)).collect();
    for client in &clients {
        kernel
            .sys_connect(client, "com.example.pool", ConnectFlags::ASYNC)
            .unwrap();
    }
    for acceptor in acceptors {
        acceptor.join().unwrap();
    }

    let peers = peers.lock().unwrap();
    assert_eq!(peers.len(), CLIENTS);
    let unique: HashSet<_> = peers.iter().copied().collect();
    let expected: HashSet<_> = clients.iter().map(|c| c.uuid()).collect();
    assert_eq!(unique, expected);
    assert_eq!(kernel.uctx(&server).unwrap().len(), CLIENTS + 1);
}
