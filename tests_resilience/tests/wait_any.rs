//! Wait-Any Integration Tests
//!
//! These tests validate multiplexed waiting over a whole handle table:
//! - The ready handle is reported by id with its cookie
//! - Sleepers wake on activity from another application
//! - Closing a member while waiting does not confuse the waiter
//! - Only the members that saw activity are reported

use core_types::HandleId;
use kernel_api::{ConnectFlags, KernelError, PortFlags, ReadyFlags, Timeout};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tests_resilience::{connect_pair, load_test_app, recv_bytes, send_bytes, test_kernel};

#[test]
fn test_wait_any_empty_table() {
    let kernel = test_kernel();
    let app = load_test_app(&kernel);
    assert_eq!(
        kernel.sys_wait_any(&app, Timeout::ZERO),
        Err(KernelError::NotFound)
    );
}

#[test]
fn test_wait_any_reports_ready_handle() {
    let kernel = test_kernel();
    let conn = connect_pair(&kernel, "com.example.any", 2, 32).unwrap();
    kernel
        .sys_set_cookie(&conn.server, conn.server_chan, 0xfeed)
        .unwrap();

    assert_eq!(
        kernel.sys_wait_any(&conn.server, Timeout::ZERO),
        Err(KernelError::TimedOut)
    );

    send_bytes(&kernel, &conn.client, conn.client_chan, b"wake").unwrap();
    let event = kernel.sys_wait_any(&conn.server, Timeout::ZERO).unwrap();
    assert_eq!(event.handle, conn.server_chan);
    assert_eq!(event.cookie, 0xfeed);
    assert!(event.event.contains(ReadyFlags::MSG));
}

#[test]
fn test_wait_any_sleeps_until_activity() {
    let kernel = Arc::new(test_kernel());
    let conn = connect_pair(&kernel, "com.example.sleep", 2, 32).unwrap();

    let waiter = {
        let kernel = kernel.clone();
        let server = conn.server.clone();
        thread::spawn(move || kernel.sys_wait_any(&server, Timeout::from_millis(5_000)))
    };
    thread::sleep(Duration::from_millis(30));
    assert!(!waiter.is_finished());

    let other = load_test_app(&kernel);
    kernel
        .sys_connect(&other, "com.example.sleep", ConnectFlags::ASYNC)
        .unwrap();

    let event = waiter.join().unwrap().unwrap();
    assert_eq!(event.handle, conn.port);
    assert!(event.event.contains(ReadyFlags::READY));
}

#[test]
fn test_wait_any_survives_member_close() {
    let kernel = Arc::new(test_kernel());
    let conn = connect_pair(&kernel, "com.example.churn", 2, 32).unwrap();

    let waiter = {
        let kernel = kernel.clone();
        let server = conn.server.clone();
        thread::spawn(move || kernel.sys_wait_any(&server, Timeout::from_millis(5_000)))
    };
    thread::sleep(Duration::from_millis(20));
    kernel.sys_close(&conn.server, conn.port).unwrap();
    thread::sleep(Duration::from_millis(20));
    send_bytes(&kernel, &conn.client, conn.client_chan, b"after").unwrap();

    let event = waiter.join().unwrap().unwrap();
    assert_eq!(event.handle, conn.server_chan);
    assert!(event.event.contains(ReadyFlags::MSG));
}

#[test]
fn test_wait_any_over_many_channels() {
    const CLIENTS: usize = 6;
    const ACTIVE: [usize; 3] = [1, 3, 4];
    let kernel = Arc::new(test_kernel());
    let server = load_test_app(&kernel);
    let port = kernel
        .sys_port_create(&server, "com.example.many", 2, 32, PortFlags::ALLOW_TA_CONNECT)
        .unwrap();

    let mut clients = Vec::new();
    let mut server_chans = Vec::new();
    for _ in 0..CLIENTS {
        let client = load_test_app(&kernel);
        let chan = kernel
            .sys_connect(&client, "com.example.many", ConnectFlags::ASYNC)
            .unwrap();
        let (accepted, _) = kernel.sys_accept(&server, port).unwrap();
        clients.push((client, chan));
        server_chans.push(accepted);
    }
    kernel.sys_close(&server, port).unwrap();

    let sent = Arc::new(AtomicBool::new(false));
    let sender = {
        let kernel = kernel.clone();
        let sent = sent.clone();
        let active: Vec<_> = ACTIVE.iter().map(|&i| clients[i].clone()).collect();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            sent.store(true, Ordering::SeqCst);
            for (client, chan) in &active {
                send_bytes(&kernel, client, *chan, b"tick").unwrap();
            }
        })
    };

    let first = kernel
        .sys_wait_any(&server, Timeout::from_millis(5_000))
        .unwrap();
    assert!(sent.load(Ordering::SeqCst));
    sender.join().unwrap();

    let expected: HashSet<HandleId> = ACTIVE.iter().map(|&i| server_chans[i]).collect();
    assert!(expected.contains(&first.handle));
    assert!(first.event.contains(ReadyFlags::MSG));

    let mut seen = HashSet::new();
    let mut event = first;
    loop {
        assert!(expected.contains(&event.handle));
        assert_eq!(
            recv_bytes(&kernel, &server, event.handle).unwrap(),
            b"tick".to_vec()
        );
        seen.insert(event.handle);
        if seen.len() == ACTIVE.len() {
            break;
        }
        event = kernel
            .sys_wait_any(&server, Timeout::from_millis(5_000))
            .unwrap();
    }
    assert_eq!(seen, expected);
    assert_eq!(
        kernel.sys_wait_any(&server, Timeout::ZERO),
        Err(KernelError::TimedOut)
    );
}
