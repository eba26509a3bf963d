//! Worker Bridge Integration Tests
//!
//! Tests for the blocking command bridge between caller threads and a
//! worker thread launched with `spawn_worker`.
//!
//! Run with: `cargo test -p common --test bridge_tests`

use common::{Reply, create_worker_bridge, spawn_worker};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug)]
enum Command {
    Add { a: u32, b: u32, response: Reply<u32> },
    WhoAmI { response: Reply<String> },
    Stop,
}

fn wait_started<T>(worker: &common::WorkerThread<T>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !worker.has_started() {
        assert!(Instant::now() < deadline, "worker did not start");
        thread::sleep(Duration::from_millis(1));
    }
}

// ============================================================================
// Call Flow Tests
// ============================================================================

#[test]
fn test_calls_run_on_worker_thread() {
    let (caller, link) = create_worker_bridge::<Command>(8);

    let worker = spawn_worker("bridge-worker", move || {
        let mut handled = 0;
        while let Ok(cmd) = link.recv_command() {
            match cmd {
                Command::Add { a, b, response } => {
                    let _ = response.send(a + b);
                }
                Command::WhoAmI { response } => {
                    let name = thread::current().name().unwrap_or_default().to_string();
                    let _ = response.send(name);
                }
                Command::Stop => break,
            }
            handled += 1;
        }
        handled
    })
    .unwrap();
    wait_started(&worker);

    assert_eq!(caller.call(|response| Command::Add { a: 2, b: 3, response }).unwrap(), 5);
    assert_eq!(
        caller.call(|response| Command::WhoAmI { response }).unwrap(),
        "bridge-worker"
    );

    caller.send_command(Command::Stop).unwrap();
    assert_eq!(worker.join().unwrap(), 2);
}

#[test]
fn test_concurrent_callers_are_serialized() {
    let (caller, link) = create_worker_bridge::<Command>(4);
    let worker = spawn_worker("bridge-serial", move || {
        let mut total = 0u32;
        while let Ok(cmd) = link.recv_command() {
            if let Command::Add { a, b, response } = cmd {
                total += a + b;
                let _ = response.send(total);
            }
        }
        total
    })
    .unwrap();

    let barrier = Arc::new(Barrier::new(16));
    let callers: Vec<_> = (0..16)
        .map(|_| {
            let caller = caller.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                caller.call(|response| Command::Add { a: 1, b: 0, response }).unwrap()
            })
        })
        .collect();

    let mut seen: Vec<u32> = callers.into_iter().map(|h| h.join().unwrap()).collect();
    seen.sort_unstable();
    assert_eq!(seen, (1..=16).collect::<Vec<_>>());

    // Dropping the last caller link ends the worker loop
    drop(caller);
    assert_eq!(worker.join().unwrap(), 16);
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[test]
fn test_call_fails_when_worker_is_gone() {
    let (caller, link) = create_worker_bridge::<Command>(1);
    drop(link);

    assert!(caller.is_closed());
    assert!(caller.call(|response| Command::WhoAmI { response }).is_err());
}

#[test]
fn test_dropped_reply_is_an_error() {
    let (caller, link) = create_worker_bridge::<Command>(1);
    let worker = spawn_worker("bridge-drop", move || {
        // Drop the reply slot without answering
        let _ = link.recv_command();
    })
    .unwrap();

    assert!(caller.call(|response| Command::WhoAmI { response }).is_err());
    worker.join().unwrap();
}

#[test]
fn test_worker_panic_is_reported() {
    let worker = spawn_worker("bridge-panic", || -> u32 { panic!("worker failed") }).unwrap();
    let err = worker.join().unwrap_err();
    assert!(err.to_string().contains("bridge-panic"));
}
