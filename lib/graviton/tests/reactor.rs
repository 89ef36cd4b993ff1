//! Reactor-level behavior over real workers: queue ordering, timers and the
//! single-worker boundary case.

mod common;

use common::*;
use graviton::endpoint::{Client, ClientOptions, Server, ServerOptions};
use graviton::stream::channel;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[test]
fn queue_preserves_per_producer_order() {
    let reactor = start(2);
    let (tx, rx) = mpsc::channel();

    for value in 0..100u32 {
        let tx = tx.clone();
        reactor
            .exec_on(1, move |_ctx| {
                drop(tx.send(value));
            })
            .unwrap();
    }

    let received: Vec<u32> = (0..100).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
    let expected: Vec<u32> = (0..100).collect();

    assert_eq!(received, expected);

    reactor.stop();
    reactor.join();
}

#[test]
fn periodic_timer_rearms_until_done() {
    let reactor = start(1);
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);

    let started = Instant::now();
    let mut fired = 0u32;

    reactor
        .exec_on(0, move |ctx| {
            ctx.start_timer(Duration::from_millis(20), move |_ctx| {
                fired += 1;
                drop(tx.lock().unwrap().send(fired));
                fired < 3
            });
        })
        .unwrap();

    for expected in 1..=3u32 {
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), expected);
    }

    // The timer let itself be deleted after the third firing.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(started.elapsed() >= Duration::from_millis(60));

    reactor.stop();
    reactor.join();
}

#[test]
fn one_shot_timer_fires_once() {
    let reactor = start(1);
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);

    reactor
        .exec_on(0, move |ctx| {
            ctx.start_timer(Duration::from_millis(10), move |_ctx| {
                drop(tx.lock().unwrap().send(()));
                false
            });
        })
        .unwrap();

    assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    reactor.stop();
    reactor.join();
}

#[test]
fn single_worker_runs_the_full_stack() {
    channel::register_proc(Arc::new(EchoProc { id: b'S' }));

    let reactor = start(1);
    let server = Server::start(&reactor, ServerOptions::new(vec!["127.0.0.1:47110"]), &quiet()).unwrap();
    assert!(server.wait_ready(Duration::from_secs(5)));

    let (event_tx, event_rx) = mpsc::channel();
    let (echo_tx, echo_rx) = mpsc::channel();
    let echo_tx = Mutex::new(echo_tx);

    let mut options = ClientOptions::new("127.0.0.1:47110", b"S");
    options.events = Arc::new(RecordingEvents { tx: Mutex::new(event_tx) });
    let notifier: graviton::endpoint::SharedNotifier = Arc::new(move |_, _, data: &[u8]| {
        drop(echo_tx.lock().unwrap().send(data.to_vec()));
    });
    options.notifiers.push((b'S', notifier));

    let client = Client::connect(&reactor, options, &quiet()).unwrap();
    wait_streaming(&event_rx, Duration::from_secs(5));

    client.send(b'S', 0x10, b"single worker".to_vec()).unwrap();

    let echoed = echo_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("No echo with a single worker");

    assert_eq!(echoed, b"single worker");

    client.close();
    reactor.stop();
    reactor.join();
}

#[test]
fn least_loaded_worker_is_preferred() {
    let reactor = start(3);

    // Listener descriptors count toward placement load.
    let server = Server::start(
        &reactor,
        ServerOptions::new(vec!["127.0.0.1:47111", "127.0.0.1:47112"]),
        &quiet(),
    )
    .unwrap();
    assert!(server.wait_ready(Duration::from_secs(5)));

    let loads: Vec<usize> = reactor.links().iter().map(|link| link.load()).collect();
    let total: usize = loads.iter().sum();

    // Both listeners placed, spread across distinct least-loaded workers.
    assert_eq!(total, 2);
    assert!(loads.iter().all(|&load| load <= 1));

    reactor.stop();
    reactor.join();
}
