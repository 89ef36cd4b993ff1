//! End-to-end scenarios over real loopback sockets: echo, fragmentation,
//! reconnect, cross-worker sends and obfuscated equivalence.

mod common;

use common::*;
use graviton::endpoint::{Client, ClientOptions, Server, ServerOptions};
use graviton::stream::channel;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn echo_once(reactor: &graviton::reactor::Reactor, addr: &str, payload: &[u8]) -> Vec<u8> {
    let server = Server::start(reactor, ServerOptions::new(vec![addr]), &quiet()).unwrap();
    assert!(server.wait_ready(Duration::from_secs(5)));

    let (event_tx, event_rx) = mpsc::channel();
    let (echo_tx, echo_rx) = mpsc::channel();
    let echo_tx = Mutex::new(echo_tx);

    let mut options = ClientOptions::new(addr, b"E");
    options.events = Arc::new(RecordingEvents { tx: Mutex::new(event_tx) });
    let notifier: graviton::endpoint::SharedNotifier = Arc::new(move |_, _, data: &[u8]| {
        drop(echo_tx.lock().unwrap().send(data.to_vec()));
    });
    options.notifiers.push((b'E', notifier));

    let client = Client::connect(reactor, options, &quiet()).unwrap();
    wait_streaming(&event_rx, Duration::from_secs(5));

    client.send(b'E', 0x10, payload.to_vec()).unwrap();

    let echoed = echo_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("No echo within the deadline");

    client.close();
    echoed
}

#[test]
fn loopback_echo() {
    channel::register_proc(Arc::new(EchoProc { id: b'E' }));

    let reactor = start(2);
    let echoed = echo_once(&reactor, "127.0.0.1:47101", b"hello, world!");

    assert_eq!(echoed, b"hello, world!");

    reactor.stop();
    reactor.join();
}

#[test]
fn fragmentation_one_megabyte() {
    let (capture_tx, capture_rx) = mpsc::channel();
    channel::register_proc(Arc::new(CaptureProc {
        id: b'F',
        tx: Mutex::new(capture_tx),
    }));

    let reactor = start(2);
    let server = Server::start(&reactor, ServerOptions::new(vec!["127.0.0.1:47102"]), &quiet()).unwrap();
    assert!(server.wait_ready(Duration::from_secs(5)));

    let (event_tx, event_rx) = mpsc::channel();
    let mut options = ClientOptions::new("127.0.0.1:47102", b"F");
    options.events = Arc::new(RecordingEvents { tx: Mutex::new(event_tx) });

    let client = Client::connect(&reactor, options, &quiet()).unwrap();
    wait_streaming(&event_rx, Duration::from_secs(5));

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 256) as u8).collect();
    client.send(b'F', 0x01, payload.clone()).unwrap();

    let (_, received) = capture_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("No reassembled payload within the deadline");

    assert_eq!(received.len(), 1_000_000);
    assert!(received.iter().enumerate().all(|(i, &b)| b == (i % 256) as u8));

    // Exactly one handler invocation for the whole payload.
    assert!(capture_rx.recv_timeout(Duration::from_millis(300)).is_err());

    client.close();
    reactor.stop();
    reactor.join();
}

#[test]
fn reconnect_gets_fresh_session() {
    channel::register_proc(Arc::new(CloseProc { id: b'R' }));

    let reactor = start(2);
    let server = Server::start(&reactor, ServerOptions::new(vec!["127.0.0.1:47103"]), &quiet()).unwrap();
    assert!(server.wait_ready(Duration::from_secs(5)));

    let (event_tx, event_rx) = mpsc::channel();
    let mut options = ClientOptions::new("127.0.0.1:47103", b"R");
    options.events = Arc::new(RecordingEvents { tx: Mutex::new(event_tx) });

    let client = Client::connect(&reactor, options, &quiet()).unwrap();
    let first_session = wait_streaming(&event_rx, Duration::from_secs(5));

    // The server side tears the descriptor down on this packet.
    client.send(b'R', 0x01, b"die".to_vec()).unwrap();

    // Disconnect, then a fresh streaming cycle with a new session.
    let disconnect_seen = Instant::now();
    let mut disconnected = false;
    let mut second_session = None;

    while second_session.is_none() {
        match event_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("No reconnect within the deadline")
        {
            ClientEventRecord::Disconnected => disconnected = true,
            ClientEventRecord::Streaming(session_id) => second_session = Some(session_id),
            ClientEventRecord::Error(..) => (),
        }
    }

    assert!(disconnected);
    assert_ne!(second_session.unwrap(), first_session);
    // Reconnect happened on the first backoff step, not after minutes.
    assert!(disconnect_seen.elapsed() < Duration::from_secs(4));

    // Exactly one streaming callback per cycle: nothing further pending.
    assert!(event_rx.recv_timeout(Duration::from_millis(300)).is_err());

    client.close();
    reactor.stop();
    reactor.join();
}

#[test]
fn cross_worker_send_delivers_once() {
    let (capture_tx, capture_rx) = mpsc::channel();
    channel::register_proc(Arc::new(CaptureProc {
        id: b'X',
        tx: Mutex::new(capture_tx),
    }));

    let reactor = start(4);
    let server = Server::start(&reactor, ServerOptions::new(vec!["127.0.0.1:47104"]), &quiet()).unwrap();
    assert!(server.wait_ready(Duration::from_secs(5)));

    let (event_tx, event_rx) = mpsc::channel();
    let mut options = ClientOptions::new("127.0.0.1:47104", b"X");
    options.events = Arc::new(RecordingEvents { tx: Mutex::new(event_tx) });

    let client = Client::connect(&reactor, options, &quiet()).unwrap();
    wait_streaming(&event_rx, Duration::from_secs(5));

    // Post the send from worker 0's thread; the write must happen on the
    // stream's owning worker regardless.
    let sender = client.clone();
    reactor
        .exec_on(0, move |_ctx| {
            sender.send(b'X', 0x05, b"routed".to_vec()).unwrap();
        })
        .unwrap();

    let (thread_name, data) = capture_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("No cross-worker delivery");

    assert_eq!(data, b"routed");
    assert!(thread_name.starts_with("graviton-worker-"));

    // Delivered exactly once.
    assert!(capture_rx.recv_timeout(Duration::from_millis(300)).is_err());

    // Repeated sends from the posting worker dispatch on one stable thread.
    let sender = client.clone();
    reactor
        .exec_on(0, move |_ctx| {
            for _ in 0..3 {
                sender.send(b'X', 0x05, b"again".to_vec()).unwrap();
            }
        })
        .unwrap();

    let mut names = Vec::new();
    for _ in 0..3 {
        let (name, _) = capture_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("Missing repeat delivery");
        names.push(name);
    }

    names.push(thread_name);
    names.dedup();
    assert_eq!(names.len(), 1);

    client.close();
    reactor.stop();
    reactor.join();
}

#[test]
fn identity_obfuscation_is_transparent() {
    channel::register_proc(Arc::new(EchoProc { id: b'E' }));

    let mut config = test_config(2);
    config.obfuscation = Some("identity".to_string());

    let reactor = graviton::init(config, quiet()).expect("Core init failed");
    let echoed = echo_once(&reactor, "127.0.0.1:47105", b"hello, world!");

    assert_eq!(echoed, b"hello, world!");

    // A fragmented payload survives the obfuscated path byte for byte.
    let server = Server::start(&reactor, ServerOptions::new(vec!["127.0.0.1:47106"]), &quiet()).unwrap();
    assert!(server.wait_ready(Duration::from_secs(5)));

    let (event_tx, event_rx) = mpsc::channel();
    let (echo_tx, echo_rx) = mpsc::channel();
    let echo_tx = Mutex::new(echo_tx);

    let mut options = ClientOptions::new("127.0.0.1:47106", b"E");
    options.events = Arc::new(RecordingEvents { tx: Mutex::new(event_tx) });
    let notifier: graviton::endpoint::SharedNotifier = Arc::new(move |_, _, data: &[u8]| {
        drop(echo_tx.lock().unwrap().send(data.to_vec()));
    });
    options.notifiers.push((b'E', notifier));

    let client = Client::connect(&reactor, options, &quiet()).unwrap();
    wait_streaming(&event_rx, Duration::from_secs(5));

    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    client.send(b'E', 0x10, payload.clone()).unwrap();

    let echoed = echo_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("No fragmented echo within the deadline");

    assert_eq!(echoed, payload);

    client.close();
    reactor.stop();
    reactor.join();
}
