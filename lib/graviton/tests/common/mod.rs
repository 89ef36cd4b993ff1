#![allow(dead_code)]

use graviton::config::CoreConfig;
use graviton::endpoint::ClientEvents;
use graviton::reactor::Reactor;
use graviton::stream::channel::{Channel, ChannelIo, ChannelProc};
use plasma::logging::{self, Logger};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Marks echo replies so an in-process loopback (where both ends share the
/// process-wide proc registry) does not ping-pong forever.
pub const ECHO_REPLY_BIT: u8 = 0x80;

/// Echoes every payload back on the same channel.
pub struct EchoProc {
    pub id: u8,
}

impl ChannelProc for EchoProc {
    fn id(&self) -> u8 {
        self.id
    }

    fn on_packet(&self, ch: &mut Channel, io: &mut ChannelIo, pkt_type: u8, data: &[u8]) {
        if pkt_type & ECHO_REPLY_BIT == 0 {
            drop(io.send(ch, pkt_type | ECHO_REPLY_BIT, data));
        }
    }
}

/// Forwards every payload, tagged with the dispatching thread's name.
pub struct CaptureProc {
    pub id: u8,
    pub tx: Mutex<Sender<(String, Vec<u8>)>>,
}

impl ChannelProc for CaptureProc {
    fn id(&self) -> u8 {
        self.id
    }

    fn on_packet(&self, _ch: &mut Channel, _io: &mut ChannelIo, _pkt_type: u8, data: &[u8]) {
        let name = thread::current().name().unwrap_or("").to_string();
        drop(self.tx.lock().unwrap().send((name, data.to_vec())));
    }
}

/// Abruptly closes the stream descriptor on the first packet.
pub struct CloseProc {
    pub id: u8,
}

impl ChannelProc for CloseProc {
    fn id(&self) -> u8 {
        self.id
    }

    fn on_packet(&self, _ch: &mut Channel, io: &mut ChannelIo, _pkt_type: u8, _data: &[u8]) {
        io.desc.close();
    }
}

#[derive(Debug)]
pub enum ClientEventRecord {
    Streaming(u32),
    Error(u32, String),
    Disconnected,
}

pub struct RecordingEvents {
    pub tx: Mutex<Sender<ClientEventRecord>>,
}

impl ClientEvents for RecordingEvents {
    fn on_streaming(&self, session_id: u32) {
        drop(self.tx.lock().unwrap().send(ClientEventRecord::Streaming(session_id)));
    }

    fn on_error(&self, code: u32, message: &str) {
        drop(
            self.tx
                .lock()
                .unwrap()
                .send(ClientEventRecord::Error(code, message.to_string())),
        );
    }

    fn on_disconnected(&self) {
        drop(self.tx.lock().unwrap().send(ClientEventRecord::Disconnected));
    }
}

pub fn test_config(threads: usize) -> CoreConfig {
    let mut config = CoreConfig::default();
    config.thread_count = threads;
    config.conn_timeout_sec = 30;
    config.backoff_initial_ms = 100;
    config.backoff_max_ms = 1000;
    config
}

pub fn quiet() -> Logger {
    logging::discard()
}

pub fn start(threads: usize) -> Reactor {
    graviton::init(test_config(threads), quiet()).expect("Core init failed")
}

/// Blocks until the recorder reports `Streaming`, returning the session id.
pub fn wait_streaming(rx: &Receiver<ClientEventRecord>, timeout: Duration) -> u32 {
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("Timed out waiting for streaming");

        match rx.recv_timeout(remaining).expect("Timed out waiting for streaming") {
            ClientEventRecord::Streaming(session_id) => return session_id,
            _ => continue,
        }
    }
}
