//! The channel layer: up to 256 logical channels multiplexed on one stream,
//! each dispatching its packets to a process-wide registered handler.

use crate::addr::NodeAddr;
use crate::reactor::descriptor::{Descriptor, DescriptorId};
use crate::reactor::queue::QueueMessage;
use crate::reactor::worker::WorkerLink;
use crate::stream::{pkt, transport};
use crate::support::{ErrorType, NetworkError, NetworkResult};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use plasma::crypto::SessionKey;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

pub const MAX_CHANNELS: usize = 256;

/// Per-type channel handler, registered once per channel id and shared by
/// every stream that enumerates the channel.
pub trait ChannelProc: Send + Sync {
    fn id(&self) -> u8;

    /// A channel instance came up on a stream.
    fn on_open(&self, _ch: &mut Channel) {}

    /// One inbound channel packet.
    fn on_packet(&self, ch: &mut Channel, io: &mut ChannelIo, pkt_type: u8, data: &[u8]);

    /// The stream is going away.
    fn on_close(&self, _ch: &mut Channel) {}
}

/// Observer invoked with `(channel id, packet type, payload)` on every
/// inbound (in) or accepted outbound (out) packet.
pub type Notifier = Box<dyn Fn(u8, u8, &[u8]) + Send>;

/// Raw payload byte counters; framing, encryption padding and base64
/// overhead are not included.
#[derive(Debug, Default, Copy, Clone)]
pub struct ChannelStat {
    pub bytes_read: u64,
    pub bytes_write: u64,
}

struct OutboundPacket {
    pkt_type: u8,
    data: Vec<u8>,
}

/// One logical channel on a stream, created when an active session
/// enumerates it and destroyed with the stream.
pub struct Channel {
    id: u8,
    proc: Arc<dyn ChannelProc>,
    pub stat: ChannelStat,
    queue: VecDeque<OutboundPacket>,
    in_notifiers: Vec<Notifier>,
    out_notifiers: Vec<Notifier>,
    pub inheritor: Option<Box<dyn Any + Send>>,
}

impl Channel {
    pub(crate) fn new(id: u8, proc: Arc<dyn ChannelProc>) -> Channel {
        Channel {
            id,
            proc,
            stat: ChannelStat::default(),
            queue: VecDeque::new(),
            in_notifiers: Vec::new(),
            out_notifiers: Vec::new(),
            inheritor: None,
        }
    }

    #[inline]
    pub fn id(&self) -> u8 {
        self.id
    }

    #[inline]
    pub fn add_in_notifier(&mut self, notifier: Notifier) {
        self.in_notifiers.push(notifier);
    }

    #[inline]
    pub fn add_out_notifier(&mut self, notifier: Notifier) {
        self.out_notifiers.push(notifier);
    }

    #[inline]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn open(&mut self) {
        let proc = self.proc.clone();
        proc.on_open(self);
    }

    pub(crate) fn closed(&mut self) {
        let proc = self.proc.clone();
        proc.on_close(self);
    }

    /// Hands one inbound packet to the handler, then updates statistics and
    /// fires every in-notifier.
    pub(crate) fn dispatch(&mut self, io: &mut ChannelIo, pkt_type: u8, data: &[u8]) {
        let proc = self.proc.clone();
        proc.on_packet(self, io, pkt_type, data);

        self.stat.bytes_read += data.len() as u64;

        for notifier in &self.in_notifiers {
            notifier(self.id, pkt_type, data);
        }
    }

    /// Retries queued outbound packets after egress space opened up.
    pub(crate) fn flush_queue(&mut self, io: &mut ChannelIo) -> NetworkResult<()> {
        while let Some(packet) = self.queue.front() {
            match write_channel_pkt(io, self.id, packet.pkt_type, &packet.data) {
                Ok(()) => {
                    self.queue.pop_front();
                }
                Err(NetworkError::Wait) => return Ok(()),
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

/// The write-side context a channel handler uses to emit packets: the
/// stream's descriptor, sequence counter, key and addressing.
pub struct ChannelIo<'a> {
    pub desc: &'a mut Descriptor,
    pub(crate) seq_id: &'a mut u64,
    pub(crate) key: &'a SessionKey,
    pub src: NodeAddr,
    pub dst: NodeAddr,
    pub(crate) transport: u8,
    pub(crate) max_fragment_size: usize,
}

impl<'a> ChannelIo<'a> {
    /// Writes one channel packet, fragmenting when the payload exceeds the
    /// single-packet budget. A full egress buffer queues the packet on the
    /// channel instead; either way the payload is accepted, statistics are
    /// updated and the out-notifiers fire. An empty payload is rejected and
    /// returns 0 without emitting anything.
    pub fn send(&mut self, ch: &mut Channel, pkt_type: u8, data: &[u8]) -> NetworkResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        match write_channel_pkt(self, ch.id, pkt_type, data) {
            Ok(()) => (),
            Err(NetworkError::Wait) => ch.queue.push_back(OutboundPacket {
                pkt_type,
                data: data.to_vec(),
            }),
            Err(e) => return Err(e),
        }

        ch.stat.bytes_write += data.len() as u64;

        for notifier in &ch.out_notifiers {
            notifier(ch.id, pkt_type, data);
        }

        Ok(data.len())
    }

    /// String payload convenience wrapper.
    #[inline]
    pub fn send_str(&mut self, ch: &mut Channel, pkt_type: u8, text: &str) -> NetworkResult<usize> {
        self.send(ch, pkt_type, text.as_bytes())
    }
}

/// Frames, seals and writes every stream packet of one channel packet. The
/// egress capacity is checked up front so a fragmented write never lands
/// partially: either all fragments are queued on the descriptor or none are.
fn write_channel_pkt(io: &mut ChannelIo, ch_id: u8, pkt_type: u8, data: &[u8]) -> NetworkResult<()> {
    let channel_pkt = pkt::encode_channel_pkt(ch_id, pkt_type, 0, *io.seq_id, data);
    let bodies = pkt::fragment_bodies(&channel_pkt, io.max_fragment_size);

    let needed: usize = bodies.iter().map(|(_, body)| pkt::wire_size(body.len())).sum();

    if needed > io.desc.egress.free_capacity() {
        drop(io.desc.flush());

        if needed > io.desc.egress.free_capacity() {
            return match io.desc.egress.is_empty() {
                // Cannot ever fit, even with the buffer drained.
                true => Err(NetworkError::Fatal(ErrorType::PayloadTooLarge)),
                false => Err(NetworkError::Wait),
            };
        }
    }

    for (ty, body) in &bodies {
        let wire = pkt::encode_stream_pkt(*ty, body, io.key, io.src, io.dst)?;
        transport::write_obfuscated(io.transport, io.desc, &wire)?;
    }

    *io.seq_id += 1;
    Ok(())
}

lazy_static! {
    static ref PROCS: RwLock<HashMap<u8, Arc<dyn ChannelProc>>> = RwLock::new(HashMap::new());
}

/// Registers a channel handler for its id. The first registration wins.
pub fn register_proc(proc: Arc<dyn ChannelProc>) -> bool {
    let mut procs = PROCS.write().expect("Channel proc registry poisoned");
    let id = proc.id();

    match procs.contains_key(&id) {
        true => false,
        false => {
            procs.insert(id, proc);
            true
        }
    }
}

pub fn find_proc(id: u8) -> Option<Arc<dyn ChannelProc>> {
    PROCS
        .read()
        .expect("Channel proc registry poisoned")
        .get(&id)
        .cloned()
}

/// Posts a channel packet to a stream descriptor owned by another worker.
/// The write happens on the owning worker's thread, after every message
/// posted to that worker before this one.
pub fn send_mt(
    link: &WorkerLink,
    id: DescriptorId,
    ch: u8,
    pkt_type: u8,
    data: Vec<u8>,
) -> NetworkResult<()> {
    link.post(QueueMessage::ChannelSend { id, ch, pkt_type, data })
}

/// String payload convenience wrapper over `send_mt`.
pub fn send_str_mt(
    link: &WorkerLink,
    id: DescriptorId,
    ch: u8,
    pkt_type: u8,
    text: &str,
) -> NetworkResult<()> {
    send_mt(link, id, ch, pkt_type, text.as_bytes().to_vec())
}
