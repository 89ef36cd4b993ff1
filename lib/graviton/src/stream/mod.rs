//! The stream layer: a framed, authenticated, encrypted byte channel bound
//! to one descriptor and one session, multiplexing up to 256 logical
//! channels.

pub mod channel;
pub mod handshake;
pub mod obfuscation;
pub mod pkt;
pub mod session;
pub mod tlv;
pub mod transport;

use crate::addr::NodeAddr;
use crate::config::CoreConfig;
use crate::reactor::context::Context;
use crate::reactor::descriptor::{Descriptor, EventHandler};
use crate::stream::channel::{Channel, ChannelIo, Notifier, MAX_CHANNELS};
use crate::stream::pkt::{pkt_type, CodecStats, RawPacket, Reassembly};
use crate::stream::session::Session;
use crate::support::{ErrorType, NetworkError, NetworkResult};
use plasma::crypto::SessionKey;
use plasma::logging::{self, Logger};
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Rolling window for the decryption failure threshold.
const CRYPTO_ERROR_WINDOW: Duration = Duration::from_secs(30);

/// A live stream: the peer's node identity, the bound session, the outgoing
/// sequence counter and the channel table.
pub struct Stream {
    pub local: NodeAddr,
    pub peer: NodeAddr,
    pub session: Arc<Session>,
    key: SessionKey,
    transport: u8,
    seq_id: u64,
    last_egress: Instant,
    channels: Vec<Option<Channel>>,
    wire_pending: Vec<u8>,
    backlog: Vec<u8>,
    reassembly: Reassembly,
    pub stats: CodecStats,
    crypto_errors: u32,
    crypto_window: Instant,
    pub inheritor: Option<Box<dyn Any + Send>>,
    log: Logger,
}

impl Stream {
    /// Binds a stream to a session, building a channel instance for every
    /// channel the session enumerates that has a registered handler.
    pub fn new(session: Arc<Session>, local: NodeAddr, peer: NodeAddr, transport: u8, log: &Logger) -> Stream {
        let log = log.new(logging::o!("session_id" => session.id));
        let mut channels: Vec<Option<Channel>> = (0..MAX_CHANNELS).map(|_| None).collect();

        for id in session.channels() {
            match channel::find_proc(id) {
                Some(proc) => {
                    let mut ch = Channel::new(id, proc);
                    ch.open();
                    channels[id as usize] = Some(ch);
                }
                None => {
                    logging::warn!(log, "no handler registered for session channel";
                                   "channel" => id as char);
                }
            }
        }

        let key = session.key();
        let now = Instant::now();

        Stream {
            local,
            peer,
            session,
            key,
            transport,
            seq_id: 0,
            last_egress: now,
            channels,
            wire_pending: Vec::new(),
            backlog: Vec::new(),
            reassembly: Reassembly::new(),
            stats: CodecStats::default(),
            crypto_errors: 0,
            crypto_window: now,
            inheritor: None,
            log,
        }
    }

    #[inline]
    pub fn channel_mut(&mut self, id: u8) -> Option<&mut Channel> {
        self.channels[id as usize].as_mut()
    }

    /// Installs an in-notifier on the given channel, if it exists.
    pub fn add_in_notifier(&mut self, id: u8, notifier: Notifier) -> bool {
        match self.channel_mut(id) {
            Some(ch) => {
                ch.add_in_notifier(notifier);
                true
            }
            None => false,
        }
    }

    /// Writes one channel packet out through the descriptor.
    pub fn write_channel(
        &mut self,
        d: &mut Descriptor,
        ch_id: u8,
        pkt_type: u8,
        data: &[u8],
        max_fragment_size: usize,
    ) -> NetworkResult<usize> {
        let mut ch = match self.channels[ch_id as usize].take() {
            Some(ch) => ch,
            None => return Err(NetworkError::Fatal(ErrorType::UnknownChannel)),
        };

        let result = {
            let mut io = ChannelIo {
                desc: d,
                seq_id: &mut self.seq_id,
                key: &self.key,
                src: self.local,
                dst: self.peer,
                transport: self.transport,
                max_fragment_size,
            };
            io.send(&mut ch, pkt_type, data)
        };

        self.channels[ch_id as usize] = Some(ch);

        if result.is_ok() {
            self.last_egress = Instant::now();
            self.session.touch();
        }

        result
    }

    /// The ingress pump: deobfuscate, base64-decode, extract packets and
    /// dispatch them. A fatal return tears the stream down.
    pub fn on_ingress(&mut self, d: &mut Descriptor, config: &CoreConfig) -> NetworkResult<()> {
        transport::read_deobfuscated(self.transport, d, &mut self.wire_pending)?;

        let consumed = plasma::encoding::decode_stream(&self.wire_pending, &mut self.backlog)
            .map_err(|_| NetworkError::Fatal(ErrorType::Protocol))?;
        self.wire_pending.drain(..consumed);

        loop {
            let extracted = pkt::extract_packet(
                &mut self.backlog,
                &self.key,
                config.max_fragment_size,
                &mut self.stats,
            );

            match extracted {
                Ok(Some(packet)) => self.dispatch_packet(d, packet, config)?,
                Ok(None) => break,
                Err(NetworkError::Fatal(ErrorType::Crypto)) => self.count_crypto_error(config)?,
                Err(e) => return Err(e),
            }
        }

        self.session.touch();
        Ok(())
    }

    /// Retries queued outbound packets after the descriptor flushed.
    pub fn flush_queues(&mut self, d: &mut Descriptor, max_fragment_size: usize) -> NetworkResult<()> {
        for index in 0..MAX_CHANNELS {
            let mut ch = match self.channels[index].take() {
                Some(ch) => ch,
                None => continue,
            };

            let result = match ch.queued() > 0 {
                true => {
                    let mut io = ChannelIo {
                        desc: d,
                        seq_id: &mut self.seq_id,
                        key: &self.key,
                        src: self.local,
                        dst: self.peer,
                        transport: self.transport,
                        max_fragment_size,
                    };
                    ch.flush_queue(&mut io)
                }
                false => Ok(()),
            };

            self.channels[index] = Some(ch);
            result?;
        }

        Ok(())
    }

    /// Emits a keepalive packet when the stream has been idle on the egress
    /// side for the configured interval.
    pub fn keepalive_tick(&mut self, d: &mut Descriptor, config: &CoreConfig) -> NetworkResult<()> {
        if self.last_egress.elapsed() < Duration::from_secs(config.keepalive_interval_sec) {
            return Ok(());
        }

        let wire = pkt::encode_stream_pkt(pkt_type::KEEPALIVE, &[], &self.key, self.local, self.peer)?;

        match transport::write_obfuscated(self.transport, d, &wire) {
            Ok(_) => {
                self.last_egress = Instant::now();
                Ok(())
            }
            // A clogged egress is not worth a keepalive.
            Err(NetworkError::Wait) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Fires the close callback on every live channel.
    pub fn close_channels(&mut self) {
        for index in 0..MAX_CHANNELS {
            if let Some(ch) = self.channels[index].as_mut() {
                ch.closed();
            }
        }
    }

    fn dispatch_packet(&mut self, d: &mut Descriptor, packet: RawPacket, config: &CoreConfig) -> NetworkResult<()> {
        // Packets addressed to a specific node that is not us are dropped.
        if !packet.dst.is_broadcast() && packet.dst != self.local {
            self.stats.junk_bytes += packet.body.len() as u64;
            logging::warn!(self.log, "packet for foreign node dropped"; "dst" => %packet.dst);
            return Ok(());
        }

        // The first authenticated packet teaches us the peer's node identity.
        if self.peer.is_broadcast() && !packet.src.is_broadcast() {
            self.peer = packet.src;
        }

        match packet.pkt_type {
            pkt_type::DATA => self.dispatch_channel_pkt(d, &packet.body, config),
            pkt_type::FRAGMENT => {
                match self.reassembly.push(&packet.body, config.reassembly_max_bytes) {
                    Ok(Some(complete)) => self.dispatch_channel_pkt(d, &complete, config),
                    Ok(None) => Ok(()),
                    Err(NetworkError::Fatal(ErrorType::FragmentMismatch))
                    | Err(NetworkError::Fatal(ErrorType::PayloadTooLarge)) => {
                        logging::warn!(self.log, "inconsistent fragment dropped, reassembly reset");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            pkt_type::KEEPALIVE => {
                self.session.touch();
                Ok(())
            }
            pkt_type::SERVICE => {
                // Reserved for handshake continuations; nothing defined once
                // the stream is up.
                logging::debug!(self.log, "service packet ignored in streaming state");
                Ok(())
            }
            other => {
                self.stats.unknown_type += 1;
                logging::warn!(self.log, "unknown stream packet type dropped"; "type" => other);
                Ok(())
            }
        }
    }

    fn dispatch_channel_pkt(&mut self, d: &mut Descriptor, body: &[u8], config: &CoreConfig) -> NetworkResult<()> {
        let (hdr, payload) = pkt::parse_channel_pkt(body)?;

        let mut ch = match self.channels[hdr.id as usize].take() {
            Some(ch) => ch,
            None => {
                self.stats.unknown_channel += 1;
                logging::warn!(self.log, "packet for unknown channel dropped";
                               "channel" => hdr.id as char);
                return Ok(());
            }
        };

        {
            let mut io = ChannelIo {
                desc: d,
                seq_id: &mut self.seq_id,
                key: &self.key,
                src: self.local,
                dst: self.peer,
                transport: self.transport,
                max_fragment_size: config.max_fragment_size,
            };
            ch.dispatch(&mut io, hdr.pkt_type, payload);
        }

        self.channels[hdr.id as usize] = Some(ch);
        Ok(())
    }

    /// Decryption failures within the rolling window accumulate; past the
    /// threshold the stream is torn down as a possible man in the middle.
    fn count_crypto_error(&mut self, config: &CoreConfig) -> NetworkResult<()> {
        let now = Instant::now();

        if now.duration_since(self.crypto_window) > CRYPTO_ERROR_WINDOW {
            self.crypto_window = now;
            self.crypto_errors = 0;
        }

        self.crypto_errors += 1;

        match self.crypto_errors > config.crypto_error_threshold {
            true => {
                logging::warn!(self.log, "decryption failure threshold exceeded, tearing stream down";
                               "failures" => self.crypto_errors);
                Err(NetworkError::Fatal(ErrorType::Crypto))
            }
            false => Ok(()),
        }
    }
}

/// The callback table of a descriptor in streaming mode. Installed once the
/// handshake establishes a session; identical on both ends of the stream.
pub struct StreamHandler {
    pub stream: Stream,
    config: Arc<CoreConfig>,
}

impl StreamHandler {
    pub fn new(stream: Stream, config: Arc<CoreConfig>) -> StreamHandler {
        StreamHandler { stream, config }
    }
}

impl EventHandler for StreamHandler {
    fn on_read(&mut self, d: &mut Descriptor, _ctx: &mut Context) {
        match self.stream.on_ingress(d, &self.config) {
            Ok(()) | Err(NetworkError::Wait) => (),
            Err(NetworkError::Fatal(err)) => {
                logging::warn!(d.log, "stream ingress failure"; "error" => %err);
                d.close();
            }
        }
    }

    fn on_write(&mut self, d: &mut Descriptor, _ctx: &mut Context) {
        if self.stream.flush_queues(d, self.config.max_fragment_size).is_err() {
            d.close();
        }
    }

    fn on_channel_send(&mut self, d: &mut Descriptor, _ctx: &mut Context, ch: u8, pkt_type: u8, data: Vec<u8>) {
        let result = self
            .stream
            .write_channel(d, ch, pkt_type, &data, self.config.max_fragment_size);

        if let Err(NetworkError::Fatal(err)) = result {
            logging::warn!(d.log, "cross-thread channel write failed"; "error" => %err);

            if err != ErrorType::UnknownChannel {
                d.close();
            }
        }
    }

    fn on_tick(&mut self, d: &mut Descriptor, _ctx: &mut Context) {
        if self.stream.keepalive_tick(d, &self.config).is_err() {
            d.close();
        }
    }

    fn on_error(&mut self, d: &mut Descriptor, _ctx: &mut Context, err: ErrorType) {
        logging::debug!(d.log, "stream descriptor error"; "error" => %err);
        self.stream.session.unbind();
    }

    fn on_delete(&mut self, d: &mut Descriptor, _ctx: &mut Context) {
        logging::trace!(d.log, "stream descriptor deleted");
        self.stream.close_channels();
        self.stream.session.unbind();
    }
}
