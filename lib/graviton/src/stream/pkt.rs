//! Stream packet codec: framing, encryption, fragmentation and reassembly.
//! Every packet travels as `header || sealed body`, base64-encoded on the
//! wire; the fixed signature lets the reader resynchronize past junk.

use crate::addr::NodeAddr;
use crate::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{ByteOrder, LittleEndian};
use plasma::crypto::{self, SessionKey, SEAL_OVERHEAD};
use plasma::time::timestamp_nanos;

pub const STREAM_SIG: [u8; 8] = [0xcb, 0xa6, 0x38, 0x12, 0xef, 0x1a, 0x02, 0xd7];

pub const STREAM_HDR_SIZE: usize = 40;
pub const CH_HDR_SIZE: usize = 16;
pub const FRAG_HDR_SIZE: usize = 16;

pub mod pkt_type {
    pub const DATA: u8 = 0;
    pub const FRAGMENT: u8 = 1;
    pub const KEEPALIVE: u8 = 2;
    pub const SERVICE: u8 = 3;
}

/// Decrypted-body budget of one stream packet.
#[inline]
pub fn max_body(max_fragment_size: usize) -> usize {
    max_fragment_size - SEAL_OVERHEAD
}

/// Largest channel payload that still fits a single `data` packet. Also the
/// slice size used when fragmenting, since the fragment header matches the
/// channel header in size.
#[inline]
pub fn max_payload(max_fragment_size: usize) -> usize {
    max_body(max_fragment_size) - CH_HDR_SIZE
}

#[inline]
fn b64_len(raw: usize) -> usize {
    (raw + 2) / 3 * 4
}

/// Base64 wire footprint of one stream packet with this decrypted body size.
/// Used for egress capacity prechecks so multi-packet writes stay atomic.
#[inline]
pub fn wire_size(body_len: usize) -> usize {
    b64_len(STREAM_HDR_SIZE + body_len + SEAL_OVERHEAD)
}

/// Fixed-layout stream packet header, little-endian.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StreamPktHeader {
    pub total_size: u32,
    pub timestamp_nsec: u64,
    pub pkt_type: u8,
    pub src: NodeAddr,
    pub dst: NodeAddr,
}

impl StreamPktHeader {
    pub fn write(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&STREAM_SIG);
        LittleEndian::write_u32(&mut buf[8..12], self.total_size);
        LittleEndian::write_u64(&mut buf[12..20], self.timestamp_nsec);
        buf[20] = self.pkt_type;
        LittleEndian::write_u64(&mut buf[21..29], self.src.0);
        LittleEndian::write_u64(&mut buf[29..37], self.dst.0);
        buf[37] = 0;
        buf[38] = 0;
        buf[39] = 0;
    }

    /// Parses a header starting at the signature. The caller has verified the
    /// signature and the length.
    pub fn parse(buf: &[u8]) -> StreamPktHeader {
        StreamPktHeader {
            total_size: LittleEndian::read_u32(&buf[8..12]),
            timestamp_nsec: LittleEndian::read_u64(&buf[12..20]),
            pkt_type: buf[20],
            src: NodeAddr(LittleEndian::read_u64(&buf[21..29])),
            dst: NodeAddr(LittleEndian::read_u64(&buf[29..37])),
        }
    }
}

/// Header of one channel packet, carried as the decrypted body of a `data`
/// stream packet.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ChannelPktHeader {
    pub id: u8,
    pub pkt_type: u8,
    pub enc_type: u8,
    pub data_size: u32,
    pub seq_id: u64,
}

impl ChannelPktHeader {
    pub fn write(&self, buf: &mut [u8]) {
        buf[0] = self.id;
        buf[1] = self.pkt_type;
        buf[2] = self.enc_type;
        buf[3] = 0;
        LittleEndian::write_u32(&mut buf[4..8], self.data_size);
        LittleEndian::write_u64(&mut buf[8..16], self.seq_id);
    }

    pub fn parse(buf: &[u8]) -> ChannelPktHeader {
        ChannelPktHeader {
            id: buf[0],
            pkt_type: buf[1],
            enc_type: buf[2],
            data_size: LittleEndian::read_u32(&buf[4..8]),
            seq_id: LittleEndian::read_u64(&buf[8..16]),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FragmentHeader {
    pub full_size: u32,
    pub fragment_size: u32,
    pub mem_shift: u32,
}

impl FragmentHeader {
    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[..4], self.full_size);
        LittleEndian::write_u32(&mut buf[4..8], self.fragment_size);
        LittleEndian::write_u32(&mut buf[8..12], self.mem_shift);
        LittleEndian::write_u32(&mut buf[12..16], 0);
    }

    pub fn parse(buf: &[u8]) -> FragmentHeader {
        FragmentHeader {
            full_size: LittleEndian::read_u32(&buf[..4]),
            fragment_size: LittleEndian::read_u32(&buf[4..8]),
            mem_shift: LittleEndian::read_u32(&buf[8..12]),
        }
    }
}

/// Additional data binding the sealed body to its routing header.
#[inline]
fn aead_ad(pkt_type: u8, src: NodeAddr, dst: NodeAddr) -> [u8; 17] {
    let mut ad = [0u8; 17];
    ad[0] = pkt_type;
    LittleEndian::write_u64(&mut ad[1..9], src.0);
    LittleEndian::write_u64(&mut ad[9..17], dst.0);
    ad
}

/// Frames, seals and base64-encodes one stream packet, returning the wire
/// bytes to hand to the transport.
pub fn encode_stream_pkt(
    pkt_type: u8,
    body: &[u8],
    key: &SessionKey,
    src: NodeAddr,
    dst: NodeAddr,
) -> NetworkResult<Vec<u8>> {
    let sealed = crypto::seal(body, &aead_ad(pkt_type, src, dst), key)
        .ok_or(NetworkError::Fatal(ErrorType::Crypto))?;

    let total = STREAM_HDR_SIZE + sealed.len();
    let mut frame = vec![0u8; total];

    StreamPktHeader {
        total_size: total as u32,
        timestamp_nsec: timestamp_nanos(),
        pkt_type,
        src,
        dst,
    }
    .write(&mut frame[..STREAM_HDR_SIZE]);

    frame[STREAM_HDR_SIZE..].copy_from_slice(&sealed);

    Ok(plasma::encoding::encode(&frame).into_bytes())
}

/// Builds the in-memory channel packet buffer: header followed by payload.
pub fn encode_channel_pkt(id: u8, pkt_type: u8, enc_type: u8, seq_id: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; CH_HDR_SIZE + payload.len()];

    ChannelPktHeader {
        id,
        pkt_type,
        enc_type,
        data_size: payload.len() as u32,
        seq_id,
    }
    .write(&mut buf[..CH_HDR_SIZE]);

    buf[CH_HDR_SIZE..].copy_from_slice(payload);
    buf
}

/// Splits a channel packet buffer into stream packet bodies: one `data` body
/// when it fits, otherwise `fragment` bodies with strictly increasing
/// `mem_shift` covering the buffer disjointly.
pub fn fragment_bodies(channel_pkt: &[u8], max_fragment_size: usize) -> Vec<(u8, Vec<u8>)> {
    if channel_pkt.len() <= max_body(max_fragment_size) {
        return vec![(pkt_type::DATA, channel_pkt.to_vec())];
    }

    let chunk_size = max_payload(max_fragment_size);
    let full_size = channel_pkt.len() as u32;

    channel_pkt
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| {
            let mut body = vec![0u8; FRAG_HDR_SIZE + chunk.len()];

            FragmentHeader {
                full_size,
                fragment_size: chunk.len() as u32,
                mem_shift: (index * chunk_size) as u32,
            }
            .write(&mut body[..FRAG_HDR_SIZE]);

            body[FRAG_HDR_SIZE..].copy_from_slice(chunk);
            (pkt_type::FRAGMENT, body)
        })
        .collect()
}

/// Parses a decrypted `data` body into its channel header and payload.
pub fn parse_channel_pkt(body: &[u8]) -> NetworkResult<(ChannelPktHeader, &[u8])> {
    if body.len() < CH_HDR_SIZE {
        return Err(NetworkError::Fatal(ErrorType::Protocol));
    }

    let hdr = ChannelPktHeader::parse(body);
    let payload = &body[CH_HDR_SIZE..];

    if hdr.data_size as usize > payload.len() {
        return Err(NetworkError::Fatal(ErrorType::Protocol));
    }

    Ok((hdr, &payload[..hdr.data_size as usize]))
}

/// Parses a decrypted `fragment` body into its header and slice.
pub fn parse_fragment(body: &[u8]) -> NetworkResult<(FragmentHeader, &[u8])> {
    if body.len() < FRAG_HDR_SIZE {
        return Err(NetworkError::Fatal(ErrorType::Protocol));
    }

    let hdr = FragmentHeader::parse(body);
    let bytes = &body[FRAG_HDR_SIZE..];

    if hdr.fragment_size as usize != bytes.len() || hdr.fragment_size > hdr.full_size {
        return Err(NetworkError::Fatal(ErrorType::Protocol));
    }

    Ok((hdr, bytes))
}

/// Codec counters, kept per stream.
#[derive(Debug, Default, Copy, Clone)]
pub struct CodecStats {
    pub junk_bytes: u64,
    pub unknown_channel: u64,
    pub unknown_type: u64,
    pub crypto_errors: u64,
}

/// One decoded and decrypted stream packet.
#[derive(Debug, Eq, PartialEq)]
pub struct RawPacket {
    pub pkt_type: u8,
    pub src: NodeAddr,
    pub dst: NodeAddr,
    pub body: Vec<u8>,
}

/// Extracts the next complete packet from the decoded backlog. Bytes before
/// the signature are junk and dropped; a damaged header resynchronizes by
/// skipping one byte. A decryption failure consumes the packet and surfaces
/// as a crypto error for the caller's threshold accounting.
pub fn extract_packet(
    backlog: &mut Vec<u8>,
    key: &SessionKey,
    max_fragment_size: usize,
    stats: &mut CodecStats,
) -> NetworkResult<Option<RawPacket>> {
    loop {
        match find_sig(backlog) {
            None => {
                // Keep a partial signature tail, drop the rest as junk.
                if backlog.len() >= STREAM_SIG.len() {
                    let junk = backlog.len() - (STREAM_SIG.len() - 1);
                    stats.junk_bytes += junk as u64;
                    backlog.drain(..junk);
                }
                return Ok(None);
            }
            Some(0) => (),
            Some(pos) => {
                stats.junk_bytes += pos as u64;
                backlog.drain(..pos);
            }
        }

        if backlog.len() < STREAM_HDR_SIZE {
            return Ok(None);
        }

        let hdr = StreamPktHeader::parse(backlog);
        let total = hdr.total_size as usize;
        let floor = STREAM_HDR_SIZE + SEAL_OVERHEAD;
        let ceiling = STREAM_HDR_SIZE + SEAL_OVERHEAD + max_body(max_fragment_size);

        if total < floor || total > ceiling {
            // Not a real header; skip the signature byte and resync.
            stats.junk_bytes += 1;
            backlog.drain(..1);
            continue;
        }

        if backlog.len() < total {
            return Ok(None);
        }

        let opened = crypto::open(
            &backlog[STREAM_HDR_SIZE..total],
            &aead_ad(hdr.pkt_type, hdr.src, hdr.dst),
            key,
        );

        backlog.drain(..total);

        return match opened {
            Some(body) => Ok(Some(RawPacket {
                pkt_type: hdr.pkt_type,
                src: hdr.src,
                dst: hdr.dst,
                body,
            })),
            None => {
                stats.crypto_errors += 1;
                Err(NetworkError::Fatal(ErrorType::Crypto))
            }
        };
    }
}

#[inline]
fn find_sig(buf: &[u8]) -> Option<usize> {
    match buf.len() < STREAM_SIG.len() {
        true => None,
        false => buf.windows(STREAM_SIG.len()).position(|window| window == STREAM_SIG),
    }
}

/// Accumulates the fragments of one in-flight channel packet. Fragments must
/// arrive with monotonically matching `mem_shift`; anything inconsistent
/// resets the buffer.
pub struct Reassembly {
    buf: Vec<u8>,
    full: usize,
}

impl Reassembly {
    #[inline]
    pub fn new() -> Reassembly {
        Reassembly { buf: Vec::new(), full: 0 }
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn reset(&mut self) {
        self.buf.clear();
        self.full = 0;
    }

    /// Feeds one fragment body. Returns the complete channel packet once
    /// `mem_shift + fragment_size` covers `full_size`.
    pub fn push(&mut self, body: &[u8], cap: usize) -> NetworkResult<Option<Vec<u8>>> {
        let (hdr, bytes) = match parse_fragment(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };

        if hdr.full_size as usize > cap {
            self.reset();
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        if self.buf.is_empty() {
            if hdr.mem_shift != 0 {
                self.reset();
                return Err(NetworkError::Fatal(ErrorType::FragmentMismatch));
            }

            self.full = hdr.full_size as usize;
        } else if hdr.full_size as usize != self.full || hdr.mem_shift as usize != self.buf.len() {
            self.reset();
            return Err(NetworkError::Fatal(ErrorType::FragmentMismatch));
        }

        if self.buf.len() + bytes.len() > self.full {
            self.reset();
            return Err(NetworkError::Fatal(ErrorType::FragmentMismatch));
        }

        self.buf.extend_from_slice(bytes);

        match self.buf.len() == self.full {
            true => {
                let packet = std::mem::replace(&mut self.buf, Vec::new());
                self.full = 0;
                Ok(Some(packet))
            }
            false => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_FRAGMENT: usize = 65536;

    fn key() -> SessionKey {
        let mut bytes = vec![0u8; crypto::KEY_SIZE];
        crypto::random_bytes(&mut bytes);
        SessionKey::new(bytes)
    }

    fn decode_wire(wire: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        plasma::encoding::decode_stream(wire, &mut out).unwrap();
        out
    }

    #[test]
    fn stream_header_round_trip() {
        let hdr = StreamPktHeader {
            total_size: 1234,
            timestamp_nsec: 987_654_321,
            pkt_type: pkt_type::DATA,
            src: NodeAddr(0x1111_2222_3333_4444),
            dst: NodeAddr(0x5555_6666_7777_8888),
        };

        let mut buf = [0u8; STREAM_HDR_SIZE];
        hdr.write(&mut buf);

        assert_eq!(&buf[..8], &STREAM_SIG);
        assert_eq!(StreamPktHeader::parse(&buf), hdr);
    }

    #[test]
    fn channel_header_round_trip() {
        let hdr = ChannelPktHeader {
            id: b'E',
            pkt_type: 0x10,
            enc_type: 0,
            data_size: 13,
            seq_id: 42,
        };

        let mut buf = [0u8; CH_HDR_SIZE];
        hdr.write(&mut buf);
        assert_eq!(ChannelPktHeader::parse(&buf), hdr);
    }

    #[test]
    fn encode_extract_round_trip() {
        let key = key();
        let src = NodeAddr(7);
        let dst = NodeAddr(9);
        let body = encode_channel_pkt(b'E', 0x10, 0, 0, b"hello, world!");

        let wire = encode_stream_pkt(pkt_type::DATA, &body, &key, src, dst).unwrap();
        let mut backlog = decode_wire(&wire);

        let mut stats = CodecStats::default();
        let packet = extract_packet(&mut backlog, &key, MAX_FRAGMENT, &mut stats)
            .unwrap()
            .unwrap();

        assert_eq!(packet.pkt_type, pkt_type::DATA);
        assert_eq!(packet.src, src);
        assert_eq!(packet.dst, dst);
        assert_eq!(packet.body, body);
        assert!(backlog.is_empty());
        assert_eq!(stats.junk_bytes, 0);

        let (hdr, payload) = parse_channel_pkt(&packet.body).unwrap();
        assert_eq!(hdr.id, b'E');
        assert_eq!(payload, b"hello, world!");
    }

    #[test]
    fn junk_before_signature_dropped() {
        let key = key();
        let wire = encode_stream_pkt(pkt_type::KEEPALIVE, &[], &key, NodeAddr(1), NodeAddr(2)).unwrap();

        let mut backlog = b"GET / HTTP/1.1\r\n".to_vec();
        backlog.extend_from_slice(&decode_wire(&wire));

        let mut stats = CodecStats::default();
        let packet = extract_packet(&mut backlog, &key, MAX_FRAGMENT, &mut stats)
            .unwrap()
            .unwrap();

        assert_eq!(packet.pkt_type, pkt_type::KEEPALIVE);
        assert_eq!(stats.junk_bytes, 16);
    }

    #[test]
    fn incomplete_packet_waits() {
        let key = key();
        let body = encode_channel_pkt(b'X', 1, 0, 0, &[0xAB; 100]);
        let wire = encode_stream_pkt(pkt_type::DATA, &body, &key, NodeAddr(1), NodeAddr(2)).unwrap();
        let decoded = decode_wire(&wire);

        let mut backlog = decoded[..decoded.len() - 10].to_vec();
        let mut stats = CodecStats::default();

        assert!(extract_packet(&mut backlog, &key, MAX_FRAGMENT, &mut stats)
            .unwrap()
            .is_none());

        backlog.extend_from_slice(&decoded[decoded.len() - 10..]);
        assert!(extract_packet(&mut backlog, &key, MAX_FRAGMENT, &mut stats)
            .unwrap()
            .is_some());
    }

    #[test]
    fn wrong_key_is_a_crypto_error() {
        let body = encode_channel_pkt(b'E', 0, 0, 0, b"secret");
        let wire = encode_stream_pkt(pkt_type::DATA, &body, &key(), NodeAddr(1), NodeAddr(2)).unwrap();

        let mut backlog = decode_wire(&wire);
        let mut stats = CodecStats::default();
        let result = extract_packet(&mut backlog, &key(), MAX_FRAGMENT, &mut stats);

        assert_eq!(result, Err(NetworkError::Fatal(ErrorType::Crypto)));
        assert_eq!(stats.crypto_errors, 1);
        // The damaged packet is consumed, not replayed.
        assert!(backlog.is_empty());
    }

    #[test]
    fn payload_at_limit_is_one_data_packet() {
        let payload = vec![3u8; max_payload(MAX_FRAGMENT)];
        let channel_pkt = encode_channel_pkt(b'E', 0, 0, 0, &payload);

        let bodies = fragment_bodies(&channel_pkt, MAX_FRAGMENT);
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].0, pkt_type::DATA);
    }

    #[test]
    fn payload_one_over_limit_is_two_fragments() {
        let payload = vec![3u8; max_payload(MAX_FRAGMENT) + 1];
        let channel_pkt = encode_channel_pkt(b'E', 0, 0, 0, &payload);

        let bodies = fragment_bodies(&channel_pkt, MAX_FRAGMENT);
        assert_eq!(bodies.len(), 2);
        assert!(bodies.iter().all(|(ty, _)| *ty == pkt_type::FRAGMENT));
    }

    #[test]
    fn fragments_cover_disjointly_and_reassemble() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
        let channel_pkt = encode_channel_pkt(b'E', 0, 0, 7, &payload);
        let bodies = fragment_bodies(&channel_pkt, MAX_FRAGMENT);

        let expected = (channel_pkt.len() + max_payload(MAX_FRAGMENT) - 1) / max_payload(MAX_FRAGMENT);
        assert_eq!(bodies.len(), expected);

        let mut reassembly = Reassembly::new();
        let mut covered = 0usize;
        let mut complete = None;

        for (ty, body) in &bodies {
            assert_eq!(*ty, pkt_type::FRAGMENT);

            let (hdr, bytes) = parse_fragment(body).unwrap();
            assert_eq!(hdr.mem_shift as usize, covered);
            covered += bytes.len();

            if let Some(packet) = reassembly.push(body, 16 * 1024 * 1024).unwrap() {
                complete = Some(packet);
            }
        }

        assert_eq!(covered, channel_pkt.len());
        assert_eq!(complete.unwrap(), channel_pkt);
        assert!(reassembly.is_idle());
    }

    #[test]
    fn reassembly_rejects_out_of_order_shift() {
        let payload = vec![9u8; max_payload(MAX_FRAGMENT) * 2];
        let channel_pkt = encode_channel_pkt(b'E', 0, 0, 0, &payload);
        let bodies = fragment_bodies(&channel_pkt, MAX_FRAGMENT);

        let mut reassembly = Reassembly::new();
        reassembly.push(&bodies[0].1, 16 * 1024 * 1024).unwrap();

        // Replaying the first fragment no longer matches the expected shift.
        let result = reassembly.push(&bodies[0].1, 16 * 1024 * 1024);
        assert_eq!(result, Err(NetworkError::Fatal(ErrorType::FragmentMismatch)));
        assert!(reassembly.is_idle());
    }

    #[test]
    fn reassembly_enforces_cap() {
        let payload = vec![1u8; max_payload(MAX_FRAGMENT) + 1];
        let channel_pkt = encode_channel_pkt(b'E', 0, 0, 0, &payload);
        let bodies = fragment_bodies(&channel_pkt, MAX_FRAGMENT);

        let mut reassembly = Reassembly::new();
        let result = reassembly.push(&bodies[0].1, 1024);

        assert_eq!(result, Err(NetworkError::Fatal(ErrorType::PayloadTooLarge)));
    }
}
