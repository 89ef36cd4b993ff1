//! DSHP v1: the TLV request/response exchange that negotiates a session key
//! and identity before stream framing begins. Carried as length-prefixed
//! bundles in the first bytes on the descriptor.

use crate::stream::session::{self, Session};
use crate::stream::tlv::{field, TlvBundle, TlvWriter};
use crate::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder};
use plasma::crypto::{self, CipherId, KemId, KemKeypair, KeyExchange, SessionKey};
use std::sync::Arc;

pub const MAGIC: u32 = 0xDA4A_1A48;
/// Major version in the high byte; peers compare majors only.
pub const VERSION: u32 = 0x0100_0000;

/// Upper bound on one framed handshake message.
pub const MESSAGE_LIMIT: usize = 64 * 1024;

const FRAME_PREFIX: usize = 4;

pub mod message_type {
    pub const HANDSHAKE_REQUEST: u16 = 1;
    pub const HANDSHAKE_RESPONSE: u16 = 2;
    pub const SESSION_CREATE: u16 = 3;
    pub const SESSION_CREATE_RESPONSE: u16 = 4;
    pub const ERROR: u16 = 5;
    pub const KEEPALIVE: u16 = 6;
}

pub mod error_code {
    pub const VERSION_MISMATCH: u32 = 1;
    pub const UNKNOWN_CIPHER: u32 = 2;
    pub const UNKNOWN_KEM: u32 = 3;
    pub const BAD_KEY: u32 = 4;
    pub const PROTOCOL: u32 = 5;
    pub const SESSION: u32 = 6;
    pub const SIGNATURE: u32 = 7;
    pub const INTERNAL: u32 = 8;
}

/// Human-readable rendering for peer-reported codes.
pub fn describe_error(code: u32) -> String {
    match code {
        error_code::VERSION_MISMATCH => "version mismatch".to_string(),
        error_code::UNKNOWN_CIPHER => "unknown cipher".to_string(),
        error_code::UNKNOWN_KEM => "unknown key exchange".to_string(),
        error_code::BAD_KEY => "bad key material".to_string(),
        error_code::PROTOCOL => "protocol violation".to_string(),
        error_code::SESSION => "session rejected".to_string(),
        error_code::SIGNATURE => "signature rejected".to_string(),
        error_code::INTERNAL => "internal error".to_string(),
        other => format!("unknown error {}", other),
    }
}

#[inline]
pub fn version_compatible(version: u32) -> bool {
    version >> 24 == VERSION >> 24
}

/// Prepends the 4-byte big-endian length used to delimit handshake messages
/// on byte-stream transports.
pub fn frame_message(tlv: &[u8]) -> Vec<u8> {
    let mut framed = vec![0u8; FRAME_PREFIX + tlv.len()];
    BigEndian::write_u32(&mut framed[..FRAME_PREFIX], tlv.len() as u32);
    framed[FRAME_PREFIX..].copy_from_slice(tlv);
    framed
}

/// Extracts one framed message from the front of `buf`. Returns the consumed
/// size and the TLV body, or None while the message is still incomplete.
pub fn read_message(buf: &[u8]) -> NetworkResult<Option<(usize, &[u8])>> {
    if buf.len() < FRAME_PREFIX {
        return Ok(None);
    }

    let length = BigEndian::read_u32(buf) as usize;

    if length > MESSAGE_LIMIT {
        return Err(NetworkError::Fatal(ErrorType::Protocol));
    }

    match buf.len() < FRAME_PREFIX + length {
        true => Ok(None),
        false => Ok(Some((FRAME_PREFIX + length, &buf[FRAME_PREFIX..FRAME_PREFIX + length]))),
    }
}

/// Parses the common envelope of any DSHP message: magic, version and
/// message type.
pub fn parse_message(body: &[u8]) -> NetworkResult<(u16, TlvBundle)> {
    let bundle = TlvBundle::parse(body)?;

    if bundle.u32(field::MAGIC)? != MAGIC {
        return Err(NetworkError::Fatal(ErrorType::Protocol));
    }

    if !version_compatible(bundle.u32(field::VERSION)?) {
        return Err(NetworkError::Fatal(ErrorType::VersionMismatch));
    }

    let message_type = bundle.u16(field::MESSAGE_TYPE)?;
    Ok((message_type, bundle))
}

fn envelope(message_type: u16) -> TlvWriter {
    let mut writer = TlvWriter::new();
    writer
        .put_u32(field::MAGIC, MAGIC)
        .put_u32(field::VERSION, VERSION)
        .put_u16(field::MESSAGE_TYPE, message_type);
    writer
}

/// Splits a `channels` TLV string (`"E|C|N"`, comma or pipe separated) into
/// channel ids. Every entry must be one printable ASCII character.
pub fn parse_channel_list(raw: &str) -> NetworkResult<Vec<u8>> {
    let mut channels = Vec::new();

    for entry in raw.split(|c| c == '|' || c == ',') {
        if entry.is_empty() {
            continue;
        }

        let bytes = entry.as_bytes();

        if bytes.len() != 1 || bytes[0] < 0x21 || bytes[0] > 0x7e {
            return Err(NetworkError::Fatal(ErrorType::Protocol));
        }

        channels.push(bytes[0]);
    }

    Ok(channels)
}

pub fn format_channel_list(channels: &[u8]) -> String {
    channels
        .iter()
        .map(|&id| (id as char).to_string())
        .collect::<Vec<String>>()
        .join("|")
}

/// Alice's opening message.
#[derive(Debug)]
pub struct HandshakeRequest {
    pub enc_type: u8,
    pub kem_type: u8,
    pub pkey_exchange_size: u32,
    pub block_key_size: u32,
    pub alice_pub_key: Vec<u8>,
    pub alice_signature: Option<Vec<u8>>,
}

impl HandshakeRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = envelope(message_type::HANDSHAKE_REQUEST);
        writer
            .put_u8(field::ENC_TYPE, self.enc_type)
            .put_u8(field::PKEY_EXCHANGE_TYPE, self.kem_type)
            .put_u32(field::PKEY_EXCHANGE_SIZE, self.pkey_exchange_size)
            .put_u32(field::BLOCK_KEY_SIZE, self.block_key_size)
            .put(field::ALICE_PUB_KEY, &self.alice_pub_key);

        if let Some(signature) = &self.alice_signature {
            writer.put(field::ALICE_SIGNATURE, signature);
        }

        writer.finish()
    }

    pub fn decode(bundle: &TlvBundle) -> NetworkResult<HandshakeRequest> {
        Ok(HandshakeRequest {
            enc_type: bundle.u8(field::ENC_TYPE)?,
            kem_type: bundle.u8(field::PKEY_EXCHANGE_TYPE)?,
            pkey_exchange_size: bundle.u32(field::PKEY_EXCHANGE_SIZE)?,
            block_key_size: bundle.u32(field::BLOCK_KEY_SIZE)?,
            alice_pub_key: bundle.required(field::ALICE_PUB_KEY)?.to_vec(),
            alice_signature: bundle.bytes(field::ALICE_SIGNATURE).map(<[u8]>::to_vec),
        })
    }
}

/// Bob's reply carrying the encapsulated shared secret, or an error.
#[derive(Debug)]
pub struct HandshakeResponse {
    pub status: u8,
    pub session_id: u32,
    pub session_timeout: Option<u32>,
    pub bob_pub_key: Vec<u8>,
}

impl HandshakeResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = envelope(message_type::HANDSHAKE_RESPONSE);
        writer
            .put_u8(field::STATUS, self.status)
            .put_u32(field::SESSION_ID, self.session_id)
            .put(field::BOB_PUB_KEY, &self.bob_pub_key);

        if let Some(timeout) = self.session_timeout {
            writer.put_u32(field::SESSION_TIMEOUT, timeout);
        }

        writer.finish()
    }

    pub fn decode(bundle: &TlvBundle) -> NetworkResult<HandshakeResponse> {
        Ok(HandshakeResponse {
            status: bundle.u8(field::STATUS)?,
            session_id: bundle.u32(field::SESSION_ID)?,
            session_timeout: bundle.u32_opt(field::SESSION_TIMEOUT)?,
            bob_pub_key: bundle.required(field::BOB_PUB_KEY)?.to_vec(),
        })
    }
}

/// Alice names the channels and cipher for the session. An existing session
/// id requests adoption of a detached session instead of a fresh one.
#[derive(Debug)]
pub struct SessionCreate {
    pub channels: String,
    pub enc_type: u8,
    pub enc_key_size: u32,
    pub session_id: Option<u32>,
}

impl SessionCreate {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = envelope(message_type::SESSION_CREATE);
        writer
            .put_str(field::CHANNELS, &self.channels)
            .put_u8(field::ENC_TYPE, self.enc_type)
            .put_u32(field::BLOCK_KEY_SIZE, self.enc_key_size);

        if let Some(id) = self.session_id {
            writer.put_u32(field::SESSION_ID, id);
        }

        writer.finish()
    }

    pub fn decode(bundle: &TlvBundle) -> NetworkResult<SessionCreate> {
        Ok(SessionCreate {
            channels: bundle.str(field::CHANNELS)?.to_string(),
            enc_type: bundle.u8(field::ENC_TYPE)?,
            enc_key_size: bundle.u32(field::BLOCK_KEY_SIZE)?,
            session_id: bundle.u32_opt(field::SESSION_ID)?,
        })
    }
}

#[derive(Debug)]
pub struct SessionCreateResponse {
    pub status: u8,
    pub session_id: u32,
}

impl SessionCreateResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = envelope(message_type::SESSION_CREATE_RESPONSE);
        writer
            .put_u8(field::STATUS, self.status)
            .put_u32(field::SESSION_ID, self.session_id);
        writer.finish()
    }

    pub fn decode(bundle: &TlvBundle) -> NetworkResult<SessionCreateResponse> {
        Ok(SessionCreateResponse {
            status: bundle.u8(field::STATUS)?,
            session_id: bundle.u32(field::SESSION_ID)?,
        })
    }
}

fn error_message(code: u32) -> Vec<u8> {
    let mut writer = envelope(message_type::ERROR);
    writer
        .put_u32(field::ERROR_CODE, code)
        .put_str(field::ERROR_MESSAGE, &describe_error(code));
    writer.finish()
}

/// Acceptance hook for the optional request signature. The core bakes in no
/// policy; applications decide what an acceptable identity proof is.
pub trait SignaturePolicy: Send + Sync {
    fn accept(&self, kem: KemId, public_key: &[u8], signature: Option<&[u8]>) -> bool;
}

/// The default policy: any signature, or none at all.
pub struct AcceptAll;

impl SignaturePolicy for AcceptAll {
    fn accept(&self, _kem: KemId, _public_key: &[u8], _signature: Option<&[u8]>) -> bool {
        true
    }
}

/// What the descriptor driving the handshake should do next.
pub enum HandshakeAction {
    /// Write these framed bytes and keep waiting.
    Reply(Vec<u8>),
    /// Write the reply, bind the session and switch to stream framing.
    Established { reply: Vec<u8>, session: Arc<Session> },
    /// Write the error reply and close the descriptor.
    Fail { reply: Vec<u8>, code: u32 },
    /// Nothing to do (keepalive).
    Ignore,
}

enum ServerState {
    ExpectRequest,
    ExpectSessionCreate { session: Arc<Session> },
    Streaming,
}

/// Bob's half of the exchange, fed one decoded message at a time.
pub struct ServerHandshake {
    state: ServerState,
    policy: Arc<dyn SignaturePolicy>,
    session_timeout_sec: u64,
}

impl ServerHandshake {
    pub fn new(policy: Arc<dyn SignaturePolicy>, session_timeout_sec: u64) -> ServerHandshake {
        ServerHandshake {
            state: ServerState::ExpectRequest,
            policy,
            session_timeout_sec,
        }
    }

    /// Drops the provisional session when the descriptor dies mid-exchange.
    pub fn abandon(&mut self) {
        if let ServerState::ExpectSessionCreate { session } = &self.state {
            session::close(session.id);
        }

        self.state = ServerState::ExpectRequest;
    }

    pub fn on_message(&mut self, body: &[u8]) -> HandshakeAction {
        match self.handle(body) {
            Ok(action) => action,
            Err(code) => {
                self.abandon();
                HandshakeAction::Fail {
                    reply: frame_message(&error_message(code)),
                    code,
                }
            }
        }
    }

    fn handle(&mut self, body: &[u8]) -> Result<HandshakeAction, u32> {
        let (message_type, bundle) = parse_message(body).map_err(|e| match e {
            NetworkError::Fatal(ErrorType::VersionMismatch) => error_code::VERSION_MISMATCH,
            _ => error_code::PROTOCOL,
        })?;

        if message_type == message_type::KEEPALIVE {
            return Ok(HandshakeAction::Ignore);
        }

        match std::mem::replace(&mut self.state, ServerState::ExpectRequest) {
            ServerState::ExpectRequest => {
                if message_type != message_type::HANDSHAKE_REQUEST {
                    return Err(error_code::PROTOCOL);
                }

                let request = HandshakeRequest::decode(&bundle).map_err(|_| error_code::PROTOCOL)?;

                if !crypto::cipher_supported(CipherId(request.enc_type)) {
                    return Err(error_code::UNKNOWN_CIPHER);
                }

                let kem = crypto::kem_find(KemId(request.kem_type)).ok_or(error_code::UNKNOWN_KEM)?;

                if request.alice_pub_key.is_empty() || request.block_key_size == 0 {
                    return Err(error_code::BAD_KEY);
                }

                let signature = request.alice_signature.as_deref();

                if !self.policy.accept(KemId(request.kem_type), &request.alice_pub_key, signature) {
                    return Err(error_code::SIGNATURE);
                }

                let (ciphertext, key) = kem
                    .encapsulate(&request.alice_pub_key, request.block_key_size as usize)
                    .ok_or(error_code::BAD_KEY)?;

                let session = session::open(CipherId(request.enc_type), key, Vec::new());

                let reply = HandshakeResponse {
                    status: 0,
                    session_id: session.id,
                    session_timeout: Some(self.session_timeout_sec as u32),
                    bob_pub_key: ciphertext,
                }
                .encode();

                self.state = ServerState::ExpectSessionCreate { session };
                Ok(HandshakeAction::Reply(frame_message(&reply)))
            }
            ServerState::ExpectSessionCreate { session } => {
                if message_type != message_type::SESSION_CREATE {
                    session::close(session.id);
                    return Err(error_code::PROTOCOL);
                }

                let create = SessionCreate::decode(&bundle).map_err(|_| {
                    session::close(session.id);
                    error_code::PROTOCOL
                })?;

                if !crypto::cipher_supported(CipherId(create.enc_type)) {
                    session::close(session.id);
                    return Err(error_code::UNKNOWN_CIPHER);
                }

                let channels = parse_channel_list(&create.channels).map_err(|_| {
                    session::close(session.id);
                    error_code::PROTOCOL
                })?;

                // Reattach: adopt a surviving detached session instead of the
                // provisional one.
                let session = match create.session_id {
                    Some(existing_id) if existing_id != session.id => {
                        match session::find(existing_id, self.session_timeout_sec) {
                            Some(existing) if !existing.is_bound() => {
                                // The adopted session continues under the key
                                // negotiated by this exchange.
                                existing.set_key(session.key());
                                session::close(session.id);
                                existing
                            }
                            _ => {
                                session::close(session.id);
                                return Err(error_code::SESSION);
                            }
                        }
                    }
                    _ => session,
                };

                session.set_channels(channels);

                let reply = SessionCreateResponse {
                    status: 0,
                    session_id: session.id,
                }
                .encode();

                self.state = ServerState::Streaming;
                Ok(HandshakeAction::Established {
                    reply: frame_message(&reply),
                    session,
                })
            }
            ServerState::Streaming => Err(error_code::PROTOCOL),
        }
    }
}

enum ClientState {
    AwaitResponse,
    AwaitCreateResponse,
    Done,
}

/// What the client driving the exchange should do next.
pub enum ClientAction {
    Send(Vec<u8>),
    Established {
        session_id: u32,
        session_timeout: Option<u32>,
        key: SessionKey,
        channels: Vec<u8>,
    },
    Failed {
        code: u32,
        message: String,
    },
}

/// Alice's half of the exchange.
pub struct ClientHandshake {
    kem: Arc<dyn KeyExchange>,
    kem_id: KemId,
    keypair: KemKeypair,
    cipher: CipherId,
    block_key_size: u32,
    channels: Vec<u8>,
    reattach: Option<u32>,
    state: ClientState,
    session_id: u32,
    session_timeout: Option<u32>,
    key: Option<SessionKey>,
}

impl ClientHandshake {
    pub fn new(
        cipher: CipherId,
        kem_id: KemId,
        channels: &[u8],
        reattach: Option<u32>,
    ) -> NetworkResult<ClientHandshake> {
        if !crypto::cipher_supported(cipher) {
            return Err(NetworkError::Fatal(ErrorType::UnknownCipher));
        }

        let kem = crypto::kem_find(kem_id).ok_or(NetworkError::Fatal(ErrorType::UnknownCipher))?;
        let keypair = kem.keypair();

        Ok(ClientHandshake {
            kem,
            kem_id,
            keypair,
            cipher,
            block_key_size: plasma::crypto::KEY_SIZE as u32,
            channels: channels.to_vec(),
            reattach,
            state: ClientState::AwaitResponse,
            session_id: 0,
            session_timeout: None,
            key: None,
        })
    }

    /// The framed opening message.
    pub fn request(&self) -> Vec<u8> {
        let request = HandshakeRequest {
            enc_type: self.cipher.0,
            kem_type: self.kem_id.0,
            pkey_exchange_size: self.kem.public_key_size() as u32,
            block_key_size: self.block_key_size,
            alice_pub_key: self.keypair.public.clone(),
            alice_signature: None,
        };

        frame_message(&request.encode())
    }

    pub fn on_message(&mut self, body: &[u8]) -> NetworkResult<ClientAction> {
        let (message_type, bundle) = parse_message(body)?;

        if message_type == message_type::ERROR {
            let code = bundle.u32(field::ERROR_CODE)?;
            let message = bundle
                .str_opt(field::ERROR_MESSAGE)?
                .map(str::to_string)
                .unwrap_or_else(|| describe_error(code));

            self.state = ClientState::Done;
            return Ok(ClientAction::Failed { code, message });
        }

        if message_type == message_type::KEEPALIVE {
            return Err(NetworkError::Wait);
        }

        match self.state {
            ClientState::AwaitResponse => {
                if message_type != message_type::HANDSHAKE_RESPONSE {
                    return Err(NetworkError::Fatal(ErrorType::Protocol));
                }

                let response = HandshakeResponse::decode(&bundle)?;

                if response.status != 0 {
                    self.state = ClientState::Done;
                    return Ok(ClientAction::Failed {
                        code: u32::from(response.status),
                        message: describe_error(u32::from(response.status)),
                    });
                }

                if response.bob_pub_key.is_empty() {
                    return Err(NetworkError::Fatal(ErrorType::Protocol));
                }

                let key = self
                    .kem
                    .decapsulate(&self.keypair, &response.bob_pub_key, self.block_key_size as usize)
                    .ok_or(NetworkError::Fatal(ErrorType::Crypto))?;

                self.session_id = response.session_id;
                self.session_timeout = response.session_timeout;
                self.key = Some(key);
                self.state = ClientState::AwaitCreateResponse;

                let create = SessionCreate {
                    channels: format_channel_list(&self.channels),
                    enc_type: self.cipher.0,
                    enc_key_size: self.block_key_size,
                    session_id: self.reattach,
                };

                Ok(ClientAction::Send(frame_message(&create.encode())))
            }
            ClientState::AwaitCreateResponse => {
                if message_type != message_type::SESSION_CREATE_RESPONSE {
                    return Err(NetworkError::Fatal(ErrorType::Protocol));
                }

                let response = SessionCreateResponse::decode(&bundle)?;

                if response.status != 0 {
                    self.state = ClientState::Done;
                    return Ok(ClientAction::Failed {
                        code: u32::from(response.status),
                        message: describe_error(u32::from(response.status)),
                    });
                }

                self.state = ClientState::Done;

                Ok(ClientAction::Established {
                    session_id: response.session_id,
                    session_timeout: self.session_timeout,
                    key: self.key.take().ok_or(NetworkError::Fatal(ErrorType::InvalidState))?,
                    channels: self.channels.clone(),
                })
            }
            ClientState::Done => Err(NetworkError::Fatal(ErrorType::Protocol)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_exchange(
        channels: &[u8],
        reattach: Option<u32>,
    ) -> (ClientHandshake, Arc<Session>, SessionKey, u32) {
        let mut client =
            ClientHandshake::new(CipherId::CHACHA20_POLY1305, KemId::CURVE25519, channels, reattach)
                .unwrap();
        let mut server = ServerHandshake::new(Arc::new(AcceptAll), 900);

        let request = client.request();
        let (_, body) = read_message(&request).unwrap().unwrap();

        let reply = match server.on_message(body) {
            HandshakeAction::Reply(reply) => reply,
            _ => panic!("Expected handshake reply"),
        };

        let (_, body) = read_message(&reply).unwrap().unwrap();
        let create = match client.on_message(body).unwrap() {
            ClientAction::Send(create) => create,
            _ => panic!("Expected session create"),
        };

        let (_, body) = read_message(&create).unwrap().unwrap();
        let (reply, session) = match server.on_message(body) {
            HandshakeAction::Established { reply, session } => (reply, session),
            _ => panic!("Expected establishment"),
        };

        let (_, body) = read_message(&reply).unwrap().unwrap();
        let (session_id, key) = match client.on_message(body).unwrap() {
            ClientAction::Established { session_id, key, .. } => (session_id, key),
            _ => panic!("Expected client establishment"),
        };

        (client, session, key, session_id)
    }

    #[test]
    fn full_exchange_agrees_on_key_and_session() {
        let (_, session, client_key, session_id) = run_exchange(b"EC", None);

        assert_eq!(session.id, session_id);
        assert_eq!(*session.key(), *client_key);
        assert_eq!(session.channels(), vec![b'E', b'C']);

        session::close(session.id);
    }

    #[test]
    fn reattach_adopts_detached_session() {
        let (_, first, _, _) = run_exchange(b"E", None);
        first.unbind();

        let (_, second, key, session_id) = run_exchange(b"E", Some(first.id));

        assert_eq!(second.id, first.id);
        assert_eq!(session_id, first.id);
        // The adopted session carries the key of the fresh exchange.
        assert_eq!(*second.key(), *key);

        session::close(first.id);
    }

    #[test]
    fn unknown_cipher_rejected_with_code() {
        let mut client =
            ClientHandshake::new(CipherId::CHACHA20_POLY1305, KemId::CURVE25519, b"E", None).unwrap();
        let mut server = ServerHandshake::new(Arc::new(AcceptAll), 900);

        // Corrupt the cipher id before encoding.
        let request = HandshakeRequest {
            enc_type: 0x3f,
            kem_type: KemId::CURVE25519.0,
            pkey_exchange_size: 32,
            block_key_size: 32,
            alice_pub_key: vec![1u8; 32],
            alice_signature: None,
        };
        let framed = frame_message(&request.encode());
        let (_, body) = read_message(&framed).unwrap().unwrap();

        let (reply, code) = match server.on_message(body) {
            HandshakeAction::Fail { reply, code } => (reply, code),
            _ => panic!("Expected failure"),
        };

        assert_eq!(code, error_code::UNKNOWN_CIPHER);

        let (_, body) = read_message(&reply).unwrap().unwrap();
        match client.on_message(body).unwrap() {
            ClientAction::Failed { code, message } => {
                assert_eq!(code, error_code::UNKNOWN_CIPHER);
                assert_eq!(message, "unknown cipher");
            }
            _ => panic!("Expected client failure"),
        }
    }

    #[test]
    fn version_major_mismatch_rejected() {
        let mut server = ServerHandshake::new(Arc::new(AcceptAll), 900);

        let mut writer = TlvWriter::new();
        writer
            .put_u32(field::MAGIC, MAGIC)
            .put_u32(field::VERSION, 0x0200_0000)
            .put_u16(field::MESSAGE_TYPE, message_type::HANDSHAKE_REQUEST);

        let body = writer.finish();

        match server.on_message(&body) {
            HandshakeAction::Fail { code, .. } => assert_eq!(code, error_code::VERSION_MISMATCH),
            _ => panic!("Expected failure"),
        }
    }

    #[test]
    fn minor_version_difference_accepted() {
        assert!(version_compatible(0x0101_0000));
        assert!(version_compatible(0x01ff_ffff));
        assert!(!version_compatible(0x0200_0000));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut server = ServerHandshake::new(Arc::new(AcceptAll), 900);

        let mut writer = TlvWriter::new();
        writer
            .put_u32(field::MAGIC, 0xdead_beef)
            .put_u32(field::VERSION, VERSION)
            .put_u16(field::MESSAGE_TYPE, message_type::HANDSHAKE_REQUEST);

        match server.on_message(&writer.finish()) {
            HandshakeAction::Fail { code, .. } => assert_eq!(code, error_code::PROTOCOL),
            _ => panic!("Expected failure"),
        }
    }

    #[test]
    fn zero_length_key_rejected() {
        let mut server = ServerHandshake::new(Arc::new(AcceptAll), 900);

        let request = HandshakeRequest {
            enc_type: CipherId::CHACHA20_POLY1305.0,
            kem_type: KemId::CURVE25519.0,
            pkey_exchange_size: 0,
            block_key_size: 32,
            alice_pub_key: Vec::new(),
            alice_signature: None,
        };

        match server.on_message(&request.encode()) {
            HandshakeAction::Fail { code, .. } => assert_eq!(code, error_code::BAD_KEY),
            _ => panic!("Expected failure"),
        }
    }

    struct RejectAll;

    impl SignaturePolicy for RejectAll {
        fn accept(&self, _kem: KemId, _public_key: &[u8], _signature: Option<&[u8]>) -> bool {
            false
        }
    }

    #[test]
    fn signature_policy_hook_applies() {
        let client =
            ClientHandshake::new(CipherId::CHACHA20_POLY1305, KemId::CURVE25519, b"E", None).unwrap();
        let mut server = ServerHandshake::new(Arc::new(RejectAll), 900);

        let request = client.request();
        let (_, body) = read_message(&request).unwrap().unwrap();

        match server.on_message(body) {
            HandshakeAction::Fail { code, .. } => assert_eq!(code, error_code::SIGNATURE),
            _ => panic!("Expected failure"),
        }
    }

    #[test]
    fn channel_list_round_trip() {
        assert_eq!(parse_channel_list("E|C|N").unwrap(), vec![b'E', b'C', b'N']);
        assert_eq!(parse_channel_list("E,C,N").unwrap(), vec![b'E', b'C', b'N']);
        assert_eq!(format_channel_list(&[b'E', b'C']), "E|C");
        assert!(parse_channel_list("EC|N").is_err());
        assert!(parse_channel_list(" |N").is_err());
    }

    #[test]
    fn partial_frame_waits() {
        let framed = frame_message(b"tlv bytes");

        assert!(read_message(&framed[..3]).unwrap().is_none());
        assert!(read_message(&framed[..framed.len() - 1]).unwrap().is_none());

        let (consumed, body) = read_message(&framed).unwrap().unwrap();
        assert_eq!(consumed, framed.len());
        assert_eq!(body, b"tlv bytes");
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut framed = vec![0u8; 4];
        BigEndian::write_u32(&mut framed, (MESSAGE_LIMIT + 1) as u32);

        assert!(read_message(&framed).is_err());
    }
}
