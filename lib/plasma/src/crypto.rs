//! The narrow cryptographic surface consumed by the networking core: an AEAD
//! cipher, a key-exchange mechanism and a randomness source, all backed by
//! libsodium. Concrete engines are looked up by id so applications can install
//! additional mechanisms (post-quantum KEMs and such) without the core knowing
//! about them.

use ctor::ctor;
use lazy_static::lazy_static;
use libsodium_sys;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, RwLock};

pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;

/// Total ciphertext expansion of `seal`: the leading nonce plus the trailing MAC.
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + MAC_SIZE;

/// X25519 public key and encapsulation sizes for the built-in KEM.
pub const DH_PUBLIC_KEY_SIZE: usize = 32;
pub const DH_SECRET_KEY_SIZE: usize = 32;

const DERIVED_KEY_MIN: usize = 16;
const DERIVED_KEY_MAX: usize = 64;

/// Initialize the sodium infrastructure
#[ctor(unsafe)]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Symmetric cipher identifier. The value space 0x00-0x3F is reserved for
/// symmetric ciphers; KEM and signature ids live in disjoint ranges.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct CipherId(pub u8);

impl CipherId {
    pub const CHACHA20_POLY1305: CipherId = CipherId(0x01);

    #[inline]
    pub fn in_range(self) -> bool {
        self.0 <= 0x3f
    }
}

/// Key-exchange mechanism identifier, range 0x40-0x7F.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct KemId(pub u8);

impl KemId {
    pub const CURVE25519: KemId = KemId(0x40);
    /// Reserved id. No built-in engine; applications register their own.
    pub const KYBER512: KemId = KemId(0x41);

    #[inline]
    pub fn in_range(self) -> bool {
        self.0 >= 0x40 && self.0 <= 0x7f
    }
}

/// Signature scheme identifier, range 0x80-0xBF. Reserved for applications.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SigId(pub u8);

impl SigId {
    #[inline]
    pub fn in_range(self) -> bool {
        self.0 >= 0x80 && self.0 <= 0xbf
    }
}

/// A negotiated symmetric key. The length is fixed by the handshake's
/// `block_key_size`; the built-in cipher requires `KEY_SIZE` bytes.
#[derive(Clone, Eq, PartialEq)]
pub struct SessionKey(Vec<u8>);

impl SessionKey {
    #[inline]
    pub fn new(bytes: Vec<u8>) -> SessionKey {
        SessionKey(bytes)
    }

    #[inline]
    pub fn from_slice(bytes: &[u8]) -> SessionKey {
        SessionKey(bytes.to_vec())
    }
}

impl Deref for SessionKey {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "SessionKey({} bytes)", self.0.len())
    }
}

/// Fills the supplied buffer with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(buf: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(buf.as_mut_ptr() as *mut _, buf.len());
    }
}

#[inline]
pub fn random_u32() -> u32 {
    let mut bytes = [0u8; 4];
    random_bytes(&mut bytes);
    u32::from_le_bytes(bytes)
}

#[inline]
pub fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    random_bytes(&mut bytes);
    u64::from_le_bytes(bytes)
}

/// Encrypts the plain text into the cipher buffer using chacha20poly1305-ietf.
/// The cipher slice must be exactly the plain length plus `MAC_SIZE`.
#[inline]
fn aead_encrypt(
    cipher: &mut [u8],
    plain: &[u8],
    additional_data: &[u8],
    nonce: &[u8; NONCE_SIZE],
    key: &[u8],
) -> bool {
    if cipher.len() != plain.len() + MAC_SIZE || key.len() != KEY_SIZE {
        return false;
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt(
            cipher.as_mut_ptr(),
            ::std::ptr::null_mut(),
            plain.as_ptr(),
            plain.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            ::std::ptr::null(),
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Decrypts the ciphertext into the plain buffer. The plain slice must be
/// exactly the cipher length minus `MAC_SIZE`.
#[inline]
fn aead_decrypt(
    plain: &mut [u8],
    cipher: &[u8],
    additional_data: &[u8],
    nonce: &[u8; NONCE_SIZE],
    key: &[u8],
) -> bool {
    if cipher.len() < MAC_SIZE || plain.len() != cipher.len() - MAC_SIZE || key.len() != KEY_SIZE {
        return false;
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt(
            plain.as_mut_ptr(),
            ::std::ptr::null_mut(),
            ::std::ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Seals the plain text with a fresh random nonce. The output layout is
/// `nonce || ciphertext+mac`, expanding the input by `SEAL_OVERHEAD` bytes.
pub fn seal(plain: &[u8], additional_data: &[u8], key: &[u8]) -> Option<Vec<u8>> {
    let mut nonce = [0u8; NONCE_SIZE];
    random_bytes(&mut nonce);

    let mut out = vec![0u8; NONCE_SIZE + plain.len() + MAC_SIZE];
    out[..NONCE_SIZE].copy_from_slice(&nonce);

    match aead_encrypt(&mut out[NONCE_SIZE..], plain, additional_data, &nonce, key) {
        true => Some(out),
        false => None,
    }
}

/// Opens a buffer produced by `seal`. Returns the plain text, or None on a
/// truncated buffer, a wrong key or a failed authentication tag.
pub fn open(sealed: &[u8], additional_data: &[u8], key: &[u8]) -> Option<Vec<u8>> {
    if sealed.len() < SEAL_OVERHEAD {
        return None;
    }

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&sealed[..NONCE_SIZE]);

    let cipher = &sealed[NONCE_SIZE..];
    let mut plain = vec![0u8; cipher.len() - MAC_SIZE];

    match aead_decrypt(&mut plain, cipher, additional_data, &nonce, key) {
        true => Some(plain),
        false => None,
    }
}

/// Returns true if the supplied cipher id has a built-in implementation.
#[inline]
pub fn cipher_supported(id: CipherId) -> bool {
    id == CipherId::CHACHA20_POLY1305
}

/// A key-exchange keypair. The secret half never leaves the process.
pub struct KemKeypair {
    pub public: Vec<u8>,
    secret: Vec<u8>,
}

/// Key-exchange engine interface. `encapsulate` runs on the responder against
/// the initiator's public key and yields the ciphertext to transmit plus the
/// derived key; `decapsulate` runs on the initiator against that ciphertext
/// and yields the same key.
pub trait KeyExchange: Send + Sync {
    fn id(&self) -> KemId;

    /// Size of public keys produced by `keypair`.
    fn public_key_size(&self) -> usize;

    fn keypair(&self) -> KemKeypair;

    fn encapsulate(&self, peer_public: &[u8], key_size: usize) -> Option<(Vec<u8>, SessionKey)>;

    fn decapsulate(&self, keypair: &KemKeypair, ciphertext: &[u8], key_size: usize) -> Option<SessionKey>;
}

/// Diffie-Hellman KEM over X25519: the encapsulation ciphertext is an
/// ephemeral public key and the shared key is derived by hashing the raw
/// scalarmult output together with both transmitted public keys.
struct DhKem;

impl DhKem {
    #[inline]
    fn scalarmult(secret: &[u8], public: &[u8]) -> Option<[u8; DH_PUBLIC_KEY_SIZE]> {
        let mut shared = [0u8; DH_PUBLIC_KEY_SIZE];

        let result = unsafe {
            libsodium_sys::crypto_scalarmult(shared.as_mut_ptr(), secret.as_ptr(), public.as_ptr())
        };

        match result {
            0 => Some(shared),
            _ => None,
        }
    }

    #[inline]
    fn derive(
        shared: &[u8],
        initiator_public: &[u8],
        responder_public: &[u8],
        key_size: usize,
    ) -> Option<SessionKey> {
        if key_size < DERIVED_KEY_MIN || key_size > DERIVED_KEY_MAX {
            return None;
        }

        let mut input = Vec::with_capacity(shared.len() + initiator_public.len() + responder_public.len());
        input.extend_from_slice(shared);
        input.extend_from_slice(initiator_public);
        input.extend_from_slice(responder_public);

        let mut out = vec![0u8; key_size];

        let result = unsafe {
            libsodium_sys::crypto_generichash(
                out.as_mut_ptr(),
                out.len(),
                input.as_ptr(),
                input.len() as u64,
                ::std::ptr::null(),
                0,
            )
        };

        match result {
            0 => Some(SessionKey::new(out)),
            _ => None,
        }
    }
}

impl KeyExchange for DhKem {
    #[inline]
    fn id(&self) -> KemId {
        KemId::CURVE25519
    }

    #[inline]
    fn public_key_size(&self) -> usize {
        DH_PUBLIC_KEY_SIZE
    }

    fn keypair(&self) -> KemKeypair {
        let mut secret = vec![0u8; DH_SECRET_KEY_SIZE];
        random_bytes(&mut secret);

        let mut public = vec![0u8; DH_PUBLIC_KEY_SIZE];
        unsafe {
            libsodium_sys::crypto_scalarmult_base(public.as_mut_ptr(), secret.as_ptr());
        }

        KemKeypair { public, secret }
    }

    fn encapsulate(&self, peer_public: &[u8], key_size: usize) -> Option<(Vec<u8>, SessionKey)> {
        if peer_public.len() != DH_PUBLIC_KEY_SIZE {
            return None;
        }

        let ephemeral = self.keypair();
        let shared = Self::scalarmult(&ephemeral.secret, peer_public)?;
        let key = Self::derive(&shared, peer_public, &ephemeral.public, key_size)?;

        Some((ephemeral.public, key))
    }

    fn decapsulate(&self, keypair: &KemKeypair, ciphertext: &[u8], key_size: usize) -> Option<SessionKey> {
        if ciphertext.len() != DH_PUBLIC_KEY_SIZE {
            return None;
        }

        let shared = Self::scalarmult(&keypair.secret, ciphertext)?;
        Self::derive(&shared, &keypair.public, ciphertext, key_size)
    }
}

lazy_static! {
    static ref KEM_ENGINES: RwLock<HashMap<u8, Arc<dyn KeyExchange>>> = {
        let mut engines: HashMap<u8, Arc<dyn KeyExchange>> = HashMap::new();
        engines.insert(KemId::CURVE25519.0, Arc::new(DhKem));
        RwLock::new(engines)
    };
}

/// Registers an additional key-exchange engine. Returns false if the id is
/// outside the KEM range or already taken; the first registration remains.
pub fn kem_register(engine: Arc<dyn KeyExchange>) -> bool {
    let id = engine.id();

    if !id.in_range() {
        return false;
    }

    let mut engines = KEM_ENGINES.write().expect("KEM registry poisoned");

    match engines.contains_key(&id.0) {
        true => false,
        false => {
            engines.insert(id.0, engine);
            true
        }
    }
}

/// Looks up the key-exchange engine registered for the supplied id.
pub fn kem_find(id: KemId) -> Option<Arc<dyn KeyExchange>> {
    KEM_ENGINES
        .read()
        .expect("KEM registry poisoned")
        .get(&id.0)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let mut key = vec![0u8; KEY_SIZE];
        random_bytes(&mut key);

        let plain = b"attack at dawn";
        let sealed = seal(plain, b"ad", &key).unwrap();

        assert_eq!(sealed.len(), plain.len() + SEAL_OVERHEAD);
        assert_eq!(open(&sealed, b"ad", &key).unwrap(), plain);
    }

    #[test]
    fn open_rejects_tampering() {
        let mut key = vec![0u8; KEY_SIZE];
        random_bytes(&mut key);

        let mut sealed = seal(b"payload", b"", &key).unwrap();
        sealed[NONCE_SIZE + 2] ^= 0x40;

        assert!(open(&sealed, b"", &key).is_none());
    }

    #[test]
    fn open_rejects_wrong_additional_data() {
        let mut key = vec![0u8; KEY_SIZE];
        random_bytes(&mut key);

        let sealed = seal(b"payload", b"left", &key).unwrap();
        assert!(open(&sealed, b"right", &key).is_none());
    }

    #[test]
    fn open_rejects_truncated() {
        let key = vec![1u8; KEY_SIZE];
        assert!(open(&[0u8; SEAL_OVERHEAD - 1], b"", &key).is_none());
    }

    #[test]
    fn kem_both_sides_agree() {
        let kem = kem_find(KemId::CURVE25519).unwrap();

        let initiator = kem.keypair();
        let (ciphertext, responder_key) = kem.encapsulate(&initiator.public, KEY_SIZE).unwrap();
        let initiator_key = kem.decapsulate(&initiator, &ciphertext, KEY_SIZE).unwrap();

        assert_eq!(*responder_key, *initiator_key);
        assert_eq!(responder_key.len(), KEY_SIZE);
    }

    #[test]
    fn kem_derived_keys_differ_per_exchange() {
        let kem = kem_find(KemId::CURVE25519).unwrap();
        let initiator = kem.keypair();

        let (_, first) = kem.encapsulate(&initiator.public, KEY_SIZE).unwrap();
        let (_, second) = kem.encapsulate(&initiator.public, KEY_SIZE).unwrap();

        assert_ne!(*first, *second);
    }

    #[test]
    fn kem_rejects_bad_key_size() {
        let kem = kem_find(KemId::CURVE25519).unwrap();
        let initiator = kem.keypair();

        assert!(kem.encapsulate(&initiator.public, 8).is_none());
        assert!(kem.encapsulate(&initiator.public, 1024).is_none());
    }

    #[test]
    fn unknown_kem_absent() {
        assert!(kem_find(KemId::KYBER512).is_none());
    }

    struct FakeKem;

    impl KeyExchange for FakeKem {
        fn id(&self) -> KemId {
            KemId::CURVE25519
        }

        fn public_key_size(&self) -> usize {
            0
        }

        fn keypair(&self) -> KemKeypair {
            KemKeypair {
                public: Vec::new(),
                secret: Vec::new(),
            }
        }

        fn encapsulate(&self, _: &[u8], _: usize) -> Option<(Vec<u8>, SessionKey)> {
            None
        }

        fn decapsulate(&self, _: &KemKeypair, _: &[u8], _: usize) -> Option<SessionKey> {
            None
        }
    }

    #[test]
    fn register_rejects_duplicate_id() {
        assert!(!kem_register(Arc::new(FakeKem)));
    }
}
