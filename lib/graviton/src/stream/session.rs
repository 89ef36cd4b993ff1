//! The process-wide table of active stream sessions. A session holds the
//! negotiated key and channel set and may outlive the descriptor that created
//! it, so a reconnecting peer can adopt it within the eviction timeout.

use hashbrown::HashMap;
use lazy_static::lazy_static;
use plasma::crypto::{CipherId, SessionKey};
use plasma::time::timestamp_secs;
use std::sync::{Arc, Mutex, RwLock};

struct SessionShared {
    key: SessionKey,
    last_active: u64,
    channels: Vec<u8>,
    active: bool,
    bound: bool,
}

/// One negotiated session: encryption key, cipher id and enumerated channels.
/// The key is replaced when a reconnecting peer adopts the session with a
/// fresh handshake.
pub struct Session {
    pub id: u32,
    pub cipher: CipherId,
    pub create_time: u64,
    shared: Mutex<SessionShared>,
}

impl Session {
    fn new(id: u32, cipher: CipherId, key: SessionKey, channels: Vec<u8>) -> Session {
        let now = timestamp_secs();

        Session {
            id,
            cipher,
            create_time: now,
            shared: Mutex::new(SessionShared {
                key,
                last_active: now,
                channels,
                active: false,
                bound: false,
            }),
        }
    }

    /// Builds a client-local mirror of a session negotiated with a server.
    /// Never inserted into the process-wide table.
    pub fn detached(id: u32, cipher: CipherId, key: SessionKey, channels: Vec<u8>) -> Arc<Session> {
        Arc::new(Session::new(id, cipher, key, channels))
    }

    fn shared(&self) -> std::sync::MutexGuard<SessionShared> {
        self.shared.lock().expect("Session state poisoned")
    }

    /// Refreshes the activity timestamp.
    #[inline]
    pub fn touch(&self) {
        self.shared().last_active = timestamp_secs();
    }

    #[inline]
    pub fn key(&self) -> SessionKey {
        self.shared().key.clone()
    }

    /// Installs the key negotiated by a fresh handshake adopting this session.
    pub fn set_key(&self, key: SessionKey) {
        self.shared().key = key;
    }

    #[inline]
    pub fn last_active(&self) -> u64 {
        self.shared().last_active
    }

    /// Marks the session as served by a descriptor. Fails if another
    /// descriptor already holds it.
    pub fn bind(&self) -> bool {
        let mut shared = self.shared();

        match shared.bound {
            true => false,
            false => {
                shared.bound = true;
                shared.active = true;
                shared.last_active = timestamp_secs();
                true
            }
        }
    }

    /// Detaches the session from its descriptor, leaving it adoptable until
    /// the eviction timeout.
    pub fn unbind(&self) {
        let mut shared = self.shared();
        shared.bound = false;
        shared.active = false;
        shared.last_active = timestamp_secs();
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.shared().bound
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.shared().active
    }

    #[inline]
    pub fn channels(&self) -> Vec<u8> {
        self.shared().channels.clone()
    }

    pub fn set_channels(&self, channels: Vec<u8>) {
        self.shared().channels = channels;
    }

    /// A session expires when detached and idle past the timeout. A bound
    /// session is never eligible, no matter how idle.
    pub fn expired(&self, now: u64, timeout_sec: u64) -> bool {
        let shared = self.shared();
        !shared.bound && now.saturating_sub(shared.last_active) > timeout_sec
    }
}

lazy_static! {
    static ref SESSIONS: RwLock<HashMap<u32, Arc<Session>>> = RwLock::new(HashMap::new());
}

/// Opens a fresh session with a process-unique nonzero id and stores it.
pub fn open(cipher: CipherId, key: SessionKey, channels: Vec<u8>) -> Arc<Session> {
    let mut sessions = SESSIONS.write().expect("Session store poisoned");

    let id = loop {
        let candidate = plasma::crypto::random_u32();

        if candidate != 0 && !sessions.contains_key(&candidate) {
            break candidate;
        }
    };

    let session = Arc::new(Session::new(id, cipher, key, channels));
    sessions.insert(id, session.clone());
    session
}

/// Returns the session if present and not expired.
pub fn find(id: u32, timeout_sec: u64) -> Option<Arc<Session>> {
    let sessions = SESSIONS.read().expect("Session store poisoned");
    let session = sessions.get(&id)?;

    match session.expired(timestamp_secs(), timeout_sec) {
        true => None,
        false => Some(session.clone()),
    }
}

/// Closes and removes a session. Calling it again for the same id is a no-op.
pub fn close(id: u32) -> bool {
    SESSIONS
        .write()
        .expect("Session store poisoned")
        .remove(&id)
        .is_some()
}

/// Evicts every expired detached session. Returns the eviction count.
pub fn sweep(timeout_sec: u64) -> usize {
    let mut sessions = SESSIONS.write().expect("Session store poisoned");
    let now = timestamp_secs();
    let before = sessions.len();

    sessions.retain(|_, session| !session.expired(now, timeout_sec));

    before - sessions.len()
}

pub fn count() -> usize {
    SESSIONS.read().expect("Session store poisoned").len()
}
