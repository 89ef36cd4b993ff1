use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::sync::{Arc, RwLock};

/// A byte-stream rewrite applied above a transport's write and below its
/// read, making the wire bytes resemble benign traffic. The transform may
/// change the byte count in either direction; callers treat returned sizes as
/// opaque.
pub trait ObfuscationEngine: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, plain: &[u8]) -> Vec<u8>;

    /// Returns None when the obfuscated bytes cannot be reversed.
    fn remove(&self, obfuscated: &[u8]) -> Option<Vec<u8>>;
}

/// The engine whose apply and remove are both the identity function.
pub struct IdentityObfuscation;

impl ObfuscationEngine for IdentityObfuscation {
    fn name(&self) -> &str {
        "identity"
    }

    fn apply(&self, plain: &[u8]) -> Vec<u8> {
        plain.to_vec()
    }

    fn remove(&self, obfuscated: &[u8]) -> Option<Vec<u8>> {
        Some(obfuscated.to_vec())
    }
}

lazy_static! {
    static ref ENGINES: RwLock<HashMap<String, Arc<dyn ObfuscationEngine>>> = {
        let mut engines: HashMap<String, Arc<dyn ObfuscationEngine>> = HashMap::new();
        engines.insert("identity".to_string(), Arc::new(IdentityObfuscation));
        RwLock::new(engines)
    };
}

/// Registers an engine under its name. The first registration wins.
pub fn register(engine: Arc<dyn ObfuscationEngine>) -> bool {
    let mut engines = ENGINES.write().expect("Obfuscation registry poisoned");
    let name = engine.name().to_string();

    match engines.contains_key(&name) {
        true => false,
        false => {
            engines.insert(name, engine);
            true
        }
    }
}

pub fn find(name: &str) -> Option<Arc<dyn ObfuscationEngine>> {
    ENGINES
        .read()
        .expect("Obfuscation registry poisoned")
        .get(name)
        .cloned()
}
