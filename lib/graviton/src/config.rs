use crate::support::{ErrorType, NetworkError, NetworkResult};
use serde_derive::Deserialize;
use std::thread;

/// Runtime options for the core, consumed from an external configuration
/// loader (any serde backend). Unknown ciphers, transports and obfuscation
/// engines referenced here fail at init, never at runtime.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Number of worker contexts. Default: CPU count.
    pub thread_count: usize,
    /// Descriptor aging timeout in seconds.
    pub conn_timeout_sec: u64,
    /// Detached-session eviction threshold in seconds.
    pub session_timeout_sec: u64,
    /// Upper bound on the decrypted body of one stream packet.
    pub max_fragment_size: usize,
    /// Endpoints to listen on, `host:port` syntax.
    pub listen: Vec<String>,
    /// Transports to register at startup.
    pub transports: Vec<String>,
    /// Obfuscation engine attached to every transport that supports it.
    pub obfuscation: Option<String>,
    /// First reconnect delay for clients.
    pub backoff_initial_ms: u64,
    /// Reconnect delay ceiling.
    pub backoff_max_ms: u64,
    /// Reconnect attempts before giving up. Zero means never give up.
    pub backoff_max_attempts: u32,
    /// Keepalive emission interval on idle streams.
    pub keepalive_interval_sec: u64,
    /// Hard cap on the fragment reassembly buffer.
    pub reassembly_max_bytes: usize,
    /// Decryption failures tolerated within the rolling window before the
    /// stream is torn down.
    pub crypto_error_threshold: u32,
    /// Maximum inter-thread messages drained per queue readiness event.
    pub queue_drain_max: usize,
}

impl Default for CoreConfig {
    fn default() -> CoreConfig {
        CoreConfig {
            thread_count: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            conn_timeout_sec: 60,
            session_timeout_sec: 900,
            max_fragment_size: 65536,
            listen: Vec::new(),
            transports: vec!["tcp".to_string()],
            obfuscation: None,
            backoff_initial_ms: 250,
            backoff_max_ms: 15000,
            backoff_max_attempts: 0,
            keepalive_interval_sec: 3,
            reassembly_max_bytes: 16 * 1024 * 1024,
            crypto_error_threshold: 8,
            queue_drain_max: 64,
        }
    }
}

impl CoreConfig {
    /// Egress buffer cap for stream descriptors: sized so the wire bytes of
    /// the largest reassemblable payload always fit, rounded to page size.
    pub fn stream_egress_cap(&self) -> usize {
        let raw = self.reassembly_max_bytes.saturating_mul(2).max(4 * 1024 * 1024);
        (raw + 4095) / 4096 * 4096
    }

    pub fn validate(&self) -> NetworkResult<()> {
        let fragment_floor = plasma::crypto::SEAL_OVERHEAD + crate::stream::pkt::CH_HDR_SIZE + 1;

        let valid = self.thread_count > 0
            && self.conn_timeout_sec > 0
            && self.session_timeout_sec > 0
            && self.max_fragment_size > fragment_floor
            && self.backoff_initial_ms > 0
            && self.backoff_max_ms >= self.backoff_initial_ms
            && self.keepalive_interval_sec > 0
            && self.reassembly_max_bytes >= self.max_fragment_size
            && self.queue_drain_max > 0;

        match valid {
            true => Ok(()),
            false => Err(NetworkError::Fatal(ErrorType::Config)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_threads_rejected() {
        let mut config = CoreConfig::default();
        config.thread_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn tiny_fragment_size_rejected() {
        let mut config = CoreConfig::default();
        config.max_fragment_size = plasma::crypto::SEAL_OVERHEAD;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_json() {
        let config: CoreConfig = serde_json::from_str(
            r#"{
                "thread_count": 4,
                "listen": ["127.0.0.1:65010"],
                "transports": ["tcp", "udp"],
                "obfuscation": "identity"
            }"#,
        )
        .unwrap();

        assert_eq!(config.thread_count, 4);
        assert_eq!(config.listen, vec!["127.0.0.1:65010"]);
        assert_eq!(config.obfuscation.as_deref(), Some("identity"));
        // Unspecified options keep their defaults.
        assert_eq!(config.conn_timeout_sec, 60);
        assert!(config.validate().is_ok());
    }
}
