//! The networking core of the platform: a multi-threaded reactor over poll
//! primitives, a framed and encrypted stream layer multiplexing logical
//! channels, a pluggable transport registry and the handshake protocol that
//! establishes stream sessions.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod addr;
pub mod config;
pub mod endpoint;
pub mod reactor;
pub mod stream;
pub mod support;

use crate::config::CoreConfig;
use crate::reactor::Reactor;
use crate::support::NetworkResult;
use plasma::logging::Logger;
use std::time::Duration;

/// Boots the core from a loaded configuration: registers the configured
/// transports, attaches the configured obfuscation engine, starts the worker
/// contexts and schedules the session eviction sweep. Servers and clients are
/// created by the application on top of the returned reactor.
pub fn init(config: CoreConfig, log: Logger) -> NetworkResult<Reactor> {
    config.validate()?;

    stream::transport::register_defaults(&config.transports, &log)?;

    if let Some(name) = &config.obfuscation {
        stream::transport::attach_obfuscation_by_name(name)?;
    }

    let reactor = Reactor::start(config.clone(), log)?;

    // Periodic eviction of expired detached sessions, owned by worker 0.
    let session_timeout = config.session_timeout_sec;
    reactor.exec_on(0, move |ctx| {
        ctx.start_timer(Duration::from_secs(10), move |_| {
            stream::session::sweep(session_timeout);
            true
        });
    })?;

    Ok(reactor)
}
