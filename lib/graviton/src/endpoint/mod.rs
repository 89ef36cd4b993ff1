//! Server and client endpoints built on the reactor and stream layers.

pub mod client;
pub mod server;

pub use self::client::{Client, ClientEvents, ClientOptions, ClientPhase, NullEvents, SharedNotifier};
pub use self::server::{AcceptHook, Server, ServerOptions};
