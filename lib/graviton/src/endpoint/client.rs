//! The client endpoint: a reconnecting outgoing byte stream that drives the
//! handshake and transitions into streaming, backing off exponentially on
//! every failure.

use crate::addr::NodeAddr;
use crate::config::CoreConfig;
use crate::reactor::context::Context;
use crate::reactor::descriptor::{
    Descriptor, DescriptorId, DescriptorIo, DescriptorKind, EventHandler, DEFAULT_INGRESS_CAP,
};
use crate::reactor::worker::{Reactor, WorkerLink};
use crate::stream::channel;
use crate::stream::handshake::{self, ClientAction, ClientHandshake};
use crate::stream::session::Session;
use crate::stream::{transport, Stream, StreamHandler};
use crate::support::{ErrorType, NetworkError, NetworkResult};
use plasma::crypto::{CipherId, KemId};
use plasma::logging::{self, Logger};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// User callbacks fired on client lifecycle transitions. Invoked on the
/// owning worker's thread; implementations must not block.
pub trait ClientEvents: Send + Sync {
    /// The stream reached `Streaming`; fired exactly once per connect cycle.
    fn on_streaming(&self, _session_id: u32) {}

    /// A handshake or connection error. Remote failures carry the peer's
    /// DSHP error code; local failures use code 0.
    fn on_error(&self, _code: u32, _message: &str) {}

    fn on_disconnected(&self) {}
}

pub struct NullEvents;
impl ClientEvents for NullEvents {}

/// Notifier shared between reconnect cycles; reinstalled on every new stream.
pub type SharedNotifier = Arc<dyn Fn(u8, u8, &[u8]) + Send + Sync>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientPhase {
    Disconnected,
    Connecting,
    Authenticating,
    SessionCreate,
    Streaming,
}

pub struct ClientOptions {
    pub addr: String,
    pub channels: Vec<u8>,
    pub cipher: CipherId,
    pub kem: KemId,
    pub local_node: NodeAddr,
    /// Expected peer identity; learned from the stream when absent.
    pub pinned_node: Option<NodeAddr>,
    /// Present the previous session id on reconnect so the server can adopt
    /// the detached session.
    pub reattach: bool,
    pub transport: u8,
    pub events: Arc<dyn ClientEvents>,
    /// In-notifiers installed on every stream this client establishes.
    pub notifiers: Vec<(u8, SharedNotifier)>,
}

impl ClientOptions {
    pub fn new<S: Into<String>>(addr: S, channels: &[u8]) -> ClientOptions {
        ClientOptions {
            addr: addr.into(),
            channels: channels.to_vec(),
            cipher: CipherId::CHACHA20_POLY1305,
            kem: KemId::CURVE25519,
            local_node: NodeAddr::random(),
            pinned_node: None,
            reattach: false,
            transport: transport::tag::TCP,
            events: Arc::new(NullEvents),
            notifiers: Vec::new(),
        }
    }
}

struct ClientState {
    phase: ClientPhase,
    desc: Option<DescriptorId>,
    backoff_ms: u64,
    attempts: u32,
    session_id: Option<u32>,
    stopped: bool,
}

struct ClientInner {
    options: ClientOptions,
    config: Arc<CoreConfig>,
    worker: WorkerLink,
    state: Mutex<ClientState>,
    notifiers: Mutex<Vec<(u8, SharedNotifier)>>,
    log: Logger,
}

impl ClientInner {
    fn state(&self) -> MutexGuard<ClientState> {
        self.state.lock().expect("Client state poisoned")
    }

    fn connect_in_ctx(inner: Arc<ClientInner>, ctx: &mut Context) {
        if inner.state().stopped {
            return;
        }

        let addr: SocketAddr = match inner.options.addr.parse() {
            Ok(addr) => addr,
            Err(_) => {
                inner.options.events.on_error(0, "invalid target address");
                return;
            }
        };

        let transport_ops = match transport::find(inner.options.transport) {
            Some(ops) => ops,
            None => {
                inner.options.events.on_error(0, "transport not registered");
                return;
            }
        };

        logging::debug!(inner.log, "connecting"; "address" => inner.options.addr.as_str());

        let io = match transport_ops.connect(&addr) {
            Ok(io) => io,
            Err(_) => {
                ClientInner::schedule_reconnect(inner.clone(), ctx);
                return;
            }
        };

        let handler = ClientHandler {
            inner: inner.clone(),
            hs: None,
            stream: None,
            started: Instant::now(),
        };

        let d = match io {
            DescriptorIo::Tcp(socket) => Descriptor::tcp_outgoing(
                socket,
                inner.options.addr.clone(),
                Box::new(handler),
                DEFAULT_INGRESS_CAP,
                inner.config.stream_egress_cap(),
                &inner.log,
            ),
            DescriptorIo::Udp(socket) => Descriptor::udp(
                socket,
                inner.options.addr.clone(),
                Box::new(handler),
                DEFAULT_INGRESS_CAP,
                inner.config.stream_egress_cap(),
                &inner.log,
            ),
            _ => {
                inner.options.events.on_error(0, "transport yielded no stream handle");
                return;
            }
        };

        {
            let mut state = inner.state();
            state.phase = ClientPhase::Connecting;
            state.desc = Some(d.id());
        }

        if ctx.add(d).is_err() {
            ClientInner::schedule_reconnect(inner, ctx);
        }
    }

    /// Arms the reconnect timer with the current backoff, doubling it up to
    /// the ceiling.
    fn schedule_reconnect(inner: Arc<ClientInner>, ctx: &mut Context) {
        let delay = {
            let mut state = inner.state();

            if state.stopped {
                return;
            }

            state.phase = ClientPhase::Disconnected;
            state.desc = None;
            state.attempts += 1;

            let max_attempts = inner.config.backoff_max_attempts;

            if max_attempts > 0 && state.attempts > max_attempts {
                drop(state);
                inner.options.events.on_error(0, "reconnect backoff exhausted");
                return;
            }

            let delay = state.backoff_ms;
            state.backoff_ms = (state.backoff_ms * 2).min(inner.config.backoff_max_ms);
            delay
        };

        logging::debug!(inner.log, "reconnect scheduled"; "delay_ms" => delay);

        let task = inner.clone();
        ctx.start_timer(Duration::from_millis(delay), move |ctx| {
            ClientInner::connect_in_ctx(task.clone(), ctx);
            false
        });
    }
}

/// A reconnecting outgoing endpoint. Cheap to clone; all state lives on the
/// owning worker or behind the shared handle.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Picks the least-loaded worker, pins the client to it and starts the
    /// first connect attempt.
    pub fn connect(reactor: &Reactor, mut options: ClientOptions, log: &Logger) -> NetworkResult<Client> {
        let worker = reactor.least_loaded().clone();
        let notifiers = std::mem::replace(&mut options.notifiers, Vec::new());

        let inner = Arc::new(ClientInner {
            log: log.new(logging::o!("component" => "client", "target" => options.addr.clone())),
            config: reactor.config().clone(),
            state: Mutex::new(ClientState {
                phase: ClientPhase::Disconnected,
                desc: None,
                backoff_ms: reactor.config().backoff_initial_ms,
                attempts: 0,
                session_id: None,
                stopped: false,
            }),
            notifiers: Mutex::new(notifiers),
            worker: worker.clone(),
            options,
        });

        let task = inner.clone();
        worker.exec(move |ctx| ClientInner::connect_in_ctx(task, ctx))?;

        Ok(Client { inner })
    }

    /// Registers an in-notifier for a channel. Applies to the current stream
    /// and every stream created by later reconnects.
    pub fn add_in_notifier(&self, ch: u8, notifier: SharedNotifier) {
        self.inner
            .notifiers
            .lock()
            .expect("Client notifier registry poisoned")
            .push((ch, notifier));
    }

    #[inline]
    pub fn phase(&self) -> ClientPhase {
        self.inner.state().phase
    }

    #[inline]
    pub fn session_id(&self) -> Option<u32> {
        self.inner.state().session_id
    }

    /// The worker this client is pinned to.
    #[inline]
    pub fn worker(&self) -> &WorkerLink {
        &self.inner.worker
    }

    /// The stream descriptor, once streaming.
    pub fn descriptor(&self) -> Option<DescriptorId> {
        let state = self.inner.state();

        match state.phase {
            ClientPhase::Streaming => state.desc,
            _ => None,
        }
    }

    /// Sends one channel packet from any thread. The write happens on the
    /// owning worker.
    pub fn send(&self, ch: u8, pkt_type: u8, data: Vec<u8>) -> NetworkResult<()> {
        let desc = {
            let state = self.inner.state();

            match (state.phase, state.desc) {
                (ClientPhase::Streaming, Some(desc)) => desc,
                _ => return Err(NetworkError::Fatal(ErrorType::InvalidState)),
            }
        };

        channel::send_mt(&self.inner.worker, desc, ch, pkt_type, data)
    }

    /// Stops reconnecting and closes the live descriptor, if any.
    pub fn close(&self) {
        let desc = {
            let mut state = self.inner.state();
            state.stopped = true;
            state.desc.take()
        };

        if let Some(id) = desc {
            drop(self.inner.worker.exec(move |ctx| {
                ctx.delete(id, false);
            }));
        }
    }
}

/// Callback table of the client descriptor across its whole life:
/// handshaking first, then delegating to the inner stream handler.
struct ClientHandler {
    inner: Arc<ClientInner>,
    hs: Option<ClientHandshake>,
    stream: Option<StreamHandler>,
    started: Instant,
}

impl ClientHandler {
    fn begin_handshake(&mut self, d: &mut Descriptor) {
        let reattach = {
            let state = self.inner.state();

            match self.inner.options.reattach {
                true => state.session_id,
                false => None,
            }
        };

        let hs = match ClientHandshake::new(
            self.inner.options.cipher,
            self.inner.options.kem,
            &self.inner.options.channels,
            reattach,
        ) {
            Ok(hs) => hs,
            Err(e) => {
                logging::error!(d.log, "handshake setup failed"; "error" => ?e);
                self.inner.options.events.on_error(0, "handshake setup failed");
                d.close();
                return;
            }
        };

        let request = hs.request();

        if !d.write_egress(&request) {
            d.close();
            return;
        }

        drop(d.flush());
        self.hs = Some(hs);
        self.started = Instant::now();
        self.inner.state().phase = ClientPhase::Authenticating;
    }

    fn establish(
        &mut self,
        d: &mut Descriptor,
        ctx: &mut Context,
        session_id: u32,
        key: plasma::crypto::SessionKey,
        channels: Vec<u8>,
    ) {
        let session = Session::detached(session_id, self.inner.options.cipher, key, channels);
        session.bind();

        let peer = self.inner.options.pinned_node.unwrap_or(NodeAddr::BROADCAST);

        let mut stream = Stream::new(
            session,
            self.inner.options.local_node,
            peer,
            self.inner.options.transport,
            &d.log,
        );

        for (ch, notifier) in self
            .inner
            .notifiers
            .lock()
            .expect("Client notifier registry poisoned")
            .iter()
        {
            let shared = notifier.clone();
            stream.add_in_notifier(*ch, Box::new(move |id, pkt_type, data| (*shared)(id, pkt_type, data)));
        }

        self.stream = Some(StreamHandler::new(stream, self.inner.config.clone()));
        self.hs = None;

        {
            let mut state = self.inner.state();
            state.phase = ClientPhase::Streaming;
            state.session_id = Some(session_id);
            state.backoff_ms = self.inner.config.backoff_initial_ms;
            state.attempts = 0;
        }

        logging::info!(d.log, "streaming"; "session_id" => session_id);
        self.inner.options.events.on_streaming(session_id);

        // Stream packets may already trail the handshake reply.
        if !d.ingress.is_empty() {
            if let Some(stream) = self.stream.as_mut() {
                stream.on_read(d, ctx);
            }
        }
    }
}

impl EventHandler for ClientHandler {
    fn on_new(&mut self, d: &mut Descriptor, _ctx: &mut Context) {
        // Datagram handles have no connect completion event.
        if d.kind() == DescriptorKind::Udp {
            self.begin_handshake(d);
        }
    }

    fn on_connected(&mut self, d: &mut Descriptor, _ctx: &mut Context) {
        logging::debug!(d.log, "connected"; "address" => d.remote.as_str());
        self.begin_handshake(d);
    }

    fn on_read(&mut self, d: &mut Descriptor, ctx: &mut Context) {
        if let Some(stream) = self.stream.as_mut() {
            stream.on_read(d, ctx);
            return;
        }

        loop {
            let message = {
                let buf = d.ingress.read_slice();

                match handshake::read_message(buf) {
                    Ok(Some((consumed, body))) => Some((consumed, body.to_vec())),
                    Ok(None) => None,
                    Err(_) => {
                        logging::warn!(d.log, "malformed handshake frame");
                        d.close();
                        return;
                    }
                }
            };

            let (consumed, body) = match message {
                Some(message) => message,
                None => break,
            };

            d.ingress.move_head(consumed);

            let hs = match self.hs.as_mut() {
                Some(hs) => hs,
                None => {
                    d.close();
                    return;
                }
            };

            match hs.on_message(&body) {
                Ok(ClientAction::Send(bytes)) => {
                    if !d.write_egress(&bytes) {
                        d.close();
                        return;
                    }

                    drop(d.flush());
                    self.inner.state().phase = ClientPhase::SessionCreate;
                }
                Ok(ClientAction::Established {
                    session_id,
                    key,
                    channels,
                    ..
                }) => {
                    self.establish(d, ctx, session_id, key, channels);
                    return;
                }
                Ok(ClientAction::Failed { code, message }) => {
                    logging::warn!(d.log, "handshake rejected by server";
                                   "code" => code, "message" => message.as_str());
                    self.inner.options.events.on_error(code, &message);
                    d.close();
                    return;
                }
                Err(NetworkError::Wait) => (),
                Err(e) => {
                    logging::warn!(d.log, "handshake failure"; "error" => ?e);
                    d.close();
                    return;
                }
            }
        }
    }

    fn on_write(&mut self, d: &mut Descriptor, ctx: &mut Context) {
        if let Some(stream) = self.stream.as_mut() {
            stream.on_write(d, ctx);
        }
    }

    fn on_channel_send(&mut self, d: &mut Descriptor, ctx: &mut Context, ch: u8, pkt_type: u8, data: Vec<u8>) {
        match self.stream.as_mut() {
            Some(stream) => stream.on_channel_send(d, ctx, ch, pkt_type, data),
            None => {
                logging::warn!(d.log, "channel send before streaming dropped"; "channel" => ch as char);
            }
        }
    }

    fn on_tick(&mut self, d: &mut Descriptor, ctx: &mut Context) {
        match self.stream.as_mut() {
            Some(stream) => stream.on_tick(d, ctx),
            None => {
                if self.started.elapsed() > HANDSHAKE_TIMEOUT {
                    logging::warn!(d.log, "handshake stalled");
                    d.close();
                }
            }
        }
    }

    fn on_error(&mut self, d: &mut Descriptor, ctx: &mut Context, err: ErrorType) {
        logging::debug!(d.log, "client descriptor error"; "error" => %err);

        if let Some(stream) = self.stream.as_mut() {
            stream.on_error(d, ctx, err);
        }
    }

    fn on_delete(&mut self, d: &mut Descriptor, ctx: &mut Context) {
        let was_streaming = self.stream.is_some();

        if let Some(stream) = self.stream.as_mut() {
            stream.on_delete(d, ctx);
        }

        if was_streaming {
            self.inner.options.events.on_disconnected();
        }

        ClientInner::schedule_reconnect(self.inner.clone(), ctx);
    }
}
