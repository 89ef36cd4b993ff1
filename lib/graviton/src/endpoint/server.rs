//! The server endpoint: listening descriptors that accept incoming byte
//! streams, gate them through the handshake and hand established streams to
//! the least-loaded worker.

use crate::addr::NodeAddr;
use crate::config::CoreConfig;
use crate::reactor::context::Context;
use crate::reactor::descriptor::{Descriptor, DescriptorId, DescriptorIo, EventHandler, DEFAULT_INGRESS_CAP};
use crate::reactor::worker::Reactor;
use crate::stream::handshake::{self, AcceptAll, HandshakeAction, ServerHandshake, SignaturePolicy};
use crate::stream::{transport, Stream, StreamHandler};
use crate::support::{ErrorType, NetworkError, NetworkResult};
use plasma::logging::{self, Logger};
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

// A stalled handshake is a protocol error well before connection aging.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Inspection hook for freshly accepted descriptors; returning false rejects
/// the connection before worker placement.
pub type AcceptHook = Arc<dyn Fn(&Descriptor) -> bool + Send + Sync>;

pub struct ServerOptions {
    /// `host:port` endpoints to listen on.
    pub addrs: Vec<String>,
    pub transport: u8,
    pub local_node: NodeAddr,
    pub policy: Arc<dyn SignaturePolicy>,
    pub pre_worker_added: Option<AcceptHook>,
}

impl ServerOptions {
    pub fn new<S: Into<String>>(addrs: Vec<S>) -> ServerOptions {
        ServerOptions {
            addrs: addrs.into_iter().map(Into::into).collect(),
            transport: transport::tag::TCP,
            local_node: NodeAddr::random(),
            policy: Arc::new(AcceptAll),
            pre_worker_added: None,
        }
    }
}

struct Ready {
    attached: Mutex<usize>,
    cond: Condvar,
}

struct AcceptShared {
    config: Arc<CoreConfig>,
    policy: Arc<dyn SignaturePolicy>,
    local_node: NodeAddr,
    hook: Option<AcceptHook>,
    transport: u8,
    log: Logger,
}

/// A set of listening descriptors sharing one client-handler configuration.
pub struct Server {
    listeners: Vec<DescriptorId>,
    ready: Arc<Ready>,
    total: usize,
}

impl Server {
    /// Binds every listed address and attaches each listener to the least
    /// loaded worker. Streams later accepted by a listener are themselves
    /// placed by load, independently of the listener's worker.
    pub fn start(reactor: &Reactor, options: ServerOptions, log: &Logger) -> NetworkResult<Arc<Server>> {
        let transport_ops = transport::find(options.transport)
            .ok_or(NetworkError::Fatal(ErrorType::UnknownTransport))?;

        let log = log.new(logging::o!("component" => "server"));

        let shared = Arc::new(AcceptShared {
            config: reactor.config().clone(),
            policy: options.policy.clone(),
            local_node: options.local_node,
            hook: options.pre_worker_added.clone(),
            transport: options.transport,
            log: log.clone(),
        });

        let ready = Arc::new(Ready {
            attached: Mutex::new(0),
            cond: Condvar::new(),
        });

        let mut listeners = Vec::with_capacity(options.addrs.len());

        for addr_str in &options.addrs {
            let addr: SocketAddr = addr_str.parse()?;

            let listener = match transport_ops.listen(&addr)? {
                DescriptorIo::TcpListen(listener) => listener,
                // Datagram endpoints carry no connection queue; applications
                // attach their own handlers for those.
                _ => return Err(NetworkError::Fatal(ErrorType::Config)),
            };

            let acceptor = Acceptor { shared: shared.clone() };
            let d = Descriptor::tcp_listen(listener, Box::new(acceptor), &log);
            listeners.push(d.id());

            logging::info!(log, "listening"; "address" => addr_str.as_str());

            let ready = ready.clone();
            reactor.least_loaded().exec(move |ctx| match ctx.add(d) {
                Ok(_) => {
                    *ready.attached.lock().expect("Server ready state poisoned") += 1;
                    ready.cond.notify_all();
                }
                Err(e) => {
                    logging::error!(ctx.log(), "listener attach failed"; "error" => ?e);
                }
            })?;
        }

        let total = listeners.len();

        Ok(Arc::new(Server { listeners, ready, total }))
    }

    /// Blocks until every listener is attached to a worker with a live
    /// socket, or the deadline passes.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut attached = self.ready.attached.lock().expect("Server ready state poisoned");

        while *attached < self.total {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return false,
            };

            let (guard, result) = self
                .ready
                .cond
                .wait_timeout(attached, remaining)
                .expect("Server ready state poisoned");

            attached = guard;

            if result.timed_out() && *attached < self.total {
                return false;
            }
        }

        true
    }

    #[inline]
    pub fn listeners(&self) -> &[DescriptorId] {
        &self.listeners
    }
}

/// Listener callback table: accepts pending connections and places each new
/// descriptor, gated by the handshake, on the least-loaded worker.
struct Acceptor {
    shared: Arc<AcceptShared>,
}

impl EventHandler for Acceptor {
    fn on_read(&mut self, d: &mut Descriptor, ctx: &mut Context) {
        let transport_ops = match transport::find(self.shared.transport) {
            Some(ops) => ops,
            None => return,
        };

        loop {
            match transport_ops.accept(d) {
                Ok(Some((DescriptorIo::Tcp(socket), peer))) => {
                    let gate = SessionGate {
                        shared: self.shared.clone(),
                        hs: ServerHandshake::new(
                            self.shared.policy.clone(),
                            self.shared.config.session_timeout_sec,
                        ),
                        established: false,
                        started: Instant::now(),
                    };

                    let accepted = Descriptor::tcp_accepted(
                        socket,
                        peer.to_string(),
                        Box::new(gate),
                        DEFAULT_INGRESS_CAP,
                        self.shared.config.stream_egress_cap(),
                        &self.shared.log,
                    );

                    if let Some(hook) = &self.shared.hook {
                        if !hook(&accepted) {
                            logging::debug!(self.shared.log, "connection rejected by accept hook";
                                            "peer" => %peer);
                            continue;
                        }
                    }

                    logging::debug!(self.shared.log, "connection accepted"; "peer" => %peer);

                    let result = ctx.least_loaded_link().exec(move |ctx| {
                        if let Err(e) = ctx.add(accepted) {
                            logging::warn!(ctx.log(), "accepted descriptor attach failed"; "error" => ?e);
                        }
                    });

                    if result.is_err() {
                        break;
                    }
                }
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(NetworkError::Wait) => break,
                Err(e) => {
                    logging::warn!(self.shared.log, "accept failure"; "error" => ?e);
                    break;
                }
            }
        }
    }
}

/// Callback table of an accepted descriptor until its session is
/// established: drives the server half of the handshake, then swaps itself
/// for a stream handler.
struct SessionGate {
    shared: Arc<AcceptShared>,
    hs: ServerHandshake,
    established: bool,
    started: Instant,
}

impl EventHandler for SessionGate {
    fn on_read(&mut self, d: &mut Descriptor, ctx: &mut Context) {
        loop {
            let message = {
                let buf = d.ingress.read_slice();

                match handshake::read_message(buf) {
                    Ok(Some((consumed, body))) => Some((consumed, body.to_vec())),
                    Ok(None) => None,
                    Err(_) => {
                        logging::warn!(d.log, "malformed handshake frame"; "peer" => d.remote.as_str());
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

            match self.hs.on_message(&body) {
                HandshakeAction::Reply(reply) => {
                    if !d.write_egress(&reply) {
                        d.close();
                        return;
                    }

                    drop(d.flush());
                }
                HandshakeAction::Established { reply, session } => {
                    if !d.write_egress(&reply) {
                        d.close();
                        return;
                    }

                    drop(d.flush());

                    if !session.bind() {
                        logging::warn!(d.log, "session already bound to another descriptor";
                                       "session_id" => session.id);
                        d.close();
                        return;
                    }

                    self.established = true;

                    logging::info!(d.log, "session established";
                                   "session_id" => session.id,
                                   "peer" => d.remote.as_str());

                    let stream = Stream::new(
                        session,
                        self.shared.local_node,
                        NodeAddr::BROADCAST,
                        self.shared.transport,
                        &d.log,
                    );

                    d.set_handler(Box::new(StreamHandler::new(stream, self.shared.config.clone())));

                    // Stream bytes may already sit behind the handshake in
                    // the ingress buffer; replay them for the new handler.
                    if !d.ingress.is_empty() {
                        let id = d.id();
                        drop(ctx.link(ctx.index()).exec(move |ctx| ctx.notify_read(id)));
                    }

                    return;
                }
                HandshakeAction::Fail { reply, code } => {
                    logging::warn!(d.log, "handshake rejected";
                                   "code" => code,
                                   "reason" => handshake::describe_error(code),
                                   "peer" => d.remote.as_str());

                    drop(d.write_egress(&reply));
                    drop(d.flush());
                    d.close();
                    return;
                }
                HandshakeAction::Ignore => (),
            }
        }
    }

    fn on_tick(&mut self, d: &mut Descriptor, _ctx: &mut Context) {
        if !self.established && self.started.elapsed() > HANDSHAKE_TIMEOUT {
            logging::warn!(d.log, "handshake stalled"; "peer" => d.remote.as_str());
            d.close();
        }
    }

    fn on_error(&mut self, d: &mut Descriptor, _ctx: &mut Context, err: ErrorType) {
        logging::debug!(d.log, "handshake descriptor error"; "error" => %err);
    }

    fn on_delete(&mut self, _d: &mut Descriptor, _ctx: &mut Context) {
        if !self.established {
            self.hs.abandon();
        }
    }
}
