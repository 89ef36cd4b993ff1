use crate::reactor::descriptor::{Descriptor, DescriptorIo};
use crate::stream::obfuscation::{self, ObfuscationEngine};
use crate::support::{ErrorType, NetworkError, NetworkResult};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use plasma::logging::{self, Logger};
use std::net::SocketAddr;
use std::ops::BitOr;
use std::sync::{Arc, RwLock};

/// Wire-level properties a transport declares at registration.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Capabilities(pub u32);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    pub const RELIABLE: Capabilities = Capabilities(1 << 0);
    pub const ORDERED: Capabilities = Capabilities(1 << 1);
    pub const MESSAGE_BOUNDARIES: Capabilities = Capabilities(1 << 2);
    pub const SUPPORTS_OBFUSCATION: Capabilities = Capabilities(1 << 3);

    #[inline]
    pub fn has(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    #[inline]
    fn bitor(self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 | other.0)
    }
}

/// Stable transport tags. 2-4 are reserved names for application-provided
/// tunnels; only tcp and udp ship built in.
pub mod tag {
    pub const TCP: u8 = 0;
    pub const UDP: u8 = 1;
    pub const HTTP: u8 = 2;
    pub const WS: u8 = 3;
    pub const DNS: u8 = 4;
}

/// A named implementation of the wire layer beneath the stream framing. The
/// stream layer is reused unchanged on top of any of these.
pub trait StreamTransport: Send + Sync {
    fn tag(&self) -> u8;

    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn init(&self) -> NetworkResult<()> {
        Ok(())
    }

    fn deinit(&self) {}

    /// Starts a nonblocking connect and returns the handle to wrap in a
    /// descriptor.
    fn connect(&self, addr: &SocketAddr) -> NetworkResult<DescriptorIo>;

    /// Binds a listening or receiving handle on the supplied address.
    fn listen(&self, addr: &SocketAddr) -> NetworkResult<DescriptorIo>;

    /// Accepts one pending connection off a listening descriptor, if any.
    fn accept(&self, d: &mut Descriptor) -> NetworkResult<Option<(DescriptorIo, SocketAddr)>>;

    /// Drains buffered wire bytes into `out`.
    fn read(&self, d: &mut Descriptor, out: &mut Vec<u8>) -> NetworkResult<usize>;

    /// Queues wire bytes on the descriptor and flushes what the OS accepts.
    fn write(&self, d: &mut Descriptor, buf: &[u8]) -> NetworkResult<usize>;

    fn close(&self, d: &mut Descriptor) {
        d.close();
    }
}

struct Entry {
    transport: Arc<dyn StreamTransport>,
    obfuscation: Option<Arc<dyn ObfuscationEngine>>,
}

lazy_static! {
    static ref TRANSPORTS: RwLock<HashMap<u8, Entry>> = RwLock::new(HashMap::new());
}

/// Registers a transport under its tag. A duplicate tag rejects the second
/// registration and keeps the first.
pub fn register(transport: Arc<dyn StreamTransport>) -> NetworkResult<()> {
    let tag = transport.tag();
    let mut transports = TRANSPORTS.write().expect("Transport registry poisoned");

    if transports.contains_key(&tag) {
        return Err(NetworkError::Fatal(ErrorType::DuplicateTransport));
    }

    transport.init()?;
    transports.insert(tag, Entry { transport, obfuscation: None });
    Ok(())
}

pub fn find(tag: u8) -> Option<Arc<dyn StreamTransport>> {
    TRANSPORTS
        .read()
        .expect("Transport registry poisoned")
        .get(&tag)
        .map(|entry| entry.transport.clone())
}

pub fn find_by_name(name: &str) -> Option<Arc<dyn StreamTransport>> {
    TRANSPORTS
        .read()
        .expect("Transport registry poisoned")
        .values()
        .find(|entry| entry.transport.name() == name)
        .map(|entry| entry.transport.clone())
}

/// Attaches an obfuscation engine above the transport's write and below its
/// read. Only valid at init time and only for transports that advertise the
/// capability.
pub fn attach_obfuscation(tag: u8, engine: Arc<dyn ObfuscationEngine>) -> NetworkResult<()> {
    let mut transports = TRANSPORTS.write().expect("Transport registry poisoned");

    let entry = transports
        .get_mut(&tag)
        .ok_or(NetworkError::Fatal(ErrorType::UnknownTransport))?;

    if !entry.transport.capabilities().has(Capabilities::SUPPORTS_OBFUSCATION) {
        return Err(NetworkError::Fatal(ErrorType::InvalidState));
    }

    entry.obfuscation = Some(engine);
    Ok(())
}

/// Attaches the named engine to every registered transport that supports
/// obfuscation. Unknown engine names are a configuration error.
pub fn attach_obfuscation_by_name(name: &str) -> NetworkResult<()> {
    let engine = obfuscation::find(name).ok_or(NetworkError::Fatal(ErrorType::Config))?;
    let mut transports = TRANSPORTS.write().expect("Transport registry poisoned");

    for entry in transports.values_mut() {
        if entry.transport.capabilities().has(Capabilities::SUPPORTS_OBFUSCATION) {
            entry.obfuscation = Some(engine.clone());
        }
    }

    Ok(())
}

fn entry_parts(tag: u8) -> NetworkResult<(Arc<dyn StreamTransport>, Option<Arc<dyn ObfuscationEngine>>)> {
    let transports = TRANSPORTS.read().expect("Transport registry poisoned");

    let entry = transports
        .get(&tag)
        .ok_or(NetworkError::Fatal(ErrorType::UnknownTransport))?;

    Ok((entry.transport.clone(), entry.obfuscation.clone()))
}

/// Writes wire bytes through the transport, applying the attached obfuscation
/// engine first. On success returns the caller's original byte count; the
/// obfuscated size never leaks to the caller.
pub fn write_obfuscated(tag: u8, d: &mut Descriptor, buf: &[u8]) -> NetworkResult<usize> {
    let (transport, engine) = entry_parts(tag)?;

    match engine {
        None => transport.write(d, buf),
        Some(engine) => {
            let obfuscated = engine.apply(buf);
            transport.write(d, &obfuscated)?;
            Ok(buf.len())
        }
    }
}

/// Drains wire bytes through the transport and reverses the attached
/// obfuscation engine. Irreversible bytes are a crypto-class failure.
pub fn read_deobfuscated(tag: u8, d: &mut Descriptor, out: &mut Vec<u8>) -> NetworkResult<usize> {
    let (transport, engine) = entry_parts(tag)?;

    match engine {
        None => transport.read(d, out),
        Some(engine) => {
            let mut raw = Vec::new();
            transport.read(d, &mut raw)?;

            if raw.is_empty() {
                return Ok(0);
            }

            let clean = engine
                .remove(&raw)
                .ok_or(NetworkError::Fatal(ErrorType::Crypto))?;

            out.extend_from_slice(&clean);
            Ok(clean.len())
        }
    }
}

/// Raw TCP: the stream framing rides directly on the byte stream.
pub struct TcpTransport;

impl StreamTransport for TcpTransport {
    fn tag(&self) -> u8 {
        tag::TCP
    }

    fn name(&self) -> &str {
        "tcp"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::RELIABLE | Capabilities::ORDERED | Capabilities::SUPPORTS_OBFUSCATION
    }

    fn connect(&self, addr: &SocketAddr) -> NetworkResult<DescriptorIo> {
        let stream = TcpStream::connect(*addr)?;
        Ok(DescriptorIo::Tcp(stream))
    }

    fn listen(&self, addr: &SocketAddr) -> NetworkResult<DescriptorIo> {
        let listener = TcpListener::bind(*addr)?;
        Ok(DescriptorIo::TcpListen(listener))
    }

    fn accept(&self, d: &mut Descriptor) -> NetworkResult<Option<(DescriptorIo, SocketAddr)>> {
        match &mut d.io {
            DescriptorIo::TcpListen(listener) => match listener.accept() {
                Ok((stream, peer)) => Ok(Some((DescriptorIo::Tcp(stream), peer))),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e.into()),
            },
            _ => Err(NetworkError::Fatal(ErrorType::InvalidState)),
        }
    }

    fn read(&self, d: &mut Descriptor, out: &mut Vec<u8>) -> NetworkResult<usize> {
        let slice = d.ingress.read_slice();
        let count = slice.len();

        out.extend_from_slice(slice);
        d.ingress.move_head(count);
        Ok(count)
    }

    fn write(&self, d: &mut Descriptor, buf: &[u8]) -> NetworkResult<usize> {
        if !d.write_egress(buf) {
            return Err(NetworkError::Wait);
        }

        d.flush()?;
        Ok(buf.len())
    }
}

/// Datagram transport. Unreliable and unordered; the stream layer's framing
/// resynchronizes on the packet signature, so losses surface as dropped
/// packets rather than a torn stream.
pub struct UdpTransport;

impl StreamTransport for UdpTransport {
    fn tag(&self) -> u8 {
        tag::UDP
    }

    fn name(&self) -> &str {
        "udp"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::MESSAGE_BOUNDARIES | Capabilities::SUPPORTS_OBFUSCATION
    }

    fn connect(&self, addr: &SocketAddr) -> NetworkResult<DescriptorIo> {
        let bind: SocketAddr = match addr {
            SocketAddr::V4(_) => "0.0.0.0:0".parse()?,
            SocketAddr::V6(_) => "[::]:0".parse()?,
        };

        let socket = UdpSocket::bind(bind)?;
        socket.connect(*addr)?;
        Ok(DescriptorIo::Udp(socket))
    }

    fn listen(&self, addr: &SocketAddr) -> NetworkResult<DescriptorIo> {
        let socket = UdpSocket::bind(*addr)?;
        Ok(DescriptorIo::Udp(socket))
    }

    fn accept(&self, _d: &mut Descriptor) -> NetworkResult<Option<(DescriptorIo, SocketAddr)>> {
        // Datagram sockets have no connection queue.
        Ok(None)
    }

    fn read(&self, d: &mut Descriptor, out: &mut Vec<u8>) -> NetworkResult<usize> {
        let slice = d.ingress.read_slice();
        let count = slice.len();

        out.extend_from_slice(slice);
        d.ingress.move_head(count);
        Ok(count)
    }

    fn write(&self, d: &mut Descriptor, buf: &[u8]) -> NetworkResult<usize> {
        if !d.write_egress(buf) {
            return Err(NetworkError::Wait);
        }

        d.flush()?;
        Ok(buf.len())
    }
}

/// Registers the transports named in the configuration, skipping names that
/// are already present so repeated init calls stay idempotent.
pub fn register_defaults(names: &[String], log: &Logger) -> NetworkResult<()> {
    for name in names {
        if find_by_name(name).is_some() {
            continue;
        }

        let transport: Arc<dyn StreamTransport> = match name.as_str() {
            "tcp" => Arc::new(TcpTransport),
            "udp" => Arc::new(UdpTransport),
            other => {
                logging::error!(log, "unknown transport in configuration"; "transport" => other);
                return Err(NetworkError::Fatal(ErrorType::Config));
            }
        };

        register(transport)?;
        logging::info!(log, "transport registered"; "transport" => name.as_str());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::descriptor::EventHandler;
    use crate::stream::obfuscation::IdentityObfuscation;

    struct Nop;
    impl EventHandler for Nop {}

    struct LoopTransport {
        tag: u8,
    }

    impl StreamTransport for LoopTransport {
        fn tag(&self) -> u8 {
            self.tag
        }

        fn name(&self) -> &str {
            "loop"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::RELIABLE | Capabilities::SUPPORTS_OBFUSCATION
        }

        fn connect(&self, _addr: &SocketAddr) -> NetworkResult<DescriptorIo> {
            Ok(DescriptorIo::None)
        }

        fn listen(&self, _addr: &SocketAddr) -> NetworkResult<DescriptorIo> {
            Ok(DescriptorIo::None)
        }

        fn accept(&self, _d: &mut Descriptor) -> NetworkResult<Option<(DescriptorIo, SocketAddr)>> {
            Ok(None)
        }

        fn read(&self, d: &mut Descriptor, out: &mut Vec<u8>) -> NetworkResult<usize> {
            let slice = d.ingress.read_slice();
            let count = slice.len();
            out.extend_from_slice(slice);
            d.ingress.move_head(count);
            Ok(count)
        }

        fn write(&self, d: &mut Descriptor, buf: &[u8]) -> NetworkResult<usize> {
            match d.write_egress(buf) {
                true => Ok(buf.len()),
                false => Err(NetworkError::Wait),
            }
        }
    }

    #[test]
    fn duplicate_tag_rejected() {
        register(Arc::new(LoopTransport { tag: 200 })).unwrap();

        let second = register(Arc::new(LoopTransport { tag: 200 }));
        assert_eq!(second, Err(NetworkError::Fatal(ErrorType::DuplicateTransport)));
        assert!(find(200).is_some());
    }

    #[test]
    fn capability_bits_compose() {
        let caps = Capabilities::RELIABLE | Capabilities::ORDERED;

        assert!(caps.has(Capabilities::RELIABLE));
        assert!(caps.has(Capabilities::ORDERED));
        assert!(!caps.has(Capabilities::MESSAGE_BOUNDARIES));
    }

    #[test]
    fn obfuscated_write_reports_original_size() {
        register(Arc::new(LoopTransport { tag: 201 })).unwrap();
        attach_obfuscation(201, Arc::new(IdentityObfuscation)).unwrap();

        let log = plasma::logging::discard();
        let mut d = Descriptor::queue(Box::new(Nop), &log);

        let written = write_obfuscated(201, &mut d, b"wire frame").unwrap();
        assert_eq!(written, 10);
        assert_eq!(d.egress.read_slice(), b"wire frame");
    }

    #[test]
    fn obfuscated_read_round_trips() {
        register(Arc::new(LoopTransport { tag: 202 })).unwrap();
        attach_obfuscation(202, Arc::new(IdentityObfuscation)).unwrap();

        let log = plasma::logging::discard();
        let mut d = Descriptor::queue(Box::new(Nop), &log);
        d.ingress.write(b"ingress frame");

        let mut out = Vec::new();
        let count = read_deobfuscated(202, &mut d, &mut out).unwrap();

        assert_eq!(count, 13);
        assert_eq!(out, b"ingress frame");
        assert!(d.ingress.is_empty());
    }

    #[test]
    fn obfuscation_requires_capability() {
        struct Plain;

        impl StreamTransport for Plain {
            fn tag(&self) -> u8 {
                203
            }
            fn name(&self) -> &str {
                "plain"
            }
            fn capabilities(&self) -> Capabilities {
                Capabilities::RELIABLE
            }
            fn connect(&self, _addr: &SocketAddr) -> NetworkResult<DescriptorIo> {
                Ok(DescriptorIo::None)
            }
            fn listen(&self, _addr: &SocketAddr) -> NetworkResult<DescriptorIo> {
                Ok(DescriptorIo::None)
            }
            fn accept(&self, _d: &mut Descriptor) -> NetworkResult<Option<(DescriptorIo, SocketAddr)>> {
                Ok(None)
            }
            fn read(&self, _d: &mut Descriptor, _out: &mut Vec<u8>) -> NetworkResult<usize> {
                Ok(0)
            }
            fn write(&self, _d: &mut Descriptor, buf: &[u8]) -> NetworkResult<usize> {
                Ok(buf.len())
            }
        }

        register(Arc::new(Plain)).unwrap();

        let attached = attach_obfuscation(203, Arc::new(IdentityObfuscation));
        assert_eq!(attached, Err(NetworkError::Fatal(ErrorType::InvalidState)));
    }
}
