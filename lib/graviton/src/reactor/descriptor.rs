use crate::reactor::buffer::Buffer;
use crate::reactor::context::Context;
use crate::support::ErrorType;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use plasma::logging::Logger;
use std::any::Any;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-unique descriptor identity, stable across the descriptor's
/// lifetime. Also used as the poll token within the owning context.
pub type DescriptorId = u64;

static NEXT_DESCRIPTOR_ID: AtomicU64 = AtomicU64::new(1);

// Listeners, queues and timers move no payload bytes through their buffers.
const CONTROL_BUF_CAP: usize = 4096;

/// Default ingress cap. Stream parsing drains the buffer on every readiness
/// event, so this only bounds a single event's burst.
pub const DEFAULT_INGRESS_CAP: usize = 1024 * 1024;

/// Default egress cap for non-stream descriptors.
pub const DEFAULT_EGRESS_CAP: usize = 4 * 1024 * 1024;

// Largest slice handed to a single UDP send.
const UDP_CHUNK: usize = 60000;

#[inline]
fn next_id() -> DescriptorId {
    NEXT_DESCRIPTOR_ID.fetch_add(1, Ordering::Relaxed)
}

/// Role of a descriptor within the reactor.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DescriptorKind {
    TcpListen,
    TcpAccepted,
    TcpOutgoing,
    Udp,
    Queue,
    Timer,
}

impl DescriptorKind {
    /// Whether the connection-aging scan applies to this kind.
    #[inline]
    pub fn ages(self) -> bool {
        match self {
            DescriptorKind::TcpAccepted | DescriptorKind::TcpOutgoing | DescriptorKind::Udp => true,
            _ => false,
        }
    }
}

/// The OS handle (if any) wrapped by a descriptor.
pub enum DescriptorIo {
    TcpListen(TcpListener),
    Tcp(TcpStream),
    Udp(UdpSocket),
    None,
}

#[derive(Debug, Default, Copy, Clone)]
pub struct Flags {
    pub wants_read: bool,
    pub wants_write: bool,
    pub connecting: bool,
    pub close_pending: bool,
    pub in_context: bool,
}

/// The callback table of a descriptor. One handler instance is owned by one
/// descriptor and only ever invoked on the owning context's thread, so
/// implementations keep their state without synchronization.
pub trait EventHandler: Send {
    /// Called once when the descriptor is added to a context.
    fn on_new(&mut self, _d: &mut Descriptor, _ctx: &mut Context) {}

    /// Called when fresh ingress bytes are buffered, or when a listener has
    /// pending connections to accept.
    fn on_read(&mut self, _d: &mut Descriptor, _ctx: &mut Context) {}

    /// Called after buffered egress has been flushed to the OS handle.
    fn on_write(&mut self, _d: &mut Descriptor, _ctx: &mut Context) {}

    /// Called when an outgoing connection completes successfully.
    fn on_connected(&mut self, _d: &mut Descriptor, _ctx: &mut Context) {}

    /// Called on a descriptor-fatal condition. The descriptor closes after
    /// this returns.
    fn on_error(&mut self, _d: &mut Descriptor, _ctx: &mut Context, _err: ErrorType) {}

    /// Called right before the descriptor is destroyed.
    fn on_delete(&mut self, _d: &mut Descriptor, _ctx: &mut Context) {}

    /// Timer expiry. Return true to re-arm with the same period.
    fn on_timer(&mut self, _d: &mut Descriptor, _ctx: &mut Context) -> bool {
        false
    }

    /// Housekeeping tick, roughly once per second on live descriptors.
    fn on_tick(&mut self, _d: &mut Descriptor, _ctx: &mut Context) {}

    /// An inter-thread channel packet addressed to this descriptor.
    fn on_channel_send(
        &mut self,
        _d: &mut Descriptor,
        _ctx: &mut Context,
        _ch: u8,
        _pkt_type: u8,
        _data: Vec<u8>,
    ) {
    }
}

/// A wrapped OS handle with buffers, flags and callbacks. Owned by at most
/// one context at a time; all mutation happens on that context's thread.
pub struct Descriptor {
    id: DescriptorId,
    kind: DescriptorKind,
    pub io: DescriptorIo,
    pub ingress: Buffer,
    pub egress: Buffer,
    pub flags: Flags,
    pub remote: String,
    pub ctx_index: Option<usize>,
    pub last_active: Instant,
    pub(crate) handler: Option<Box<dyn EventHandler>>,
    pub inheritor: Option<Box<dyn Any + Send>>,
    pub log: Logger,
}

impl Descriptor {
    fn new(
        kind: DescriptorKind,
        io: DescriptorIo,
        remote: String,
        handler: Box<dyn EventHandler>,
        ingress_cap: usize,
        egress_cap: usize,
        log: &Logger,
    ) -> Descriptor {
        let id = next_id();

        Descriptor {
            id,
            kind,
            io,
            ingress: Buffer::new(ingress_cap),
            egress: Buffer::new(egress_cap),
            flags: Flags::default(),
            remote,
            ctx_index: None,
            last_active: Instant::now(),
            handler: Some(handler),
            inheritor: None,
            log: log.new(plasma::logging::o!("descriptor_id" => id)),
        }
    }

    pub fn tcp_listen(listener: TcpListener, handler: Box<dyn EventHandler>, log: &Logger) -> Descriptor {
        let mut d = Descriptor::new(
            DescriptorKind::TcpListen,
            DescriptorIo::TcpListen(listener),
            String::new(),
            handler,
            CONTROL_BUF_CAP,
            CONTROL_BUF_CAP,
            log,
        );
        d.flags.wants_read = true;
        d
    }

    pub fn tcp_accepted(
        stream: TcpStream,
        remote: String,
        handler: Box<dyn EventHandler>,
        ingress_cap: usize,
        egress_cap: usize,
        log: &Logger,
    ) -> Descriptor {
        let mut d = Descriptor::new(
            DescriptorKind::TcpAccepted,
            DescriptorIo::Tcp(stream),
            remote,
            handler,
            ingress_cap,
            egress_cap,
            log,
        );
        d.flags.wants_read = true;
        d.flags.wants_write = true;
        d
    }

    pub fn tcp_outgoing(
        stream: TcpStream,
        remote: String,
        handler: Box<dyn EventHandler>,
        ingress_cap: usize,
        egress_cap: usize,
        log: &Logger,
    ) -> Descriptor {
        let mut d = Descriptor::new(
            DescriptorKind::TcpOutgoing,
            DescriptorIo::Tcp(stream),
            remote,
            handler,
            ingress_cap,
            egress_cap,
            log,
        );
        d.flags.wants_read = true;
        d.flags.wants_write = true;
        d.flags.connecting = true;
        d
    }

    pub fn udp(
        socket: UdpSocket,
        remote: String,
        handler: Box<dyn EventHandler>,
        ingress_cap: usize,
        egress_cap: usize,
        log: &Logger,
    ) -> Descriptor {
        let mut d = Descriptor::new(
            DescriptorKind::Udp,
            DescriptorIo::Udp(socket),
            remote,
            handler,
            ingress_cap,
            egress_cap,
            log,
        );
        d.flags.wants_read = true;
        d.flags.wants_write = true;
        d
    }

    pub fn queue(handler: Box<dyn EventHandler>, log: &Logger) -> Descriptor {
        Descriptor::new(
            DescriptorKind::Queue,
            DescriptorIo::None,
            String::new(),
            handler,
            CONTROL_BUF_CAP,
            CONTROL_BUF_CAP,
            log,
        )
    }

    pub fn timer(handler: Box<dyn EventHandler>, log: &Logger) -> Descriptor {
        Descriptor::new(
            DescriptorKind::Timer,
            DescriptorIo::None,
            String::new(),
            handler,
            CONTROL_BUF_CAP,
            CONTROL_BUF_CAP,
            log,
        )
    }

    #[inline]
    pub fn id(&self) -> DescriptorId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    /// Flags the descriptor for deletion at the end of the current callback.
    #[inline]
    pub fn close(&mut self) {
        self.flags.close_pending = true;
    }

    /// Replaces the callback table. Takes effect for all subsequent events;
    /// the replaced handler is dropped.
    #[inline]
    pub fn set_handler(&mut self, handler: Box<dyn EventHandler>) {
        self.handler = Some(handler);
    }

    /// Appends bytes to the egress buffer without flushing. Returns false
    /// when the buffer cap cannot fit them.
    #[inline]
    pub fn write_egress(&mut self, bytes: &[u8]) -> bool {
        self.egress.write(bytes)
    }

    /// Reads all available data from the OS handle into the ingress buffer.
    pub fn fill_ingress(&mut self) -> io::Result<(usize, bool)> {
        let Descriptor { ingress, io, .. } = self;

        match io {
            DescriptorIo::Tcp(stream) => ingress.ingress(&mut *stream),
            DescriptorIo::Udp(socket) => {
                let mut total = 0usize;

                loop {
                    if !ingress.reserve(UDP_CHUNK) {
                        return Ok((total, false));
                    }

                    match socket.recv(ingress.write_slice()) {
                        Ok(count) => {
                            ingress.move_tail(count);
                            total += count;
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Ok((total, false));
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
            _ => Ok((0, false)),
        }
    }

    /// Flushes buffered egress to the OS handle. A handle that would block
    /// leaves the remainder buffered.
    pub fn flush(&mut self) -> io::Result<usize> {
        let Descriptor { egress, io, .. } = self;

        match io {
            DescriptorIo::Tcp(stream) => egress.egress(&mut *stream),
            DescriptorIo::Udp(socket) => {
                let mut total = 0usize;

                while !egress.is_empty() {
                    let slice = egress.read_slice();
                    let chunk = slice.len().min(UDP_CHUNK);

                    match socket.send(&slice[..chunk]) {
                        Ok(count) => {
                            egress.move_head(count);
                            total += count;
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }

                Ok(total)
            }
            _ => Ok(0),
        }
    }

    /// Completes a nonblocking connect: returns the pending socket error, if
    /// any, mirroring an `SO_ERROR` query.
    pub fn take_socket_error(&mut self) -> io::Result<Option<io::Error>> {
        match &self.io {
            DescriptorIo::Tcp(stream) => stream.take_error(),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plasma::logging;

    struct Nop;
    impl EventHandler for Nop {}

    #[test]
    fn ids_are_unique_and_stable() {
        let log = logging::discard();
        let a = Descriptor::timer(Box::new(Nop), &log);
        let b = Descriptor::queue(Box::new(Nop), &log);

        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.id());
    }

    #[test]
    fn aging_applies_to_payload_kinds_only() {
        assert!(DescriptorKind::TcpAccepted.ages());
        assert!(DescriptorKind::TcpOutgoing.ages());
        assert!(DescriptorKind::Udp.ages());
        assert!(!DescriptorKind::TcpListen.ages());
        assert!(!DescriptorKind::Queue.ages());
        assert!(!DescriptorKind::Timer.ages());
    }
}
