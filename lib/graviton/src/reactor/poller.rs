use crate::reactor::descriptor::{Descriptor, DescriptorIo, DescriptorId};
use mio::{Events, Interest, Poll, Registry, Token};
use std::io;
use std::time::Duration;

/// Token reserved for the cross-thread waker; descriptor ids are allocated
/// from a counter and never collide with it.
pub const WAKER_TOKEN: Token = Token(usize::MAX);

const EVENT_CAPACITY: usize = 1024;

/// Readiness for one descriptor, translated from the OS event flags.
#[derive(Debug, Copy, Clone)]
pub struct PollEvent {
    pub id: DescriptorId,
    pub waker: bool,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub read_closed: bool,
}

/// Wraps the poll primitive (epoll, kqueue or IOCP, selected by mio) so that
/// callers never see the OS interface directly.
pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
        })
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Blocks up to `timeout` and translates the ready events into `out`.
    /// Interrupted polls surface as an empty event set.
    pub fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<PollEvent>) -> io::Result<()> {
        out.clear();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => (),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            out.push(PollEvent {
                id: event.token().0 as DescriptorId,
                waker: event.token() == WAKER_TOKEN,
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error(),
                read_closed: event.is_read_closed(),
            });
        }

        Ok(())
    }

    /// Registers the descriptor's OS handle, if it has one. Queue and timer
    /// descriptors carry no handle and are driven by the loop itself.
    pub fn register(&self, descriptor: &mut Descriptor) -> io::Result<()> {
        let token = Token(descriptor.id() as usize);
        let interests = Self::interests(descriptor);
        let registry = self.poll.registry();

        match &mut descriptor.io {
            DescriptorIo::TcpListen(listener) => registry.register(listener, token, interests),
            DescriptorIo::Tcp(stream) => registry.register(stream, token, interests),
            DescriptorIo::Udp(socket) => registry.register(socket, token, interests),
            DescriptorIo::None => Ok(()),
        }
    }

    /// Recomputes the readiness interests after a flag change.
    pub fn reregister(&self, descriptor: &mut Descriptor) -> io::Result<()> {
        let token = Token(descriptor.id() as usize);
        let interests = Self::interests(descriptor);
        let registry = self.poll.registry();

        match &mut descriptor.io {
            DescriptorIo::TcpListen(listener) => registry.reregister(listener, token, interests),
            DescriptorIo::Tcp(stream) => registry.reregister(stream, token, interests),
            DescriptorIo::Udp(socket) => registry.reregister(socket, token, interests),
            DescriptorIo::None => Ok(()),
        }
    }

    pub fn deregister(&self, descriptor: &mut Descriptor) -> io::Result<()> {
        let registry = self.poll.registry();

        match &mut descriptor.io {
            DescriptorIo::TcpListen(listener) => registry.deregister(listener),
            DescriptorIo::Tcp(stream) => registry.deregister(stream),
            DescriptorIo::Udp(socket) => registry.deregister(socket),
            DescriptorIo::None => Ok(()),
        }
    }

    #[inline]
    fn interests(descriptor: &Descriptor) -> Interest {
        let flags = descriptor.flags;

        match (flags.wants_read, flags.wants_write || flags.connecting) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            _ => Interest::READABLE,
        }
    }
}
