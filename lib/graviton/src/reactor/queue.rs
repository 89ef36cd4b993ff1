use crate::reactor::context::Context;
use crate::reactor::descriptor::DescriptorId;
use crate::support::{ErrorType, NetworkError, NetworkResult};
use mio::Waker;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;

/// A typed cross-thread work item. Ownership of the payload transfers to the
/// queue on post and to the dispatch target on drain. Ordering is FIFO per
/// producer thread; there is no global order across producers.
pub enum QueueMessage {
    /// Raw egress bytes for a descriptor owned by the target worker.
    IoWrite { id: DescriptorId, data: Vec<u8> },
    /// An outgoing channel packet for a stream-mode descriptor.
    ChannelSend {
        id: DescriptorId,
        ch: u8,
        pkt_type: u8,
        data: Vec<u8>,
    },
    /// Arbitrary work executed on the target worker's thread.
    Callback(Box<dyn FnOnce(&mut Context) + Send>),
}

/// Producer half of a worker's ingress queue. Posting wakes the target
/// worker's poll loop.
#[derive(Clone)]
pub struct QueueSender {
    tx: Sender<QueueMessage>,
    waker: Arc<Waker>,
}

impl QueueSender {
    pub fn post(&self, message: QueueMessage) -> NetworkResult<()> {
        self.tx
            .send(message)
            .map_err(|_| NetworkError::Fatal(ErrorType::QueueClosed))?;

        self.waker.wake().map_err(NetworkError::from)
    }

    /// Wakes the target worker's poll loop without enqueueing anything.
    #[inline]
    pub fn wake(&self) -> std::io::Result<()> {
        self.waker.wake()
    }
}

/// Consumer half, owned by the worker's context.
pub struct QueueReceiver {
    rx: Receiver<QueueMessage>,
}

impl QueueReceiver {
    /// Pops one pending message without blocking.
    #[inline]
    pub fn try_recv(&self) -> Option<QueueMessage> {
        match self.rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Builds a queue pair around the supplied waker.
pub fn channel(waker: Arc<Waker>) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel();
    (QueueSender { tx, waker }, QueueReceiver { rx })
}
