use crate::config::CoreConfig;
use crate::reactor::context::Context;
use crate::reactor::poller::{Poller, WAKER_TOKEN};
use crate::reactor::queue::{self, QueueMessage, QueueSender};
use crate::support::{NetworkError, NetworkResult};
use mio::Waker;
use plasma::logging::{self, Logger};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Cheap cloneable handle to one worker: its queue, waker and live
/// descriptor count. The only way to reach a descriptor owned by another
/// worker.
#[derive(Clone)]
pub struct WorkerLink {
    index: usize,
    sender: QueueSender,
    load: Arc<AtomicUsize>,
}

impl WorkerLink {
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of live descriptors currently placed on this worker.
    #[inline]
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    /// Posts a typed message to the worker's ingress queue, waking its loop.
    #[inline]
    pub fn post(&self, message: QueueMessage) -> NetworkResult<()> {
        self.sender.post(message)
    }

    /// Enqueues a callback to run on the worker's thread.
    #[inline]
    pub fn exec<F>(&self, callback: F) -> NetworkResult<()>
    where
        F: FnOnce(&mut Context) + Send + 'static,
    {
        self.post(QueueMessage::Callback(Box::new(callback)))
    }

    /// Posts raw egress bytes for a descriptor owned by this worker. The
    /// write happens on the worker's thread.
    #[inline]
    pub fn io_write(&self, id: crate::reactor::descriptor::DescriptorId, data: Vec<u8>) -> NetworkResult<()> {
        self.post(QueueMessage::IoWrite { id, data })
    }

    #[inline]
    pub(crate) fn wake(&self) -> io::Result<()> {
        self.sender.wake()
    }
}

struct ReactorInner {
    links: Vec<WorkerLink>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
    config: Arc<CoreConfig>,
    log: Logger,
}

/// The fixed process array of workers, sized at init. Starting the reactor
/// spawns one context thread per worker; descriptors are placed on the least
/// loaded worker and pinned there for life.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

impl Reactor {
    /// Validates the configuration and spawns the worker threads.
    pub fn start(config: CoreConfig, log: Logger) -> NetworkResult<Reactor> {
        config.validate()?;

        let config = Arc::new(config);
        let stopping = Arc::new(AtomicBool::new(false));
        let count = config.thread_count;

        let mut parts = Vec::with_capacity(count);
        let mut links = Vec::with_capacity(count);

        for index in 0..count {
            let poller = Poller::new().map_err(NetworkError::from)?;
            let waker = Arc::new(Waker::new(poller.registry(), WAKER_TOKEN).map_err(NetworkError::from)?);
            let (sender, receiver) = queue::channel(waker);
            let load = Arc::new(AtomicUsize::new(0));

            links.push(WorkerLink { index, sender, load: load.clone() });
            parts.push((poller, receiver, load));
        }

        let mut threads = Vec::with_capacity(count);

        for (index, (poller, receiver, load)) in parts.into_iter().enumerate() {
            let mut ctx = Context::new(
                index,
                poller,
                receiver,
                links.clone(),
                load,
                stopping.clone(),
                config.clone(),
                log.clone(),
            );

            let thread = thread::Builder::new()
                .name(format!("graviton-worker-{}", index))
                .spawn(move || ctx.run())
                .map_err(NetworkError::from)?;

            threads.push(thread);
        }

        logging::info!(log, "reactor started"; "workers" => count);

        Ok(Reactor {
            inner: Arc::new(ReactorInner {
                links,
                threads: Mutex::new(threads),
                stopping,
                config,
                log,
            }),
        })
    }

    #[inline]
    pub fn config(&self) -> &Arc<CoreConfig> {
        &self.inner.config
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.inner.log
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.inner.links.len()
    }

    #[inline]
    pub fn links(&self) -> &[WorkerLink] {
        &self.inner.links
    }

    #[inline]
    pub fn worker(&self, index: usize) -> &WorkerLink {
        &self.inner.links[index]
    }

    /// The worker currently owning the fewest live descriptors.
    pub fn least_loaded(&self) -> &WorkerLink {
        self.inner
            .links
            .iter()
            .min_by_key(|link| link.load())
            .expect("Worker array must not be empty")
    }

    /// Enqueues a callback to run on the selected worker's thread.
    #[inline]
    pub fn exec_on<F>(&self, index: usize, callback: F) -> NetworkResult<()>
    where
        F: FnOnce(&mut Context) + Send + 'static,
    {
        self.worker(index).exec(callback)
    }

    #[inline]
    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    /// Signals every worker loop to stop. New `add` operations are rejected
    /// from this point on.
    pub fn stop(&self) {
        self.inner.stopping.store(true, Ordering::Release);

        for link in &self.inner.links {
            drop(link.wake());
        }
    }

    /// Waits for every worker thread to finish its shutdown pass.
    pub fn join(&self) {
        let threads: Vec<JoinHandle<()>> = self
            .inner
            .threads
            .lock()
            .expect("Reactor thread registry poisoned")
            .drain(..)
            .collect();

        for thread in threads {
            drop(thread.join());
        }
    }

    /// Stop and join in one call.
    pub fn shutdown(&self) {
        self.stop();
        self.join();
        logging::info!(self.inner.log, "reactor stopped");
    }
}
