use crate::config::CoreConfig;
use crate::reactor::descriptor::{Descriptor, DescriptorId, DescriptorIo, DescriptorKind, EventHandler};
use crate::reactor::poller::{PollEvent, Poller};
use crate::reactor::queue::{QueueMessage, QueueReceiver};
use crate::reactor::timer::{TimerEntry, TimerHandler};
use crate::reactor::worker::WorkerLink;
use crate::support::{ErrorType, NetworkError, NetworkResult};
use hashbrown::HashMap;
use plasma::logging::{self, Logger};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const AGING_INTERVAL: Duration = Duration::from_secs(1);

struct NopHandler;
impl EventHandler for NopHandler {}

/// Per-thread runtime state: the poll primitive, the descriptor map, pending
/// timers and the cross-thread ingress queue. A context runs exactly one
/// thread; every descriptor it owns is mutated only on that thread.
pub struct Context {
    index: usize,
    poller: Poller,
    descriptors: HashMap<DescriptorId, Descriptor>,
    events: Vec<PollEvent>,
    rx: Option<QueueReceiver>,
    timers: HashMap<DescriptorId, TimerEntry>,
    timer_heap: BinaryHeap<Reverse<(Instant, DescriptorId)>>,
    links: Vec<WorkerLink>,
    load: Arc<AtomicUsize>,
    loop_count: u64,
    running: bool,
    stopping: Arc<AtomicBool>,
    last_aging: Instant,
    config: Arc<CoreConfig>,
    log: Logger,
}

impl Context {
    pub(crate) fn new(
        index: usize,
        poller: Poller,
        rx: QueueReceiver,
        links: Vec<WorkerLink>,
        load: Arc<AtomicUsize>,
        stopping: Arc<AtomicBool>,
        config: Arc<CoreConfig>,
        log: Logger,
    ) -> Context {
        let log = log.new(logging::o!("worker" => index));

        let mut ctx = Context {
            index,
            poller,
            descriptors: HashMap::new(),
            events: Vec::new(),
            rx: Some(rx),
            timers: HashMap::new(),
            timer_heap: BinaryHeap::new(),
            links,
            load,
            loop_count: 0,
            running: false,
            stopping,
            last_aging: Instant::now(),
            config,
            log,
        };

        // The ingress queue is itself a descriptor; its readiness is the
        // waker event and its drain happens in the loop.
        let mut queue = Descriptor::queue(Box::new(NopHandler), &ctx.log);
        queue.flags.in_context = true;
        queue.ctx_index = Some(index);
        ctx.descriptors.insert(queue.id(), queue);

        ctx
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }

    #[inline]
    pub fn config(&self) -> &Arc<CoreConfig> {
        &self.config
    }

    #[inline]
    pub fn loop_count(&self) -> u64 {
        self.loop_count
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running
    }

    #[inline]
    pub fn links(&self) -> &[WorkerLink] {
        &self.links
    }

    #[inline]
    pub fn link(&self, index: usize) -> &WorkerLink {
        &self.links[index]
    }

    /// The worker currently owning the fewest live descriptors.
    pub fn least_loaded_link(&self) -> &WorkerLink {
        self.links
            .iter()
            .min_by_key(|link| link.load())
            .expect("Worker array must not be empty")
    }

    /// Attaches a descriptor to this context. Rejected while a stop is in
    /// progress or when the descriptor is already owned by a context. After
    /// success all mutation must happen on this context's thread.
    pub fn add(&mut self, mut d: Descriptor) -> NetworkResult<DescriptorId> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(NetworkError::Fatal(ErrorType::InvalidState));
        }

        if d.flags.in_context {
            logging::error!(self.log, "descriptor already owned by a context";
                            "descriptor_id" => d.id(), "owner" => ?d.ctx_index);
            return Err(NetworkError::Fatal(ErrorType::InvalidState));
        }

        self.poller.register(&mut d)?;

        d.flags.in_context = true;
        d.ctx_index = Some(self.index);
        d.last_active = Instant::now();

        let id = d.id();

        if Self::counts_load(d.kind()) {
            self.load.fetch_add(1, Ordering::Relaxed);
        }

        self.descriptors.insert(id, d);
        self.dispatch(id, |handler, d, ctx| handler.on_new(d, ctx));

        Ok(id)
    }

    /// Detaches a descriptor without closing the OS handle.
    pub fn remove(&mut self, id: DescriptorId) -> Option<Descriptor> {
        let mut d = self.descriptors.remove(&id)?;

        drop(self.poller.deregister(&mut d));
        self.timers.remove(&id);

        if Self::counts_load(d.kind()) {
            self.load.fetch_sub(1, Ordering::Relaxed);
        }

        d.flags.in_context = false;
        d.ctx_index = None;

        Some(d)
    }

    /// Removes and destroys a descriptor: deregisters, fires the delete
    /// callback and closes the OS handle unless `preserve_io` hands it back.
    pub fn delete(&mut self, id: DescriptorId, preserve_io: bool) -> Option<DescriptorIo> {
        let d = self.descriptors.remove(&id)?;
        self.destroy(d, preserve_io)
    }

    /// Returns the descriptor with this id if present in this context.
    #[inline]
    pub fn find(&self, id: DescriptorId) -> Option<&Descriptor> {
        self.descriptors.get(&id)
    }

    #[inline]
    pub fn find_mut(&mut self, id: DescriptorId) -> Option<&mut Descriptor> {
        self.descriptors.get_mut(&id)
    }

    /// Recomputes the poll interests of a descriptor after a flag change.
    pub fn poll_update(&mut self, d: &mut Descriptor) -> NetworkResult<()> {
        self.poller.reregister(d).map_err(Into::into)
    }

    /// Re-runs the read callback against already-buffered ingress, e.g. after
    /// a handler swap that leaves bytes behind for the new handler.
    pub fn notify_read(&mut self, id: DescriptorId) {
        self.dispatch(id, |handler, d, ctx| handler.on_read(d, ctx));
    }

    /// Creates a timer descriptor owned by this context. The callback returns
    /// true to re-arm with the same period.
    pub fn start_timer<F>(&mut self, period: Duration, callback: F) -> DescriptorId
    where
        F: FnMut(&mut Context) -> bool + Send + 'static,
    {
        let d = Descriptor::timer(Box::new(TimerHandler { callback }), &self.log);
        let id = d.id();
        let deadline = Instant::now() + period;

        self.timers.insert(id, TimerEntry { deadline, period });
        self.timer_heap.push(Reverse((deadline, id)));

        if self.add(d).is_err() {
            self.timers.remove(&id);
        }

        id
    }

    /// Restarts the timer's period from now. Returns false if it no longer exists.
    pub fn reset_timer(&mut self, id: DescriptorId) -> bool {
        let entry = match self.timers.get_mut(&id) {
            Some(entry) => entry,
            None => return false,
        };

        entry.deadline = Instant::now() + entry.period;
        let deadline = entry.deadline;
        self.timer_heap.push(Reverse((deadline, id)));
        true
    }

    /// Deletes a timer descriptor, firing its delete callback.
    pub fn delete_timer(&mut self, id: DescriptorId) {
        self.timers.remove(&id);
        self.delete(id, false);
    }

    /// Runs the poll loop until the reactor-wide stop flag is set, then fires
    /// delete callbacks for every remaining descriptor.
    pub fn run(&mut self) {
        self.running = true;
        logging::debug!(self.log, "worker context running");

        while !self.stopping.load(Ordering::Acquire) {
            let timeout = self.next_timeout();

            if self.run_once(Some(timeout)).is_err() {
                // A poll primitive failure is fatal to this worker only.
                break;
            }
        }

        self.shutdown();
    }

    /// One loop iteration: block on the poll primitive up to `timeout`, drain
    /// ready events, fire expired timers and run the per-second aging scan.
    /// A zero timeout dispatches currently ready events and returns.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> NetworkResult<usize> {
        self.loop_count += 1;

        let mut events = std::mem::take(&mut self.events);

        if let Err(e) = self.poller.poll(timeout, &mut events) {
            logging::error!(self.log, "poll primitive failure"; "error" => %e);
            self.events = events;
            return Err(e.into());
        }

        let count = events.len();

        for event in &events {
            match event.waker {
                true => self.drain_queue(),
                false => self.dispatch_io(*event),
            }
        }

        events.clear();
        self.events = events;

        self.fire_timers();
        self.age_descriptors();

        Ok(count)
    }

    #[inline]
    fn counts_load(kind: DescriptorKind) -> bool {
        match kind {
            DescriptorKind::Queue | DescriptorKind::Timer => false,
            _ => true,
        }
    }

    /// Takes the descriptor and its handler out of the map, runs the supplied
    /// callback, then reinserts or destroys the descriptor depending on its
    /// close flag. A handler installed by the callback replaces the old one.
    fn dispatch<F>(&mut self, id: DescriptorId, f: F)
    where
        F: FnOnce(&mut Box<dyn EventHandler>, &mut Descriptor, &mut Context),
    {
        let mut d = match self.descriptors.remove(&id) {
            Some(d) => d,
            None => return,
        };

        let mut handler = match d.handler.take() {
            Some(handler) => handler,
            None => {
                self.descriptors.insert(id, d);
                return;
            }
        };

        f(&mut handler, &mut d, self);

        if d.handler.is_none() {
            d.handler = Some(handler);
        }

        self.finish(d);
    }

    #[inline]
    fn finish(&mut self, d: Descriptor) {
        match d.flags.close_pending {
            true => {
                self.destroy(d, false);
            }
            false => {
                self.descriptors.insert(d.id(), d);
            }
        }
    }

    fn destroy(&mut self, mut d: Descriptor, preserve_io: bool) -> Option<DescriptorIo> {
        drop(self.poller.deregister(&mut d));
        self.timers.remove(&d.id());

        if Self::counts_load(d.kind()) {
            self.load.fetch_sub(1, Ordering::Relaxed);
        }

        if let Some(mut handler) = d.handler.take() {
            handler.on_delete(&mut d, self);
        }

        d.flags.in_context = false;
        d.ctx_index = None;

        logging::trace!(self.log, "descriptor destroyed"; "descriptor_id" => d.id());

        match preserve_io {
            true => Some(std::mem::replace(&mut d.io, DescriptorIo::None)),
            false => None,
        }
    }

    fn dispatch_io(&mut self, event: PollEvent) {
        let id = event.id;

        let mut d = match self.descriptors.remove(&id) {
            Some(d) => d,
            None => return,
        };

        let mut handler = match d.handler.take() {
            Some(handler) => handler,
            None => {
                self.descriptors.insert(id, d);
                return;
            }
        };

        let now = Instant::now();

        // A connecting descriptor completes on its first writable event;
        // success means no queued socket error.
        if d.flags.connecting && (event.writable || event.error) {
            match d.take_socket_error() {
                Ok(None) if !event.error => {
                    d.flags.connecting = false;
                    d.last_active = now;
                    handler.on_connected(&mut d, self);
                }
                Ok(Some(err)) | Err(err) => {
                    handler.on_error(&mut d, self, ErrorType::Io(err.kind()));
                    d.close();
                }
                Ok(None) => {
                    handler.on_error(&mut d, self, ErrorType::Io(io::ErrorKind::ConnectionRefused));
                    d.close();
                }
            }
        }

        if event.readable && !d.flags.close_pending {
            match d.kind() {
                DescriptorKind::TcpListen => handler.on_read(&mut d, self),
                DescriptorKind::TcpAccepted | DescriptorKind::TcpOutgoing | DescriptorKind::Udp => {
                    // The poll primitive is edge-triggered: drain the handle
                    // completely, handing each burst to the read callback so
                    // the buffer frees up for the next one.
                    loop {
                        match d.fill_ingress() {
                            Ok((count, eof)) => {
                                if count > 0 {
                                    d.last_active = now;
                                    handler.on_read(&mut d, self);
                                }

                                if eof && !d.flags.close_pending {
                                    handler.on_error(&mut d, self, ErrorType::Eof);
                                    d.close();
                                }

                                if count == 0 || eof || d.flags.close_pending {
                                    break;
                                }
                            }
                            Err(e) => {
                                handler.on_error(&mut d, self, ErrorType::Io(e.kind()));
                                d.close();
                                break;
                            }
                        }
                    }
                }
                _ => (),
            }
        } else if event.read_closed && !d.flags.close_pending && d.kind().ages() {
            handler.on_error(&mut d, self, ErrorType::Eof);
            d.close();
        }

        if event.writable && !d.flags.close_pending && !d.flags.connecting {
            match d.flush() {
                Ok(count) => {
                    if count > 0 {
                        d.last_active = now;
                    }
                    handler.on_write(&mut d, self);
                }
                Err(e) => {
                    handler.on_error(&mut d, self, ErrorType::Io(e.kind()));
                    d.close();
                }
            }
        }

        if d.handler.is_none() {
            d.handler = Some(handler);
        }

        self.finish(d);
    }

    fn drain_queue(&mut self) {
        let rx = match self.rx.take() {
            Some(rx) => rx,
            None => return,
        };

        let max = self.config.queue_drain_max;
        let mut drained = 0usize;

        while drained < max {
            match rx.try_recv() {
                Some(message) => {
                    self.dispatch_message(message);
                    drained += 1;
                }
                None => break,
            }
        }

        self.rx = Some(rx);

        if drained == max {
            // More may be pending; schedule another batch.
            drop(self.links[self.index].wake());
        }
    }

    fn dispatch_message(&mut self, message: QueueMessage) {
        match message {
            QueueMessage::IoWrite { id, data } => {
                self.dispatch(id, move |handler, d, ctx| {
                    if !d.write_egress(&data) {
                        handler.on_error(d, ctx, ErrorType::Resource);
                        d.close();
                        return;
                    }

                    if let Err(e) = d.flush() {
                        handler.on_error(d, ctx, ErrorType::Io(e.kind()));
                        d.close();
                    }
                });
            }
            QueueMessage::ChannelSend { id, ch, pkt_type, data } => {
                self.dispatch(id, move |handler, d, ctx| {
                    handler.on_channel_send(d, ctx, ch, pkt_type, data)
                });
            }
            QueueMessage::Callback(callback) => callback(self),
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();

        loop {
            let (deadline, id) = match self.timer_heap.peek() {
                Some(Reverse(top)) => *top,
                None => break,
            };

            if deadline > now {
                break;
            }

            self.timer_heap.pop();

            let entry = match self.timers.get(&id) {
                Some(entry) => *entry,
                None => continue,
            };

            // A mismatched deadline marks a stale heap entry from a reset.
            if entry.deadline != deadline {
                continue;
            }

            if !self.descriptors.contains_key(&id) {
                self.timers.remove(&id);
                continue;
            }

            let mut rearm = false;
            self.dispatch(id, |handler, d, ctx| {
                rearm = handler.on_timer(d, ctx);

                if !rearm {
                    d.close();
                }
            });

            match rearm {
                true => {
                    let deadline = now + entry.period;
                    self.timers.insert(id, TimerEntry { deadline, period: entry.period });
                    self.timer_heap.push(Reverse((deadline, id)));
                }
                false => {
                    self.timers.remove(&id);
                }
            }
        }
    }

    /// Once per second, close descriptors whose last activity exceeds the
    /// connection timeout and give the rest a housekeeping tick.
    fn age_descriptors(&mut self) {
        let now = Instant::now();

        if now.duration_since(self.last_aging) < AGING_INTERVAL {
            return;
        }

        self.last_aging = now;
        let timeout = Duration::from_secs(self.config.conn_timeout_sec);
        let ids: Vec<DescriptorId> = self.descriptors.keys().copied().collect();

        for id in ids {
            let idle = match self.descriptors.get(&id) {
                Some(d) if d.kind().ages() => now.duration_since(d.last_active),
                _ => continue,
            };

            match idle >= timeout {
                true => {
                    logging::warn!(self.log, "descriptor timed out"; "descriptor_id" => id);
                    self.dispatch(id, |handler, d, ctx| {
                        handler.on_error(d, ctx, ErrorType::Timeout);
                        d.close();
                    });
                }
                false => self.dispatch(id, |handler, d, ctx| handler.on_tick(d, ctx)),
            }
        }
    }

    fn next_timeout(&self) -> Duration {
        let now = Instant::now();

        let mut timeout = AGING_INTERVAL
            .checked_sub(now.duration_since(self.last_aging))
            .unwrap_or_else(|| Duration::from_millis(0));

        if let Some(Reverse((deadline, _))) = self.timer_heap.peek() {
            let until = deadline
                .checked_duration_since(now)
                .unwrap_or_else(|| Duration::from_millis(0));
            timeout = timeout.min(until);
        }

        timeout
    }

    fn shutdown(&mut self) {
        self.running = false;

        let ids: Vec<DescriptorId> = self.descriptors.keys().copied().collect();

        for id in ids {
            if let Some(d) = self.descriptors.remove(&id) {
                self.destroy(d, false);
            }
        }

        self.rx = None;
        logging::debug!(self.log, "worker context stopped"; "loops" => self.loop_count);
    }
}
