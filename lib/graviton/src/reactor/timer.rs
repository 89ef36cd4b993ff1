use crate::reactor::context::Context;
use crate::reactor::descriptor::{Descriptor, DescriptorId, EventHandler};
use crate::reactor::worker::WorkerLink;
use crate::support::NetworkResult;
use std::time::{Duration, Instant};

/// Book-keeping for one armed timer, owned by the context's timer heap.
#[derive(Debug, Copy, Clone)]
pub(crate) struct TimerEntry {
    pub deadline: Instant,
    pub period: Duration,
}

/// Adapts a closure into a timer descriptor's callback table. The closure
/// returns true to re-arm with the same period, false to let the reactor
/// delete the timer.
pub(crate) struct TimerHandler<F> {
    pub callback: F,
}

impl<F> EventHandler for TimerHandler<F>
where
    F: FnMut(&mut Context) -> bool + Send,
{
    fn on_timer(&mut self, _d: &mut Descriptor, ctx: &mut Context) -> bool {
        (self.callback)(ctx)
    }
}

/// Creates a timer owned by the target worker. The callback runs on that
/// worker's thread; returning true re-arms it with the same period.
pub fn start_on_worker<F>(link: &WorkerLink, period: Duration, callback: F) -> NetworkResult<()>
where
    F: FnMut(&mut Context) -> bool + Send + 'static,
{
    link.exec(move |ctx| {
        ctx.start_timer(period, callback);
    })
}

/// Re-arms a timer from any thread. A no-op if the timer no longer exists.
pub fn reset_on_worker(link: &WorkerLink, id: DescriptorId) -> NetworkResult<()> {
    link.exec(move |ctx| {
        ctx.reset_timer(id);
    })
}

/// Deletes a timer from any thread. A no-op if the timer no longer exists.
pub fn delete_on_worker(link: &WorkerLink, id: DescriptorId) -> NetworkResult<()> {
    link.exec(move |ctx| {
        ctx.delete_timer(id);
    })
}
