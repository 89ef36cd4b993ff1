//! The reactor: per-worker event loops over the poll primitive, owning every
//! socket, queue and timer in the process.

pub mod buffer;
pub mod context;
pub mod descriptor;
pub mod poller;
pub mod queue;
pub mod timer;
pub mod worker;

pub use self::buffer::Buffer;
pub use self::context::Context;
pub use self::descriptor::{Descriptor, DescriptorId, DescriptorIo, DescriptorKind, EventHandler};
pub use self::queue::QueueMessage;
pub use self::worker::{Reactor, WorkerLink};
