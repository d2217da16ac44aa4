//! Per-worker I/O multiplexing core for event-driven network servers.
//!
//! A [`Poller`] owns one kernel readiness handle (epoll on Linux, kqueue on
//! the BSD family) plus a wake primitive, and drives a single-threaded
//! reactor loop: [`Poller::polling`] blocks in the kernel wait call and
//! dispatches readiness events to a caller-supplied callback. Other threads
//! hand work to that loop with [`Poller::trigger`]; jobs run on the poller
//! thread between wait calls, so state reached from the callback needs no
//! locking. The loop runs until a callback or job returns an error, which
//! `polling` returns verbatim.
//!
//! The poller never owns registered descriptors. Callers register raw fds
//! with [`Poller::add_read`] and friends, keep them open while registered,
//! and close them afterwards themselves. On the kqueue backend closing the
//! descriptor is also what deregisters it; see [`Poller::delete`].
//!
//! ```no_run
//! # fn main() -> std::io::Result<()> {
//! use netpoll::Poller;
//!
//! let poller = Poller::open()?;
//! poller.trigger(|| {
//!     println!("runs on the poller thread");
//!     Ok(())
//! })?;
//! poller.polling(|fd, readiness| {
//!     println!("fd {} is {:?}", fd, readiness);
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod queue;
pub mod readiness;
pub mod sync;
pub mod sys;

pub use queue::{AsyncJobQueue, Job};
pub use readiness::Readiness;
pub use sys::Poller;
