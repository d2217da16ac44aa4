use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};

use log::error;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::unistd;

use crate::queue::AsyncJobQueue;
use crate::readiness::Readiness;
use crate::sys::unix::INIT_EVENTS;

const READ_EVENTS: EpollFlags = EpollFlags::EPOLLPRI.union(EpollFlags::EPOLLIN);
const WRITE_EVENTS: EpollFlags = EpollFlags::EPOLLOUT;
const READ_WRITE_EVENTS: EpollFlags = READ_EVENTS.union(WRITE_EVENTS);
const ERROR_EVENTS: EpollFlags = EpollFlags::EPOLLERR.union(EpollFlags::EPOLLHUP);

/// A per-worker poller over an epoll instance.
///
/// The poller owns two descriptors: the epoll instance itself and an eventfd
/// registered inside it for read interest. The eventfd carries no payload;
/// [`trigger`](Poller::trigger) writes it to knock the poller thread out of
/// `epoll_wait`, and the payload travels through the job queue. Registered
/// descriptors stay owned by the caller.
pub struct Poller {
    epoll: Epoll,
    wake: EventFd,
    jobs: AsyncJobQueue,
}

impl Poller {
    /// Opens the epoll instance and its wake eventfd.
    ///
    /// If any step fails, the handles acquired before it are closed as the
    /// error propagates.
    pub fn open() -> io::Result<Poller> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let wake = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        epoll.add(&wake, EpollEvent::new(READ_EVENTS, wake.as_raw_fd() as u64))?;
        Ok(Poller {
            epoll,
            wake,
            jobs: AsyncJobQueue::new(),
        })
    }

    /// Closes the wake eventfd, then the epoll instance.
    ///
    /// Descriptors registered through this poller are not touched. Dropping
    /// the poller releases both handles too; `close` exists to surface close
    /// errors.
    pub fn close(self) -> io::Result<()> {
        let Poller { epoll, wake, .. } = self;
        let wake: OwnedFd = wake.into();
        unistd::close(wake.into_raw_fd())?;
        unistd::close(epoll.0.into_raw_fd())?;
        Ok(())
    }

    /// Schedules `job` to run on the poller thread.
    ///
    /// Wakes the poller only when the queue was empty before the push; a
    /// non-empty queue already has a wake in flight that will drain every
    /// queued job, this one included.
    pub fn trigger<F>(&self, job: F) -> io::Result<()>
    where
        F: FnOnce() -> io::Result<()> + Send + 'static,
    {
        if self.jobs.push(Box::new(job)) == 1 {
            self.wake.write(1)?;
        }
        Ok(())
    }

    /// Blocks in `epoll_wait` and dispatches readiness events to `callback`
    /// until a callback or a triggered job returns an error.
    ///
    /// That error is returned verbatim; remaining events of the batch and
    /// remaining jobs are discarded, and the loop never resumes. The caller
    /// still owns the poller afterwards and is expected to close it. At most
    /// one thread may run `polling` per poller; any number of threads may
    /// trigger and register concurrently.
    pub fn polling<F>(&self, mut callback: F) -> io::Result<()>
    where
        F: FnMut(RawFd, Readiness) -> io::Result<()>,
    {
        let mut list = EventList::new(INIT_EVENTS);
        let wake_fd = self.wake.as_raw_fd();
        let mut waken = false;

        loop {
            let n = match self.epoll.wait(&mut list.events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    // Known risk: a persistent failure here spins the loop
                    // at full speed with nothing but the log to show for it.
                    // Only callback and job errors may stop the loop.
                    error!("epoll_wait failed: {}", err);
                    continue;
                }
            };

            for event in &list.events[..n] {
                let fd = event.data() as RawFd;
                if fd == wake_fd {
                    waken = true;
                    let _ = self.wake.read();
                } else {
                    callback(fd, readiness(event.events()))?;
                }
            }

            if waken {
                waken = false;
                self.jobs.for_each()?;
            }

            if n == list.size {
                list.grow();
            }
        }
    }

    /// Registers `fd` for read readiness.
    pub fn add_read(&self, fd: RawFd) -> io::Result<()> {
        self.ctl_add(fd, READ_EVENTS)
    }

    /// Registers `fd` for write readiness.
    pub fn add_write(&self, fd: RawFd) -> io::Result<()> {
        self.ctl_add(fd, WRITE_EVENTS)
    }

    /// Registers `fd` for both read and write readiness.
    pub fn add_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.ctl_add(fd, READ_WRITE_EVENTS)
    }

    /// Demotes a registered `fd` to read-only interest.
    pub fn mod_read(&self, fd: RawFd) -> io::Result<()> {
        self.ctl_mod(fd, READ_EVENTS)
    }

    /// Promotes a registered `fd` to read plus write interest.
    pub fn mod_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.ctl_mod(fd, READ_WRITE_EVENTS)
    }

    /// Removes `fd` from the epoll interest list.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        unsafe { self.epoll.delete(BorrowedFd::borrow_raw(fd)) }?;
        Ok(())
    }

    #[inline(always)]
    fn ctl_add(&self, fd: RawFd, events: EpollFlags) -> io::Result<()> {
        let event = EpollEvent::new(events, fd as u64);
        unsafe { self.epoll.add(BorrowedFd::borrow_raw(fd), event) }?;
        Ok(())
    }

    #[inline(always)]
    fn ctl_mod(&self, fd: RawFd, events: EpollFlags) -> io::Result<()> {
        let mut event = EpollEvent::new(events, fd as u64);
        unsafe { self.epoll.modify(BorrowedFd::borrow_raw(fd), &mut event) }?;
        Ok(())
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.0.as_raw_fd()
    }
}

#[inline(always)]
fn readiness(events: EpollFlags) -> Readiness {
    let mut mask = Readiness::empty();
    if events.intersects(READ_EVENTS) {
        mask |= Readiness::READABLE;
    }
    if events.intersects(WRITE_EVENTS) {
        mask |= Readiness::WRITABLE;
    }
    if events.intersects(ERROR_EVENTS) {
        mask |= Readiness::ERROR;
    }
    mask
}

/// Output buffer for `epoll_wait` with an explicit capacity.
///
/// The capacity starts small and doubles whenever a wait fills the buffer
/// completely, a sign that ready descriptors may be waiting behind the
/// buffer edge. It never shrinks.
struct EventList {
    size: usize,
    events: Vec<EpollEvent>,
}

impl EventList {
    fn new(size: usize) -> Self {
        EventList {
            size,
            events: vec![EpollEvent::empty(); size],
        }
    }

    fn grow(&mut self) {
        self.size <<= 1;
        self.events = vec![EpollEvent::empty(); self.size];
    }
}
