use std::io;
use std::os::fd::{AsFd, AsRawFd, IntoRawFd, OwnedFd, RawFd};

use log::error;
use nix::errno::Errno;
use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};
use nix::unistd;

use crate::queue::AsyncJobQueue;
use crate::readiness::Readiness;
use crate::sys::unix::INIT_EVENTS;

// Ident of the wake filter. Registered descriptors are never 0.
const WAKE_IDENT: usize = 0;

/// A per-worker poller over a kqueue.
///
/// The kqueue itself doubles as the wake primitive: an `EVFILT_USER` filter
/// registered at ident 0 is triggered by [`trigger`](Poller::trigger) to
/// knock the poller thread out of `kevent`. The filter carries no payload;
/// that travels through the job queue. Registered descriptors stay owned by
/// the caller.
pub struct Poller {
    kq: Kqueue,
    jobs: AsyncJobQueue,
}

impl Poller {
    /// Opens the kqueue and registers the wake filter on it.
    pub fn open() -> io::Result<Poller> {
        let kq = Kqueue::new()?;
        let wake = KEvent::new(
            WAKE_IDENT,
            EventFilter::EVFILT_USER,
            EventFlag::EV_ADD | EventFlag::EV_CLEAR,
            FilterFlag::empty(),
            0,
            0,
        );
        kq.kevent(&[wake], &mut [], None)?;
        Ok(Poller {
            kq,
            jobs: AsyncJobQueue::new(),
        })
    }

    /// Closes the kqueue; the kernel drops its filters with it.
    ///
    /// Descriptors registered through this poller are not touched. Dropping
    /// the poller releases the handle too; `close` exists to surface close
    /// errors.
    pub fn close(self) -> io::Result<()> {
        let kq: OwnedFd = self.kq.into();
        unistd::close(kq.into_raw_fd())?;
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
            let wake = KEvent::new(
                WAKE_IDENT,
                EventFilter::EVFILT_USER,
                EventFlag::empty(),
                FilterFlag::NOTE_TRIGGER,
                0,
                0,
            );
            self.kq.kevent(&[wake], &mut [], None)?;
        }
        Ok(())
    }

    /// Blocks in `kevent` and dispatches readiness events to `callback`
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
        let mut waken = false;

        loop {
            let n = match self.kq.kevent(&[], &mut list.events, None) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    // Known risk: a persistent failure here spins the loop
                    // at full speed with nothing but the log to show for it.
                    // Only callback and job errors may stop the loop.
                    error!("kevent wait failed: {}", err);
                    continue;
                }
            };

            for event in &list.events[..n] {
                let ident = event.ident();
                if ident == WAKE_IDENT {
                    waken = true;
                } else {
                    callback(ident as RawFd, readiness(event))?;
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
        self.change(&[read_filter(fd, EventFlag::EV_ADD)])
    }

    /// Registers `fd` for write readiness.
    pub fn add_write(&self, fd: RawFd) -> io::Result<()> {
        self.change(&[write_filter(fd, EventFlag::EV_ADD)])
    }

    /// Registers `fd` for both read and write readiness.
    pub fn add_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.change(&[
            read_filter(fd, EventFlag::EV_ADD),
            write_filter(fd, EventFlag::EV_ADD),
        ])
    }

    /// Demotes `fd` to read-only interest by deleting its write filter.
    ///
    /// The descriptor must currently hold both filters; demoting a read-only
    /// registration is a caller error the kernel rejects.
    pub fn mod_read(&self, fd: RawFd) -> io::Result<()> {
        self.change(&[write_filter(fd, EventFlag::EV_DELETE)])
    }

    /// Promotes `fd` to read plus write interest by adding the write filter.
    pub fn mod_read_write(&self, fd: RawFd) -> io::Result<()> {
        self.change(&[write_filter(fd, EventFlag::EV_ADD)])
    }

    /// Does nothing on this backend.
    ///
    /// kqueue drops a descriptor's filters when the descriptor is closed,
    /// and the caller owns the close. The method exists for contract parity
    /// with the epoll backend, where deletion is an explicit syscall.
    pub fn delete(&self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }

    #[inline(always)]
    fn change(&self, changes: &[KEvent]) -> io::Result<()> {
        self.kq.kevent(changes, &mut [], None)?;
        Ok(())
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.kq.as_fd().as_raw_fd()
    }
}

fn read_filter(fd: RawFd, flags: EventFlag) -> KEvent {
    KEvent::new(
        fd as usize,
        EventFilter::EVFILT_READ,
        flags,
        FilterFlag::empty(),
        0,
        0,
    )
}

fn write_filter(fd: RawFd, flags: EventFlag) -> KEvent {
    KEvent::new(
        fd as usize,
        EventFilter::EVFILT_WRITE,
        flags,
        FilterFlag::empty(),
        0,
        0,
    )
}

/// Maps one kevent record to a readiness class.
///
/// A record flagged `EV_EOF` or `EV_ERROR` becomes the error class no matter
/// which filter fired, so the callback handles peer-closed and socket-error
/// conditions the same way on every code path.
#[inline(always)]
fn readiness(event: &KEvent) -> Readiness {
    if event
        .flags()
        .intersects(EventFlag::EV_EOF | EventFlag::EV_ERROR)
    {
        return Readiness::ERROR;
    }
    match event.filter() {
        Ok(EventFilter::EVFILT_READ) => Readiness::READABLE,
        Ok(EventFilter::EVFILT_WRITE) => Readiness::WRITABLE,
        _ => Readiness::empty(),
    }
}

/// Output buffer for `kevent` with an explicit capacity.
///
/// The capacity starts small and doubles whenever a wait fills the buffer
/// completely, a sign that ready descriptors may be waiting behind the
/// buffer edge. It never shrinks.
struct EventList {
    size: usize,
    events: Vec<KEvent>,
}

impl EventList {
    fn new(size: usize) -> Self {
        EventList {
            size,
            events: vec![placeholder(); size],
        }
    }

    fn grow(&mut self) {
        self.size <<= 1;
        self.events = vec![placeholder(); self.size];
    }
}

fn placeholder() -> KEvent {
    KEvent::new(
        0,
        EventFilter::EVFILT_READ,
        EventFlag::empty(),
        FilterFlag::empty(),
        0,
        0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_and_error_flags_replace_the_filter_class() {
        let read_eof = KEvent::new(
            3,
            EventFilter::EVFILT_READ,
            EventFlag::EV_EOF,
            FilterFlag::empty(),
            0,
            0,
        );
        assert!(readiness(&read_eof).is_error());
        assert!(!readiness(&read_eof).is_readable());

        let write_err = KEvent::new(
            3,
            EventFilter::EVFILT_WRITE,
            EventFlag::EV_ERROR,
            FilterFlag::empty(),
            0,
            0,
        );
        assert!(readiness(&write_err).is_error());
        assert!(!readiness(&write_err).is_writable());
    }

    #[test]
    fn plain_filters_map_to_their_class() {
        assert!(readiness(&read_filter(3, EventFlag::empty())).is_readable());
        assert!(readiness(&write_filter(3, EventFlag::empty())).is_writable());
    }

    #[test]
    fn event_list_doubles_and_never_shrinks() {
        let mut list = EventList::new(INIT_EVENTS);
        assert_eq!(list.size, INIT_EVENTS);
        assert_eq!(list.events.len(), INIT_EVENTS);

        list.grow();
        assert_eq!(list.size, 2 * INIT_EVENTS);
        assert_eq!(list.events.len(), 2 * INIT_EVENTS);
    }

    #[test]
    fn open_then_close_releases_the_handle() {
        let poller = Poller::open().unwrap();
        assert!(poller.as_raw_fd() >= 0);
        poller.close().unwrap();
    }
}
