use std::io;
use std::mem;

use crate::sync::SpinLock;

/// A deferred, fallible unit of work executed on a poller thread.
pub type Job = Box<dyn FnOnce() -> io::Result<()> + Send + 'static>;

/// Thread-safe FIFO of jobs handed across threads to a poller.
///
/// [`push`](AsyncJobQueue::push) reports the queue length right after the
/// insert. A report of exactly 1 marks the empty to non-empty transition and
/// is the only case where the pushing side must wake the poller; every other
/// report means a wake is already on its way and the whole queue will be
/// drained by it.
pub struct AsyncJobQueue {
    jobs: SpinLock<Vec<Job>>,
}

impl AsyncJobQueue {
    pub fn new() -> Self {
        AsyncJobQueue {
            jobs: SpinLock::new(Vec::new()),
        }
    }

    /// Appends a job, returning the queue length after the append.
    pub fn push(&self, job: Job) -> usize {
        let mut jobs = self.jobs.lock();
        jobs.push(job);
        jobs.len()
    }

    /// Swaps the queued batch out and runs it in FIFO order, unlocked.
    ///
    /// Jobs pushed while the batch runs land in the fresh queue and wait for
    /// the next wake cycle. The first failing job ends the batch with its
    /// error; the jobs behind it are dropped unexecuted.
    pub fn for_each(&self) -> io::Result<()> {
        let batch = mem::take(&mut *self.jobs.lock());
        for job in batch {
            job()?;
        }
        Ok(())
    }
}

impl Default for AsyncJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn push_reports_length_after_insert() {
        let queue = AsyncJobQueue::new();
        assert_eq!(queue.push(Box::new(|| Ok(()))), 1);
        assert_eq!(queue.push(Box::new(|| Ok(()))), 2);
        assert_eq!(queue.push(Box::new(|| Ok(()))), 3);
    }

    #[test]
    fn for_each_runs_in_fifo_order() {
        let queue = AsyncJobQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            queue.push(Box::new(move || {
                order.lock().unwrap().push(i);
                Ok(())
            }));
        }
        queue.for_each().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn first_failure_stops_the_batch() {
        let queue = AsyncJobQueue::new();
        let ran = Arc::new(Mutex::new(Vec::new()));

        let a = ran.clone();
        queue.push(Box::new(move || {
            a.lock().unwrap().push("a");
            Ok(())
        }));
        let b = ran.clone();
        queue.push(Box::new(move || {
            b.lock().unwrap().push("b");
            Err(Error::new(ErrorKind::Other, "b refused"))
        }));
        let c = ran.clone();
        queue.push(Box::new(move || {
            c.lock().unwrap().push("c");
            Ok(())
        }));

        let err = queue.for_each().unwrap_err();
        assert_eq!(err.to_string(), "b refused");
        assert_eq!(*ran.lock().unwrap(), vec!["a", "b"]);

        // the failed batch was consumed whole; nothing left for a new cycle
        queue.for_each().unwrap();
        assert_eq!(*ran.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn jobs_pushed_mid_batch_wait_for_the_next_cycle() {
        let queue = Arc::new(AsyncJobQueue::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let inner_queue = queue.clone();
        let outer_hits = hits.clone();
        queue.push(Box::new(move || {
            outer_hits.fetch_add(1, Ordering::SeqCst);
            let inner_hits = outer_hits.clone();
            inner_queue.push(Box::new(move || {
                inner_hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
            Ok(())
        }));

        queue.for_each().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        queue.for_each().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exactly_one_push_sees_the_empty_transition() {
        let queue = Arc::new(AsyncJobQueue::new());
        let transitions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            let transitions = transitions.clone();
            handles.push(thread::spawn(move || {
                if queue.push(Box::new(|| Ok(()))) == 1 {
                    transitions.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(transitions.load(Ordering::SeqCst), 1);
        queue.for_each().unwrap();
    }
}
