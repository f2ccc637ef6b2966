//! Bounded worker pool for the unpack engine.
//!
//! A fixed-size rayon pool executes extraction jobs; a pre-filled bounded
//! channel acts as a semaphore so that at most `nb_threads` jobs are in
//! flight at once. [`WorkerPool::submit`] blocks the orchestrator when every
//! slot is taken, which is exactly the backpressure the unpack scheduler
//! needs, and [`WorkerPool::join`] waits for the tail of the run.

use std::sync::{Arc, Condvar, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};
use rayon::ThreadPool as RayonPool;

use crate::error::{Result, ZipError};

struct PoolState {
    pending: usize,
}

/// Fixed-size pool with blocking, slot-bounded submission.
pub struct WorkerPool {
    pool: RayonPool,
    /// Pre-filled token channel: receiving a token claims a slot, workers
    /// return it when they finish.
    slot_tx: Sender<()>,
    slot_rx: Receiver<()>,
    state: Arc<(Mutex<PoolState>, Condvar)>,
}

impl WorkerPool {
    /// Build a pool with `nb_threads` workers and as many in-flight slots.
    pub fn new(nb_threads: usize) -> Result<Self> {
        let nb_threads = nb_threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(nb_threads)
            .build()
            .map_err(|e| ZipError::Misuse(format!("could not build worker pool: {e}")))?;
        let (slot_tx, slot_rx) = bounded(nb_threads);
        for _ in 0..nb_threads {
            // Filling a freshly created channel of this capacity cannot fail.
            slot_tx
                .send(())
                .map_err(|_| ZipError::Misuse("worker pool slot channel closed".to_string()))?;
        }
        Ok(WorkerPool {
            pool,
            slot_tx,
            slot_rx,
            state: Arc::new((Mutex::new(PoolState { pending: 0 }), Condvar::new())),
        })
    }

    /// Run `job` on a pool thread, blocking until a slot frees up.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Claim a slot; blocks while nb_threads jobs are already in flight.
        self.slot_rx.recv().expect("worker pool slot channel closed");

        {
            let (lock, _cvar) = &*self.state;
            lock.lock().unwrap().pending += 1;
        }

        let state = Arc::clone(&self.state);
        let slot_tx = self.slot_tx.clone();
        self.pool.spawn(move || {
            job();
            let (lock, cvar) = &*state;
            let mut s = lock.lock().unwrap();
            s.pending -= 1;
            if s.pending == 0 {
                cvar.notify_all();
            }
            drop(s);
            let _ = slot_tx.send(());
        });
    }

    /// Block until every submitted job has finished. The pool stays usable
    /// afterwards.
    pub fn join(&self) {
        let (lock, cvar) = &*self.state;
        let mut s = lock.lock().unwrap();
        while s.pending > 0 {
            s = cvar.wait(s).unwrap();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // The rayon pool joins its threads on drop; make sure no job is
        // still running when that happens.
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_all_jobs() {
        let pool = WorkerPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn in_flight_never_exceeds_thread_count() {
        const THREADS: usize = 3;
        let pool = WorkerPool::new(THREADS).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..24 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            pool.submit(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(2));
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
        pool.join();
        assert!(peak.load(Ordering::SeqCst) <= THREADS);
    }

    #[test]
    fn join_is_reusable() {
        let pool = WorkerPool::new(2).unwrap();
        pool.join(); // nothing submitted yet
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
