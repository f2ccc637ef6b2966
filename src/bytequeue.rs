//! Bounded single-producer single-consumer byte buffer.
//!
//! Every in-flight compression task owns one [`ByteQueue`]: the worker thread
//! pushes codec output into it and the archive writer drains it. The buffer
//! never holds more than `capacity` bytes; a producer that outruns the
//! consumer blocks inside [`push`](ByteQueue::push) until the consumer's
//! [`pop`](ByteQueue::pop) empties the buffer or the queue is shut down.
//!
//! The pairing is structural: one thread pushes, one thread pops. The queue
//! itself only enforces the byte-count and state invariants.

use std::sync::{Condvar, Mutex, MutexGuard};

use crate::error::{Result, ZipError};

/// Observable queue states.
///
/// `Shutdown` is terminal: no transition leads out of it and later pushes
/// fail. One final non-empty [`ByteQueue::pop`] may still return buffered
/// bytes after shutdown; all pops after that return an empty buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Empty,
    HasData,
    Full,
    Shutdown,
}

struct Inner {
    buffer: Vec<u8>,
    state: QueueState,
}

/// Bounded FIFO byte buffer with blocking backpressure.
pub struct ByteQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
    capacity: usize,
}

impl ByteQueue {
    /// Create a queue that buffers at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        ByteQueue {
            inner: Mutex::new(Inner {
                buffer: Vec::with_capacity(capacity),
                state: QueueState::Empty,
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    /// Maximum number of buffered bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `data` to the buffer, blocking while the buffer is full.
    ///
    /// Inputs larger than the remaining space are fed in rounds: fill the
    /// buffer, mark it `Full`, wait for the consumer to drain it, repeat.
    /// Fails with [`ZipError::Misuse`] when called on a queue that is
    /// already shut down. A shutdown that arrives while this call is
    /// blocked waiting for space makes the call return early; the
    /// remaining bytes are dropped, matching the consumer's promise to
    /// never pop from this queue again.
    pub fn push(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == QueueState::Shutdown {
            return Err(ZipError::Misuse(
                "push on a queue that has been shut down".to_string(),
            ));
        }
        if inner.buffer.len() + data.len() < self.capacity {
            inner.buffer.extend_from_slice(data);
            if inner.state == QueueState::Empty {
                self.set_state(&mut inner, QueueState::HasData);
            }
            return Ok(());
        }
        self.push_rounds(inner, data);
        Ok(())
    }

    fn push_rounds(&self, mut inner: MutexGuard<'_, Inner>, data: &[u8]) {
        let mut pushed = 0usize;
        while pushed < data.len() {
            let round = (self.capacity - inner.buffer.len()).min(data.len() - pushed);
            inner.buffer.extend_from_slice(&data[pushed..pushed + round]);
            pushed += round;
            if inner.buffer.len() == self.capacity {
                self.set_state(&mut inner, QueueState::Full);
                if pushed == data.len() {
                    // Everything fit exactly; no need to block for space
                    // we are not going to use.
                    return;
                }
                while inner.state == QueueState::Full {
                    inner = self.cond.wait(inner).unwrap();
                }
                if inner.state == QueueState::Shutdown {
                    return;
                }
            } else {
                self.set_state(&mut inner, QueueState::HasData);
            }
        }
    }

    /// Take all buffered bytes. Never blocks.
    ///
    /// Resets the state to `Empty` unless the queue has been shut down.
    pub fn pop(&self) -> Vec<u8> {
        let mut inner = self.inner.lock().unwrap();
        let out = std::mem::take(&mut inner.buffer);
        if inner.state != QueueState::Shutdown {
            self.set_state(&mut inner, QueueState::Empty);
        }
        out
    }

    /// Block the consumer until the state is `Full` or `Shutdown`.
    pub fn wait_until_full_or_shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        while !matches!(inner.state, QueueState::Full | QueueState::Shutdown) {
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> QueueState {
        self.inner.lock().unwrap().state
    }

    /// Irreversibly close the queue and wake every waiter.
    ///
    /// Buffered bytes stay available for one final [`pop`](Self::pop).
    /// Idempotent.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == QueueState::Shutdown {
            return;
        }
        inner.state = QueueState::Shutdown;
        self.cond.notify_all();
    }

    // State changes wake exactly one waiter; in an SPSC pairing at most one
    // thread can be blocked on this queue at a time.
    fn set_state(&self, inner: &mut MutexGuard<'_, Inner>, new_state: QueueState) {
        if inner.state != new_state {
            inner.state = new_state;
            self.cond.notify_one();
        }
    }
}

impl Drop for ByteQueue {
    fn drop(&mut self) {
        // Guard against data loss: the consumer must drain the queue before
        // the owning task is destroyed.
        debug_assert!(
            self.inner.lock().unwrap().buffer.is_empty(),
            "ByteQueue dropped with undrained bytes"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_pop_round_trip() {
        let q = ByteQueue::new(1024);
        q.push(b"Hello world!").unwrap();
        q.shutdown();
        assert_eq!(q.pop(), b"Hello world!");
        assert_eq!(q.state(), QueueState::Shutdown);
        assert!(q.pop().is_empty());
    }

    #[test]
    fn exact_fill_does_not_block() {
        let q = ByteQueue::new(2);
        q.push(b"AB").unwrap();
        assert_eq!(q.state(), QueueState::Full);
        assert_eq!(q.pop(), b"AB");
        assert_eq!(q.state(), QueueState::Empty);
        q.push(b"CD").unwrap();
        assert_eq!(q.pop(), b"CD");
        q.shutdown();
    }

    #[test]
    fn push_after_shutdown_fails() {
        let q = ByteQueue::new(16);
        q.shutdown();
        assert!(matches!(q.push(b"x"), Err(ZipError::Misuse(_))));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let q = ByteQueue::new(16);
        q.shutdown();
        q.shutdown();
        assert_eq!(q.state(), QueueState::Shutdown);
    }

    /// Producer pushes a megabyte through a 1 KiB buffer while the consumer
    /// drains it; every byte must come out, in order.
    #[test]
    fn oversized_input_streams_through() {
        const QUEUE_SIZE: usize = 1024;
        const TEST_SIZE: usize = QUEUE_SIZE * QUEUE_SIZE;
        let q = Arc::new(ByteQueue::new(QUEUE_SIZE));

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let chunk: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
                let mut pushed = 0usize;
                while pushed < TEST_SIZE {
                    let n = chunk.len().min(TEST_SIZE - pushed);
                    q.push(&chunk[..n]).unwrap();
                    pushed += n;
                }
                q.shutdown();
                pushed
            })
        };

        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut received = 0usize;
                loop {
                    q.wait_until_full_or_shutdown();
                    received += q.pop().len();
                    if q.state() == QueueState::Shutdown {
                        // Grab the last bits, if any.
                        received += q.pop().len();
                        return received;
                    }
                }
            })
        };

        assert_eq!(producer.join().unwrap(), TEST_SIZE);
        assert_eq!(consumer.join().unwrap(), TEST_SIZE);
    }
}
