//! Bounded diff queues with overflow coalescing.
//!
//! When a queue is full the whole backlog is squashed together with
//! the incoming diff into a single entry. Squashing is associative, so
//! a slow consumer sees the same final state it would have seen diff
//! by diff, just with fewer intermediate steps. If even the coalesced
//! entry exceeds the mutation-record cap the push fails and the
//! offending consumer is disconnected by its owner.
//!
//! [`DiffQueue`] hands off to an async consumer, [`BlockingDiffQueue`]
//! to a plain thread. Producers are synchronous in both cases so a
//! push never suspends the pipeline.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::diff::Diff;
use crate::error::{Error, Result};
use crate::protocol::MAX_DIFF_OPS;

fn coalesce(deque: &mut VecDeque<Diff>, incoming: Diff, capacity: usize) -> Result<()> {
    if deque.len() < capacity {
        deque.push_back(incoming);
        return Ok(());
    }
    let mut squashed = Diff::new();
    for diff in deque.drain(..) {
        squashed.squash(diff);
    }
    squashed.squash(incoming);
    let ops = squashed.op_count();
    if ops > MAX_DIFF_OPS {
        return Err(Error::CapacityExceeded {
            ops,
            max: MAX_DIFF_OPS,
        });
    }
    deque.push_back(squashed);
    Ok(())
}

// ── DiffQueue ────────────────────────────────────────────────────

/// Bounded diff queue with a synchronous producer and an async
/// consumer.
#[derive(Debug)]
pub struct DiffQueue {
    inner: Mutex<VecDeque<Diff>>,
    notify: Notify,
    capacity: usize,
}

impl DiffQueue {
    pub fn new(capacity: usize) -> Self {
        DiffQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a diff, coalescing the backlog if the queue is full.
    pub fn push(&self, diff: Diff) -> Result<()> {
        let mut deque = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        coalesce(&mut deque, diff, self.capacity)?;
        drop(deque);
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue the oldest diff, waiting until one is available.
    pub async fn recv(&self) -> Diff {
        loop {
            {
                let mut deque = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(diff) = deque.pop_front() {
                    return diff;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── BlockingDiffQueue ────────────────────────────────────────────

#[derive(Debug, Default)]
struct BlockingInner {
    deque: VecDeque<Diff>,
    closed: bool,
}

/// Bounded diff queue with a synchronous producer and a blocking
/// consumer thread. `close()` wakes every waiting consumer so a dead
/// producer never leaves a consumer hanging.
#[derive(Debug)]
pub struct BlockingDiffQueue {
    inner: Mutex<BlockingInner>,
    available: Condvar,
    capacity: usize,
}

impl BlockingDiffQueue {
    pub fn new(capacity: usize) -> Self {
        BlockingDiffQueue {
            inner: Mutex::new(BlockingInner::default()),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue a diff, coalescing the backlog if the queue is full.
    /// Fails with [`Error::ChannelClosed`] after `close()`.
    pub fn push(&self, diff: Diff) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return Err(Error::ChannelClosed);
        }
        coalesce(&mut inner.deque, diff, self.capacity)?;
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Block until a diff is available or `deadline` elapses. With no
    /// deadline, blocks until a diff arrives or the queue is closed.
    /// The deadline is absolute: wakeups that yield no data do not
    /// extend it.
    pub fn pop(&self, deadline: Option<Duration>) -> Result<Diff> {
        let expires = deadline.map(|dur| (dur, Instant::now() + dur));
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(diff) = inner.deque.pop_front() {
                return Ok(diff);
            }
            if inner.closed {
                return Err(Error::ChannelClosed);
            }
            match expires {
                Some((dur, at)) => {
                    let now = Instant::now();
                    if now >= at {
                        return Err(Error::Timeout(dur));
                    }
                    let (guard, _) = self
                        .available
                        .wait_timeout(inner, at - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    inner = guard;
                }
                None => {
                    inner = self
                        .available
                        .wait(inner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Mark the queue closed and wake all consumers. Already-queued
    /// diffs remain poppable.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.closed = true;
        drop(inner);
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .deque
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
