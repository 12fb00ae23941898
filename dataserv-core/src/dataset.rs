//! Per-dataset fan-out pipeline.
//!
//! A [`Dataset`] owns the canonical coalesced diff for one name plus
//! one bounded queue per attached sink. At most one source may be
//! attached at a time; sinks attach and detach freely. A sink that
//! cannot keep up has its backlog coalesced, and is force-disconnected
//! if even the coalesced backlog would exceed the mutation-record cap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::Frame;
use crate::connection::Connection;
use crate::diff::Diff;
use crate::error::{Error, Result};
use crate::protocol::{KEEPALIVE_INTERVAL, QUEUE_CAPACITY, READ_TIMEOUT, SINK_SEND_TIMEOUT};
use crate::queue::DiffQueue;

#[derive(Debug)]
struct SinkSlot {
    id: u64,
    queue: Arc<DiffQueue>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Shared {
    source_active: bool,
    canonical: Diff,
    sinks: Vec<SinkSlot>,
}

/// The pipeline for one dataset name.
#[derive(Debug)]
pub struct Dataset {
    name: String,
    shared: Mutex<Shared>,
    next_sink_id: AtomicU64,
}

impl Dataset {
    pub fn new(name: impl Into<String>) -> Self {
        Dataset {
            name: name.into(),
            shared: Mutex::new(Shared::default()),
            next_sink_id: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_source(&self) -> bool {
        self.lock().source_active
    }

    pub fn sink_count(&self) -> usize {
        self.lock().sinks.len()
    }

    // ── Source side ──────────────────────────────────────────────

    /// Run the ingest loop for a negotiated source connection until
    /// the peer disconnects, times out, or `cancel` fires. Fails with
    /// [`Error::SourceConflict`] if a source is already attached.
    pub async fn run_source(&self, mut conn: Connection, cancel: CancellationToken) -> Result<()> {
        if let Err(e) = self.claim_source() {
            // Closing right away is the rejection signal the peer sees.
            conn.close().await;
            return Err(e);
        }
        info!(dataset = %self.name, peer = %conn.peer_addr(), "source attached");
        let result = self.ingest(&mut conn, &cancel).await;
        self.release_source();
        conn.close().await;
        match &result {
            Ok(()) => info!(dataset = %self.name, "source detached"),
            Err(e) => info!(dataset = %self.name, error = %e, "source detached"),
        }
        result
    }

    fn claim_source(&self) -> Result<()> {
        let mut shared = self.lock();
        if shared.source_active {
            return Err(Error::SourceConflict);
        }
        shared.source_active = true;
        // A new source starts a new history; stale state must not leak
        // into the first diff it publishes.
        shared.canonical = Diff::new();
        Ok(())
    }

    fn release_source(&self) {
        self.lock().source_active = false;
    }

    async fn ingest(&self, conn: &mut Connection, cancel: &CancellationToken) -> Result<()> {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = conn.recv_timeout(READ_TIMEOUT) => frame?,
            };
            match frame {
                Frame::Keepalive => continue,
                Frame::Payload(bytes) => {
                    let diff: Diff = bincode::deserialize(&bytes)?;
                    self.publish(diff);
                }
            }
        }
    }

    /// Squash a freshly received diff into the canonical state and
    /// fan it out to every attached sink. A sink whose backlog cannot
    /// absorb the diff is force-disconnected; the source and all other
    /// sinks are unaffected.
    fn publish(&self, diff: Diff) {
        let mut shared = self.lock();
        shared.canonical.squash(diff.clone());
        let name = &self.name;
        shared.sinks.retain(|slot| match slot.queue.push(diff.clone()) {
            Ok(()) => true,
            Err(e) => {
                warn!(dataset = %name, sink = slot.id, error = %e, "dropping sink");
                slot.cancel.cancel();
                false
            }
        });
    }

    // ── Sink side ────────────────────────────────────────────────

    /// Run the serving loop for a negotiated sink connection until the
    /// send path fails or `cancel` fires. The current canonical state
    /// is queued up front so a late sink starts from the full state.
    pub async fn run_sink(&self, mut conn: Connection, cancel: CancellationToken) -> Result<()> {
        let (id, queue, sink_cancel) = self.attach_sink(&cancel);
        info!(dataset = %self.name, sink = id, peer = %conn.peer_addr(), "sink attached");
        let result = self.serve_sink(&mut conn, &queue, &sink_cancel).await;
        self.detach_sink(id);
        conn.close().await;
        debug!(dataset = %self.name, sink = id, "sink detached");
        result
    }

    fn attach_sink(&self, parent: &CancellationToken) -> (u64, Arc<DiffQueue>, CancellationToken) {
        let id = self.next_sink_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(DiffQueue::new(QUEUE_CAPACITY));
        let cancel = parent.child_token();
        let mut shared = self.lock();
        if !shared.canonical.is_empty() {
            // Cannot fail: the queue is empty and the canonical diff
            // already passed the cap when it was coalesced.
            let _ = queue.push(shared.canonical.clone());
        }
        shared.sinks.push(SinkSlot {
            id,
            queue: queue.clone(),
            cancel: cancel.clone(),
        });
        (id, queue, cancel)
    }

    fn detach_sink(&self, id: u64) {
        self.lock().sinks.retain(|slot| slot.id != id);
    }

    async fn serve_sink(
        &self,
        conn: &mut Connection,
        queue: &DiffQueue,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = timeout(KEEPALIVE_INTERVAL, queue.recv()) => next,
            };
            match next {
                Ok(diff) => {
                    let bytes = bincode::serialize(&diff)?;
                    conn.send_timeout(Frame::from(bytes), SINK_SEND_TIMEOUT).await?;
                }
                Err(_) => {
                    conn.send_timeout(Frame::Keepalive, SINK_SEND_TIMEOUT).await?;
                }
            }
        }
    }
}
