//! Source client handle: publishes a dataset to the data server.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, info};

use crate::codec::Frame;
use crate::connection::Connection;
use crate::diff::Diff;
use crate::error::{Error, Result};
use crate::protocol::{
    FAST_TIMEOUT, KEEPALIVE_INTERVAL, NEGOTIATION_TIMEOUT, OPS_TIMEOUT, QUEUE_CAPACITY, Role,
};
use crate::queue::DiffQueue;
use crate::value::DataValue;
use crate::worker::{WorkerContext, WorkerHandle};

/// Publishes values for one dataset name.
///
/// `connect` performs the full negotiation before returning, so a
/// second source for an already-claimed dataset fails right away with
/// [`Error::SourceConflict`]. `push` never blocks on the network: it
/// encodes a diff and hands it to the background worker, coalescing
/// the outbound backlog if the link is slow.
#[derive(Debug)]
pub struct DataSource {
    worker: WorkerHandle,
    queue: Arc<DiffQueue>,
    dataset: String,
}

impl DataSource {
    /// Connect to the data server and claim `dataset`.
    pub fn connect(addr: SocketAddr, dataset: &str) -> Result<DataSource> {
        if dataset.is_empty() {
            return Err(Error::ProtocolViolation("dataset name must not be empty"));
        }
        let queue = Arc::new(DiffQueue::new(QUEUE_CAPACITY));
        let worker_queue = queue.clone();
        let name = dataset.to_string();
        let worker = WorkerHandle::spawn("dataserv-source", move |ctx| {
            source_main(ctx, addr, name, worker_queue)
        })?;
        info!(%addr, %dataset, "source connected");
        Ok(DataSource {
            worker,
            queue,
            dataset: dataset.to_string(),
        })
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Publish the current state of `value`, draining the mutation
    /// logs of every streaming container inside it.
    pub fn push(&self, value: &mut DataValue) -> Result<()> {
        if let Some(e) = self.worker.take_error() {
            return Err(e);
        }
        let diff = Diff::capture(value)?;
        self.queue.push(diff)
    }

    /// Disconnect and join the background worker.
    pub fn disconnect(mut self) {
        self.worker.shutdown();
    }
}

async fn source_main(
    mut ctx: WorkerContext,
    addr: SocketAddr,
    dataset: String,
    queue: Arc<DiffQueue>,
) -> Result<()> {
    let mut conn = Connection::connect(addr, NEGOTIATION_TIMEOUT).await?;
    conn.send_timeout(Frame::from(vec![Role::Source.byte()]), NEGOTIATION_TIMEOUT)
        .await?;
    conn.send_timeout(Frame::from(dataset.clone().into_bytes()), NEGOTIATION_TIMEOUT)
        .await?;

    // The server never sends to a source it accepted; it only closes
    // the socket when rejecting a conflicting one. A short grace
    // window catches that close. Real I/O failures in the window
    // surface as themselves, not as a conflict.
    match timeout(FAST_TIMEOUT, conn.recv()).await {
        Err(_) => {}
        Ok(Err(Error::ConnectionClosed)) | Ok(Err(Error::IncompleteStream { .. })) => {
            conn.close().await;
            return Err(Error::SourceConflict);
        }
        Ok(Err(e)) => {
            conn.close().await;
            return Err(e);
        }
        Ok(Ok(_)) => {
            conn.close().await;
            return Err(Error::ProtocolViolation(
                "unexpected frame during source negotiation",
            ));
        }
    }
    ctx.ready();
    debug!(%dataset, "source negotiation complete");

    loop {
        let next = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            next = timeout(KEEPALIVE_INTERVAL, queue.recv()) => next,
        };
        let frame = match next {
            Ok(diff) => Frame::from(bincode::serialize(&diff)?),
            Err(_) => Frame::Keepalive,
        };
        conn.send_timeout(frame, OPS_TIMEOUT).await?;
    }
    conn.close().await;
    Ok(())
}
