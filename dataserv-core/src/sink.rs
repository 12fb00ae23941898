//! Sink client handle: subscribes to a dataset and applies received
//! diffs against a private replica registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codec::Frame;
use crate::connection::Connection;
use crate::diff::Diff;
use crate::error::{Error, Result};
use crate::protocol::{
    FAST_TIMEOUT, NEGOTIATION_TIMEOUT, QUEUE_CAPACITY, READ_TIMEOUT, Role,
};
use crate::queue::BlockingDiffQueue;
use crate::streaming::{StreamToken, StreamingList};
use crate::value::DataValue;
use crate::worker::{WorkerContext, WorkerHandle};

/// Subscribes to one dataset name.
///
/// `pop` blocks the calling thread until the next diff arrives, then
/// merges it into the handle's replica registry and returns the
/// rebuilt value. Streaming containers are updated in place across
/// pops, so the registry preserves their identity for the lifetime of
/// the handle.
pub struct DataSink {
    worker: WorkerHandle,
    queue: Arc<BlockingDiffQueue>,
    registry: HashMap<StreamToken, StreamingList>,
    data: Option<DataValue>,
    dataset: String,
}

impl DataSink {
    /// Connect to the data server and subscribe to `dataset`.
    ///
    /// With `auto_reconnect`, a dropped connection is retried in the
    /// background until `disconnect`; without it, the first connection
    /// failure after connect becomes the terminal error surfaced by
    /// `pop`. A subscription to a dataset the server does not know yet
    /// is closed by the server; with `auto_reconnect` the sink simply
    /// keeps retrying until the dataset appears.
    pub fn connect(addr: SocketAddr, dataset: &str, auto_reconnect: bool) -> Result<DataSink> {
        if dataset.is_empty() {
            return Err(Error::ProtocolViolation("dataset name must not be empty"));
        }
        let queue = Arc::new(BlockingDiffQueue::new(QUEUE_CAPACITY));
        let worker_queue = queue.clone();
        let name = dataset.to_string();
        let worker = WorkerHandle::spawn("dataserv-sink", move |ctx| {
            sink_main(ctx, addr, name, worker_queue, auto_reconnect)
        })?;
        info!(%addr, %dataset, "sink connected");
        Ok(DataSink {
            worker,
            queue,
            registry: HashMap::new(),
            data: None,
            dataset: dataset.to_string(),
        })
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// The value rebuilt by the most recent successful `pop`.
    pub fn data(&self) -> Option<&DataValue> {
        self.data.as_ref()
    }

    /// Convenience lookup into map-valued data.
    pub fn get(&self, key: &str) -> Option<&DataValue> {
        self.data.as_ref().and_then(|v| v.get(key))
    }

    /// Block until the next update arrives, apply it, and return the
    /// rebuilt value. Fails with [`Error::Timeout`] if nothing arrives
    /// within `deadline`; with no deadline, blocks until an update or
    /// a terminal connection error.
    pub fn pop(&mut self, deadline: Option<Duration>) -> Result<&DataValue> {
        let diff = match self.queue.pop(deadline) {
            Ok(diff) => diff,
            Err(Error::ChannelClosed) => {
                return Err(self.worker.take_error().unwrap_or(Error::ChannelClosed));
            }
            Err(e) => return Err(e),
        };
        let value = diff.reconstruct(&mut self.registry)?;
        Ok(self.data.insert(value))
    }

    /// Disconnect and join the background worker.
    pub fn disconnect(mut self) {
        self.worker.shutdown();
    }
}

async fn sink_main(
    mut ctx: WorkerContext,
    addr: SocketAddr,
    dataset: String,
    queue: Arc<BlockingDiffQueue>,
    auto_reconnect: bool,
) -> Result<()> {
    let result = loop {
        match sink_session(&mut ctx, addr, &dataset, &queue).await {
            Ok(()) => break Ok(()),
            Err(e) if auto_reconnect && !ctx.cancel.is_cancelled() => {
                warn!(%dataset, error = %e, "sink connection lost, retrying");
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(FAST_TIMEOUT) => {}
                }
            }
            Err(e) => break Err(e),
        }
    };
    queue.close();
    result
}

async fn sink_session(
    ctx: &mut WorkerContext,
    addr: SocketAddr,
    dataset: &str,
    queue: &BlockingDiffQueue,
) -> Result<()> {
    let mut conn = Connection::connect(addr, NEGOTIATION_TIMEOUT).await?;
    conn.send_timeout(Frame::from(vec![Role::Sink.byte()]), NEGOTIATION_TIMEOUT)
        .await?;
    conn.send_timeout(
        Frame::from(dataset.as_bytes().to_vec()),
        NEGOTIATION_TIMEOUT,
    )
    .await?;
    ctx.ready();
    debug!(%dataset, "sink negotiation complete");

    loop {
        let frame = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                conn.close().await;
                return Ok(());
            }
            frame = conn.recv_timeout(READ_TIMEOUT) => frame?,
        };
        match frame {
            Frame::Keepalive => continue,
            Frame::Payload(bytes) => {
                let diff: Diff = bincode::deserialize(&bytes)?;
                queue.push(diff)?;
            }
        }
    }
}
