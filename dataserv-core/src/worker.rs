//! Background worker bridge for the client handles.
//!
//! Each client handle owns a dedicated OS thread running a
//! current-thread tokio runtime. The owning thread and the worker
//! never touch each other's state directly; they communicate through
//! thread-safe queues, a one-shot ready signal, and a shared
//! last-error slot.

use std::future::Future;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::NEGOTIATION_TIMEOUT;

/// Handed to the worker task; `ready()` unblocks the spawning thread
/// once setup (connect + negotiation) has succeeded.
pub(crate) struct WorkerContext {
    pub cancel: CancellationToken,
    ready: Option<mpsc::Sender<std::result::Result<(), ()>>>,
}

impl WorkerContext {
    /// Signal successful setup. Later calls are no-ops.
    pub fn ready(&mut self) {
        if let Some(tx) = self.ready.take() {
            let _ = tx.send(Ok(()));
        }
    }
}

/// Owner-side handle to a worker thread. Dropping the handle cancels
/// the worker and joins the thread.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    thread: Option<thread::JoinHandle<()>>,
    cancel: CancellationToken,
    last_error: Arc<Mutex<Option<Error>>>,
}

impl WorkerHandle {
    /// Spawn `task` on its own thread and block until it signals ready
    /// or fails setup. A task that errors out before calling
    /// [`WorkerContext::ready`] turns into the returned error.
    pub fn spawn<F, Fut>(name: &str, task: F) -> Result<WorkerHandle>
    where
        F: FnOnce(WorkerContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::channel();
        let cancel = CancellationToken::new();
        let last_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

        let worker_cancel = cancel.clone();
        let worker_error = last_error.clone();
        let fail_tx = ready_tx.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        store(&worker_error, e.into());
                        let _ = fail_tx.send(Err(()));
                        return;
                    }
                };
                let ctx = WorkerContext {
                    cancel: worker_cancel,
                    ready: Some(ready_tx),
                };
                if let Err(e) = rt.block_on(task(ctx)) {
                    debug!(error = %e, "worker ended with error");
                    store(&worker_error, e);
                }
                // Wakes the spawner if the task died before ready().
                let _ = fail_tx.send(Err(()));
            })
            .map_err(Error::Connection)?;

        let handle = WorkerHandle {
            thread: Some(thread),
            cancel,
            last_error,
        };
        match ready_rx.recv_timeout(NEGOTIATION_TIMEOUT) {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(())) => Err(handle
                .take_error()
                .unwrap_or(Error::ChannelClosed)),
            Err(_) => Err(Error::Timeout(NEGOTIATION_TIMEOUT)),
        }
    }

    /// Take the worker's terminal error, if it has one.
    pub fn take_error(&self) -> Option<Error> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Cancel the worker and join its thread.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn store(slot: &Mutex<Option<Error>>, error: Error) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn spawn_waits_for_ready() {
        let worker = WorkerHandle::spawn("test-ready", |mut ctx| async move {
            ctx.ready();
            ctx.cancel.cancelled().await;
            Ok(())
        })
        .unwrap();
        drop(worker);
    }

    #[test]
    fn setup_failure_propagates() {
        let err = WorkerHandle::spawn("test-fail", |_ctx| async move {
            Err(Error::NotConnected)
        })
        .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[test]
    fn late_error_is_stored() {
        let worker = WorkerHandle::spawn("test-late", |mut ctx| async move {
            ctx.ready();
            Err(Error::ConnectionClosed)
        })
        .unwrap();
        // Worker exits on its own; give it a moment.
        std::thread::sleep(Duration::from_millis(50));
        assert!(matches!(
            worker.take_error(),
            Some(Error::ConnectionClosed)
        ));
    }
}
