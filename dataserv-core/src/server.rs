//! The data server: accept loop, negotiation, and the dataset
//! registry.
//!
//! Each accepted connection is classified exactly once by its
//! negotiation frame and then handed to the matching pipeline role.
//! Protocol violations terminate only the offending connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::Frame;
use crate::connection::Connection;
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::protocol::{NEGOTIATION_TIMEOUT, Role};

#[derive(Debug, Default)]
struct Registry {
    datasets: HashMap<String, Arc<Dataset>>,
    local_port: Option<u16>,
}

/// A data server instance. Cheap to clone; all clones share the same
/// registry and shutdown token.
#[derive(Debug, Clone, Default)]
pub struct DataServer {
    registry: Arc<Mutex<Registry>>,
    cancel: CancellationToken,
}

impl DataServer {
    pub fn new() -> Self {
        DataServer::default()
    }

    /// Bind `addr` and accept connections until [`stop`] is called.
    /// Every outstanding connection task is awaited before returning.
    ///
    /// [`stop`]: DataServer::stop
    pub async fn serve_forever(&self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        self.lock().local_port = Some(local.port());
        info!(addr = %local, "data server listening");

        let mut conns: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let server = self.clone();
                        conns.spawn(async move {
                            if let Err(e) = server.handle_connection(stream).await {
                                debug!(%peer, error = %e, "connection ended");
                            }
                        });
                    }
                    // Transient conditions like ECONNABORTED or fd
                    // exhaustion must not take the whole server down.
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
            }
        }

        info!("data server shutting down");
        drop(listener);
        conns.shutdown().await;
        Ok(())
    }

    /// Request shutdown: the accept loop stops and every connection
    /// task is cancelled.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Names of every known dataset.
    pub fn dataset_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().datasets.keys().cloned().collect();
        names.sort();
        names
    }

    /// The bound port, once [`serve_forever`] has bound its listener.
    /// Useful when binding port 0.
    ///
    /// [`serve_forever`]: DataServer::serve_forever
    pub fn local_port(&self) -> Option<u16> {
        self.lock().local_port
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Negotiation ──────────────────────────────────────────────

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let mut conn = Connection::new(stream)?;
        let role = match self.negotiate(&mut conn).await {
            Ok(role) => role,
            Err(e) => {
                warn!(peer = %conn.peer_addr(), error = %e, "negotiation failed");
                conn.close().await;
                return Err(e);
            }
        };
        match role {
            Role::Info => self.handle_info(conn).await,
            Role::Source => self.handle_source(conn).await,
            Role::Sink => self.handle_sink(conn).await,
        }
    }

    async fn negotiate(&self, conn: &mut Connection) -> Result<Role> {
        let frame = conn.recv_timeout(NEGOTIATION_TIMEOUT).await?;
        match frame {
            Frame::Payload(bytes) if bytes.len() == 1 => Role::try_from(bytes[0]),
            _ => Err(Error::ProtocolViolation("negotiation frame must be one byte")),
        }
    }

    async fn recv_dataset_name(&self, conn: &mut Connection) -> Result<String> {
        match conn.recv_timeout(NEGOTIATION_TIMEOUT).await? {
            Frame::Payload(bytes) => Ok(String::from_utf8(bytes.to_vec())?),
            Frame::Keepalive => Err(Error::ProtocolViolation("dataset name must not be empty")),
        }
    }

    async fn handle_info(&self, mut conn: Connection) -> Result<()> {
        let names = self.dataset_names().join(",");
        debug!(peer = %conn.peer_addr(), "info request");
        let result = conn
            .send_timeout(Frame::from(Bytes::from(names)), NEGOTIATION_TIMEOUT)
            .await;
        conn.close().await;
        result
    }

    async fn handle_source(&self, mut conn: Connection) -> Result<()> {
        let name = match self.recv_dataset_name(&mut conn).await {
            Ok(name) => name,
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };
        let dataset = {
            let mut reg = self.lock();
            reg.datasets
                .entry(name.clone())
                .or_insert_with(|| Arc::new(Dataset::new(name.clone())))
                .clone()
        };
        // A conflicting source is simply closed; the surviving source
        // is untouched and the rejected client detects the close.
        dataset.run_source(conn, self.cancel.child_token()).await
    }

    async fn handle_sink(&self, mut conn: Connection) -> Result<()> {
        let name = match self.recv_dataset_name(&mut conn).await {
            Ok(name) => name,
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };
        let dataset = self.lock().datasets.get(&name).cloned();
        match dataset {
            Some(dataset) => dataset.run_sink(conn, self.cancel.child_token()).await,
            None => {
                warn!(peer = %conn.peer_addr(), %name, "sink requested unknown dataset");
                conn.close().await;
                Ok(())
            }
        }
    }
}
