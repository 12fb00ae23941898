//! Framed TCP connection primitive.
//!
//! Wraps a `TcpStream` in the dataserv [`FrameCodec`] and exposes the
//! send/recv contract with explicit deadlines. Every timeout surfaces
//! as [`Error::Timeout`]; a clean peer close between frames surfaces
//! as [`Error::ConnectionClosed`].

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::trace;

use crate::codec::{Frame, FrameCodec};
use crate::error::{Error, Result};

/// A framed, bidirectional dataserv connection.
#[derive(Debug)]
pub struct Connection {
    framed: Framed<TcpStream, FrameCodec>,
    peer: SocketAddr,
}

impl Connection {
    /// Wrap an accepted stream.
    pub fn new(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Connection {
            framed: Framed::new(stream, FrameCodec),
            peer,
        })
    }

    /// Dial a server with a bounded connect deadline.
    pub async fn connect(addr: SocketAddr, deadline: Duration) -> Result<Self> {
        let stream = timeout(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ServerUnreachable {
                addr: addr.to_string(),
            })?
            .map_err(|_| Error::ServerUnreachable {
                addr: addr.to_string(),
            })?;
        Connection::new(stream)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.framed.get_ref().local_addr()?)
    }

    /// Send one frame: length header and payload in one logical write.
    pub async fn send(&mut self, frame: Frame) -> Result<()> {
        trace!(peer = %self.peer, len = frame.len(), "send frame");
        self.framed.send(frame).await
    }

    /// Send one frame, failing with [`Error::Timeout`] past `deadline`.
    pub async fn send_timeout(&mut self, frame: Frame, deadline: Duration) -> Result<()> {
        timeout(deadline, self.send(frame))
            .await
            .map_err(|_| Error::Timeout(deadline))?
    }

    /// Receive the next frame, blocking until a full frame arrives.
    pub async fn recv(&mut self) -> Result<Frame> {
        match self.framed.next().await {
            Some(Ok(frame)) => {
                trace!(peer = %self.peer, len = frame.len(), "recv frame");
                Ok(frame)
            }
            Some(Err(e)) => Err(e),
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Receive the next frame, failing with [`Error::Timeout`] past
    /// `deadline`.
    pub async fn recv_timeout(&mut self, deadline: Duration) -> Result<Frame> {
        timeout(deadline, self.recv())
            .await
            .map_err(|_| Error::Timeout(deadline))?
    }

    /// Flush pending output and shut the socket down. Errors during
    /// teardown are ignored; close is idempotent from the peer's view.
    pub async fn close(mut self) {
        let _ = self.framed.flush().await;
        let _ = self.framed.get_mut().shutdown().await;
    }
}
