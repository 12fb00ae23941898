//! Info queries against a running data server.

use std::net::SocketAddr;

use crate::codec::Frame;
use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::{NEGOTIATION_TIMEOUT, Role};

/// Ask a data server for the names of the datasets it knows.
pub async fn dataset_list(addr: SocketAddr) -> Result<Vec<String>> {
    let mut conn = Connection::connect(addr, NEGOTIATION_TIMEOUT).await?;
    conn.send_timeout(Frame::from(vec![Role::Info.byte()]), NEGOTIATION_TIMEOUT)
        .await?;
    let frame = conn.recv_timeout(NEGOTIATION_TIMEOUT).await?;
    conn.close().await;
    match frame {
        // No datasets joins to an empty payload.
        Frame::Keepalive => Ok(Vec::new()),
        Frame::Payload(bytes) => {
            let joined = String::from_utf8(bytes.to_vec())?;
            Ok(joined.split(',').map(String::from).collect())
        }
    }
}
