//! Protocol constants and the connection-role negotiation codes.
//!
//! Every dataserv connection starts with a single negotiation frame
//! whose one-byte payload fixes the connection's [`Role`] for its whole
//! lifetime. Roles use proper enums with `TryFrom` — no panics on
//! unknown values.

use std::fmt;
use std::time::Duration;

use crate::error::Error;

/// Default TCP port of the data server.
pub const DATASERV_PORT: u16 = 30101;

/// Interval at which an idle sender emits an empty keepalive frame.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);

/// Time a sender is allowed to spend doing work before its peer may
/// give up on it.
pub const OPS_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall receive deadline: keepalive interval + ops allowance + margin.
pub const READ_TIMEOUT: Duration = Duration::from_secs(3 + 10 + 1);

/// Deadline for send/recv operations during the negotiation phase.
pub const NEGOTIATION_TIMEOUT: Duration = READ_TIMEOUT;

/// Retry / grace interval for quick operations.
pub const FAST_TIMEOUT: Duration = Duration::from_secs(1);

/// Deadline for one outbound send on a sink connection (ops / 4).
pub const SINK_SEND_TIMEOUT: Duration = Duration::from_millis(2500);

/// Capacity of every per-peer diff queue.
pub const QUEUE_CAPACITY: usize = 5;

/// Maximum number of mutation records a coalesced diff backlog may
/// hold before the offending peer is disconnected.
pub const MAX_DIFF_OPS: usize = 10_000;

// ── Role ─────────────────────────────────────────────────────────

/// The role a client negotiates at connection time. Fixed for the
/// lifetime of the TCP connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The client requests general information about the server.
    Info = 0xDE,
    /// The client will publish data for one data set.
    Source = 0xBE,
    /// The client will receive data from one data set.
    Sink = 0xEF,
}

impl Role {
    /// The negotiation byte carried on the wire.
    pub fn byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Role {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0xDE => Ok(Role::Info),
            0xBE => Ok(Role::Source),
            0xEF => Ok(Role::Sink),
            _ => Err(Error::UnknownRole { value }),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Info => write!(f, "info"),
            Role::Source => write!(f, "source"),
            Role::Sink => write!(f, "sink"),
        }
    }
}
