//! dataserv-core: a TCP pub/sub service for evolving structured data.
//!
//! One source publishes a named dataset; any number of sinks subscribe
//! and receive incremental updates with at-most-the-latest-state
//! delivery. Large mutable collections travel as deltas via
//! [`StreamingList`] mutation logs, and slow consumers are handled by
//! coalescing their backlog rather than buffering without bound.
//!
//! Embed the server with [`DataServer`], publish with [`DataSource`],
//! and subscribe with [`DataSink`].

pub mod codec;
pub mod connection;
pub mod dataset;
pub mod diff;
pub mod error;
pub mod info;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod sink;
pub mod source;
pub mod streaming;
pub mod value;

mod worker;

pub use codec::{Frame, FrameCodec};
pub use connection::Connection;
pub use diff::Diff;
pub use error::{Error, Result};
pub use info::dataset_list;
pub use protocol::{DATASERV_PORT, Role};
pub use server::DataServer;
pub use sink::DataSink;
pub use source::DataSource;
pub use streaming::{ListOp, StreamToken, StreamingList};
pub use value::DataValue;
