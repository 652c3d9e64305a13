//! Replication log and role state.

pub mod binlog;
pub mod segments;
pub mod state;

pub use binlog::{Binlog, ConsumerSink};
pub use state::{MasterLinkState, ReplicationState};
