//! Command model and dispatch shared by the network layer and replication replay.

pub mod command;
pub mod dispatch;
