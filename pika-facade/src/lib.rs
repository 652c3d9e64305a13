//! Facade layer abstractions for RESP framing and connection parser state.

pub mod connection;
pub mod protocol;
