//! Connection-scoped context and streaming parser state.

use std::net::SocketAddr;

use pika_common::error::PikaResult;

use crate::protocol::{Frame, ParseStatus, parse_next_frame};

/// Per-connection execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    /// Remote socket address.
    pub peer: SocketAddr,
}

impl ConnectionContext {
    /// Returns the `ip:port` text used as the client registry key.
    #[must_use]
    pub fn peer_label(&self) -> String {
        self.peer.to_string()
    }
}

/// Per-socket state used while reading client bytes.
///
/// The parser keeps unread bytes in a buffer and repeatedly tries to extract complete frames as
/// new network chunks arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    /// Stable connection metadata.
    pub context: ConnectionContext,
    /// Bytes received but not yet consumed by frame parsing.
    read_buffer: Vec<u8>,
}

impl ConnectionState {
    /// Creates a parser state object for one connection.
    #[must_use]
    pub fn new(context: ConnectionContext) -> Self {
        Self {
            context,
            read_buffer: Vec::new(),
        }
    }

    /// Appends newly received network bytes into the connection buffer.
    pub fn feed_bytes(&mut self, bytes: &[u8]) {
        self.read_buffer.extend_from_slice(bytes);
    }

    /// Tries to decode one frame from buffered bytes.
    ///
    /// Returns `Ok(None)` when more bytes are required.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Protocol` when buffered bytes violate RESP framing rules. The buffer
    /// is left untouched; callers close the connection.
    pub fn try_pop_frame(&mut self) -> PikaResult<Option<Frame>> {
        match parse_next_frame(&self.read_buffer)? {
            ParseStatus::Incomplete => Ok(None),
            ParseStatus::Complete { frame, consumed } => {
                self.read_buffer.drain(..consumed);
                Ok(Some(frame))
            }
        }
    }

    /// Returns the number of pending bytes still waiting to be parsed.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.read_buffer.len()
    }
}
