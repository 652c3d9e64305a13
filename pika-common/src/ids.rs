//! Canonical identifier types shared by the reactor, workers, storage and replication.

use std::fmt;

/// Index of one worker thread inside the fixed pool.
pub type WorkerIndex = usize;

/// Numeric sequence of one binlog segment (`write2file<N>`).
pub type SegmentNumber = u32;

/// Write position inside the append-only binlog.
///
/// Ordering is lexicographic: first by segment, then by byte offset inside the segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogPosition {
    /// Segment file number.
    pub filenum: SegmentNumber,
    /// Byte offset inside the segment.
    pub offset: u64,
}

impl LogPosition {
    /// Creates one log position.
    #[must_use]
    pub const fn new(filenum: SegmentNumber, offset: u64) -> Self {
        Self { filenum, offset }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filenum, self.offset)
    }
}

/// Role of one connection as seen by the client registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ClientRole {
    /// Regular client connection.
    #[default]
    Normal,
    /// Outbound link from this node to its master.
    Master,
    /// Inbound link from a slave that completed the sync handshake.
    Slave,
}

impl ClientRole {
    /// Returns the lowercase label used in status output.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Master => "master",
            Self::Slave => "slave",
        }
    }
}
