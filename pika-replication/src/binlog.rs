//! Append-only write log that feeds slaves.
//!
//! Every successful write command is appended as one `[u32 LE length][payload]` record to the
//! newest `write2file<N>` segment. The log rolls to `N + 1` once a record would push the segment
//! past the configured size. Consumers attach at a `(filenum, offset)` position: they first get
//! every record between that position and the producer cursor, then each live append.
//!
//! Bytes below the producer cursor never change, so backlog replay reads segments without the
//! log lock; only the final catch-up and registration run under it.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use pika_common::error::{PikaError, PikaResult};
use pika_common::ids::{LogPosition, SegmentNumber};
use tracing::{debug, info, warn};

use crate::segments::{list_segments, segment_count, segment_path};

const RECORD_HEADER_LEN: u64 = 4;
const UNLOCKED_CATCH_UP_ROUNDS: usize = 4;

/// Receiver of binlog records, typically a slave connection.
pub trait ConsumerSink: Send + Sync {
    /// Called once the start position is accepted, before replay.
    fn on_attached(&self, position: LogPosition);

    /// Delivers one record payload. Returning `false` detaches the consumer.
    fn deliver(&self, record: &[u8]) -> bool;
}

struct BinlogInner {
    position: LogPosition,
    file: File,
    consumers: Vec<Arc<dyn ConsumerSink>>,
}

/// Segment-file binlog shared by writers and slave consumers.
pub struct Binlog {
    dir: PathBuf,
    segment_size: u64,
    inner: Mutex<BinlogInner>,
}

impl fmt::Debug for Binlog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binlog")
            .field("dir", &self.dir)
            .field("segment_size", &self.segment_size)
            .finish_non_exhaustive()
    }
}

impl Binlog {
    /// Opens the log in `dir`, continuing the highest-numbered segment.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Io` when the directory or segment cannot be opened.
    pub fn open(dir: impl AsRef<Path>, segment_size: u64) -> PikaResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|error| PikaError::io(&format!("create log dir {}", dir.display()), &error))?;

        let filenum = list_segments(&dir)?
            .last()
            .map_or(0, |segment| segment.number);
        let (file, offset) = open_segment(&dir, filenum)?;
        info!(dir = %dir.display(), filenum, offset, "binlog opened");

        Ok(Self {
            dir,
            segment_size,
            inner: Mutex::new(BinlogInner {
                position: LogPosition::new(filenum, offset),
                file,
                consumers: Vec::new(),
            }),
        })
    }

    /// Log directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current write cursor: the position the next record will start at.
    #[must_use]
    pub fn producer_position(&self) -> LogPosition {
        self.inner.lock().position
    }

    /// Number of the segment currently written.
    #[must_use]
    pub fn current_filenum(&self) -> SegmentNumber {
        self.inner.lock().position.filenum
    }

    /// Number of attached consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    /// Number of segment files on disk.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Io` when the log directory cannot be read.
    pub fn segment_count(&self) -> PikaResult<usize> {
        segment_count(&self.dir)
    }

    /// Appends one record and streams it to every attached consumer.
    ///
    /// Consumers whose sink refuses the record are detached.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Io` when the segment cannot be written or rolled.
    pub fn append(&self, payload: &[u8]) -> PikaResult<LogPosition> {
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| PikaError::Replication("binlog record exceeds u32::MAX".to_owned()))?;
        let record_len = RECORD_HEADER_LEN + u64::from(payload_len);

        let mut inner = self.inner.lock();
        if inner.position.offset > 0 && inner.position.offset + record_len > self.segment_size {
            self.roll(&mut inner)?;
        }

        let mut record = Vec::with_capacity(payload.len() + 4);
        record.extend_from_slice(&payload_len.to_le_bytes());
        record.extend_from_slice(payload);
        let offset = inner.position.offset;
        write_record(&mut inner.file, offset, &record)
            .map_err(|error| PikaError::io("append binlog record", &error))?;
        inner.position.offset += record_len;

        let before = inner.consumers.len();
        inner.consumers.retain(|sink| sink.deliver(payload));
        let detached = before - inner.consumers.len();
        if detached > 0 {
            debug!(detached, "binlog consumers detached");
        }
        Ok(inner.position)
    }

    /// Attaches `sink` at `position`, replays the backlog up to the producer cursor and keeps it
    /// for live records.
    ///
    /// The backlog is read and delivered without the log lock, so appends keep running during a
    /// long replay. The last few records are delivered under the lock right before the sink is
    /// registered, which keeps the stream gap-free and in order.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Replication` when the position is ahead of the producer, lies in a
    /// purged segment, is not a record boundary, or when the sink refuses a replayed record.
    /// Nothing is registered on error.
    pub fn add_consumer(
        &self,
        position: LogPosition,
        sink: Arc<dyn ConsumerSink>,
    ) -> PikaResult<()> {
        let producer = self.producer_position();
        if position > producer {
            return Err(PikaError::Replication(format!(
                "position {position} is ahead of producer {producer}"
            )));
        }

        let backlog = self.read_records(position, producer)?;
        sink.on_attached(position);
        let mut replayed = replay(sink.as_ref(), &backlog, position)?;
        let mut cursor = producer;
        for _ in 0..UNLOCKED_CATCH_UP_ROUNDS {
            let producer = self.producer_position();
            if producer == cursor {
                break;
            }
            let tail = self.read_records(cursor, producer)?;
            replayed += replay(sink.as_ref(), &tail, position)?;
            cursor = producer;
        }

        let mut inner = self.inner.lock();
        let tail = self.read_records(cursor, inner.position)?;
        replayed += replay(sink.as_ref(), &tail, position)?;
        inner.consumers.push(sink);
        info!(%position, replayed, "binlog consumer attached");
        Ok(())
    }

    fn roll(&self, inner: &mut BinlogInner) -> PikaResult<()> {
        inner
            .file
            .sync_data()
            .map_err(|error| PikaError::io("sync binlog segment", &error))?;
        let next = inner.position.filenum + 1;
        let (file, offset) = open_segment(&self.dir, next)?;
        inner.file = file;
        inner.position = LogPosition::new(next, offset);
        info!(filenum = next, "binlog rolled to new segment");
        Ok(())
    }

    fn read_records(&self, from: LogPosition, to: LogPosition) -> PikaResult<Vec<Vec<u8>>> {
        let mut records = Vec::new();
        for filenum in from.filenum..=to.filenum {
            let path = segment_path(&self.dir, filenum);
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    return Err(PikaError::Replication(format!(
                        "segment {filenum} is no longer available"
                    )));
                }
                Err(error) => {
                    return Err(PikaError::io(&format!("read {}", path.display()), &error));
                }
            };
            let start = if filenum == from.filenum { from.offset } else { 0 };
            let end = if filenum == to.filenum {
                to.offset
            } else {
                bytes.len() as u64
            };
            parse_records(&bytes, start, end, filenum, &mut records)?;
        }
        Ok(records)
    }
}

fn replay(
    sink: &dyn ConsumerSink,
    records: &[Vec<u8>],
    position: LogPosition,
) -> PikaResult<usize> {
    for record in records {
        if !sink.deliver(record) {
            warn!(%position, "consumer closed during backlog replay");
            return Err(PikaError::Replication(
                "consumer closed during backlog replay".to_owned(),
            ));
        }
    }
    Ok(records.len())
}

/// Segment file that can be cut back to a record boundary.
trait SegmentFile: Write {
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl SegmentFile for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Writes one record at `offset`; a failed write is cut back so the segment ends on a record
/// boundary again.
fn write_record(file: &mut impl SegmentFile, offset: u64, record: &[u8]) -> io::Result<()> {
    let Err(error) = file.write_all(record) else {
        return Ok(());
    };
    if let Err(truncate_error) = file.truncate_to(offset) {
        warn!(offset, %truncate_error, "torn binlog record could not be truncated");
    }
    Err(error)
}

fn open_segment(dir: &Path, filenum: SegmentNumber) -> PikaResult<(File, u64)> {
    let path = segment_path(dir, filenum);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|error| PikaError::io(&format!("open segment {}", path.display()), &error))?;
    let offset = file
        .metadata()
        .map_err(|error| PikaError::io(&format!("stat segment {}", path.display()), &error))?
        .len();
    Ok((file, offset))
}

fn parse_records(
    bytes: &[u8],
    start: u64,
    end: u64,
    filenum: SegmentNumber,
    records: &mut Vec<Vec<u8>>,
) -> PikaResult<()> {
    let boundary_error = || {
        PikaError::Replication(format!(
            "offset {start} in segment {filenum} is not a record boundary"
        ))
    };
    let end = usize::try_from(end.min(bytes.len() as u64)).map_err(|_| boundary_error())?;
    let mut cursor = usize::try_from(start).map_err(|_| boundary_error())?;
    if cursor > end {
        return Err(boundary_error());
    }

    while cursor < end {
        let header_end = cursor + 4;
        if header_end > end {
            return Err(boundary_error());
        }
        let mut header = [0_u8; 4];
        header.copy_from_slice(&bytes[cursor..header_end]);
        let len = usize::try_from(u32::from_le_bytes(header)).map_err(|_| boundary_error())?;
        let record_end = header_end + len;
        if record_end > end {
            return Err(boundary_error());
        }
        records.push(bytes[header_end..record_end].to_vec());
        cursor = record_end;
    }
    Ok(())
}
