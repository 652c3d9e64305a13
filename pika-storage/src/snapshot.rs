//! Binary snapshot codec used by checkpoints and backups.

use pika_common::error::{PikaError, PikaResult};

use crate::keyspace::Keyspace;

/// Fixed magic marker at the beginning of every snapshot payload.
const SNAPSHOT_MAGIC: &[u8; 8] = b"PIKASNAP";
/// Current storage snapshot format version.
const SNAPSHOT_VERSION: u16 = 1;

const FAMILY_STRING: u8 = 0;
const FAMILY_HASH: u8 = 1;
const FAMILY_LIST: u8 = 2;
const FAMILY_SET: u8 = 3;
const FAMILY_ZSET: u8 = 4;

/// Encodes every family of a keyspace into storage bytes.
///
/// Each record is `family:u8`, then length-prefixed key, field and value. Strings and list
/// elements leave the field empty, set members leave the value empty, sorted-set scores are
/// stored as little-endian `f64` bits.
///
/// # Errors
///
/// Returns `PikaError::Storage` when the record count or a byte field exceeds format limits.
pub fn encode_keyspace(keyspace: &Keyspace) -> PikaResult<Vec<u8>> {
    let mut records = Vec::new();
    for (key, value) in keyspace.strings() {
        records.push((FAMILY_STRING, key.as_slice(), &[][..], value.as_slice()));
    }
    for (key, fields) in keyspace.hashes() {
        for (field, value) in fields {
            records.push((FAMILY_HASH, key.as_slice(), field.as_slice(), value.as_slice()));
        }
    }
    for (key, elements) in keyspace.lists() {
        for element in elements {
            records.push((FAMILY_LIST, key.as_slice(), &[][..], element.as_slice()));
        }
    }
    for (key, members) in keyspace.sets() {
        for member in members {
            records.push((FAMILY_SET, key.as_slice(), member.as_slice(), &[][..]));
        }
    }

    let mut scores = Vec::new();
    for (key, members) in keyspace.zsets() {
        for (member, score) in members {
            scores.push((key.as_slice(), member.as_slice(), score.to_le_bytes()));
        }
    }

    let mut output = Vec::new();
    output.extend_from_slice(SNAPSHOT_MAGIC);
    write_u16(&mut output, SNAPSHOT_VERSION);
    write_u32(
        &mut output,
        to_u32_len(records.len() + scores.len(), "snapshot record count")?,
    );

    for (family, key, field, value) in records {
        write_record(&mut output, family, key, field, value)?;
    }
    for (key, member, score) in &scores {
        write_record(&mut output, FAMILY_ZSET, key, member, score)?;
    }

    Ok(output)
}

/// Decodes storage bytes into a keyspace.
///
/// # Errors
///
/// Returns `PikaError::Storage` when the payload is truncated or semantically invalid.
pub fn decode_keyspace(payload: &[u8]) -> PikaResult<Keyspace> {
    let mut cursor = SnapshotCursor::new(payload);

    let magic = cursor.read_slice(SNAPSHOT_MAGIC.len())?;
    if magic != SNAPSHOT_MAGIC {
        return Err(snapshot_error("invalid snapshot magic"));
    }

    let version = cursor.read_u16()?;
    if version != SNAPSHOT_VERSION {
        return Err(snapshot_error(format!(
            "unsupported snapshot version {version}"
        )));
    }

    let record_count = cursor.read_u32()?;
    let mut keyspace = Keyspace::default();

    for record_index in 0..record_count {
        let family = cursor.read_u8()?;
        let key = cursor.read_len_prefixed()?;
        let field = cursor.read_len_prefixed()?;
        let value = cursor.read_len_prefixed()?;
        match family {
            FAMILY_STRING => keyspace.set(key, value),
            FAMILY_HASH => {
                let _ = keyspace.hset(key, field, value);
            }
            FAMILY_LIST => {
                let _ = keyspace.rpush(key, vec![value]);
            }
            FAMILY_SET => {
                let _ = keyspace.sadd(key, vec![field]);
            }
            FAMILY_ZSET => {
                let bits: [u8; 8] = value.as_slice().try_into().map_err(|_| {
                    snapshot_error(format!("invalid score width for record index {record_index}"))
                })?;
                let _ = keyspace.zadd(key, vec![(f64::from_le_bytes(bits), field)]);
            }
            _ => {
                return Err(snapshot_error(format!(
                    "invalid family tag {family} for record index {record_index}"
                )));
            }
        }
    }

    cursor.ensure_fully_consumed()?;
    Ok(keyspace)
}

fn write_record(
    output: &mut Vec<u8>,
    family: u8,
    key: &[u8],
    field: &[u8],
    value: &[u8],
) -> PikaResult<()> {
    write_u8(output, family);
    write_len_prefixed_bytes(output, key)?;
    write_len_prefixed_bytes(output, field)?;
    write_len_prefixed_bytes(output, value)
}

fn write_len_prefixed_bytes(output: &mut Vec<u8>, payload: &[u8]) -> PikaResult<()> {
    write_u32(output, to_u32_len(payload.len(), "field length")?);
    output.extend_from_slice(payload);
    Ok(())
}

fn to_u32_len(value: usize, field_name: &str) -> PikaResult<u32> {
    u32::try_from(value).map_err(|_| snapshot_error(format!("{field_name} exceeds u32::MAX")))
}

fn write_u8(output: &mut Vec<u8>, value: u8) {
    output.push(value);
}

fn write_u16(output: &mut Vec<u8>, value: u16) {
    output.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(output: &mut Vec<u8>, value: u32) {
    output.extend_from_slice(&value.to_le_bytes());
}

fn snapshot_error(message: impl Into<String>) -> PikaError {
    PikaError::Storage(format!("snapshot payload error: {}", message.into()))
}

/// Stateful byte reader that tracks decoding position for error messages.
#[derive(Debug)]
struct SnapshotCursor<'a> {
    payload: &'a [u8],
    offset: usize,
}

impl<'a> SnapshotCursor<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { payload, offset: 0 }
    }

    fn read_u8(&mut self) -> PikaResult<u8> {
        let bytes = self.read_slice(1)?;
        Ok(bytes[0])
    }

    fn read_u16(&mut self) -> PikaResult<u16> {
        let bytes = self.read_slice(2)?;
        let mut array = [0_u8; 2];
        array.copy_from_slice(bytes);
        Ok(u16::from_le_bytes(array))
    }

    fn read_u32(&mut self) -> PikaResult<u32> {
        let bytes = self.read_slice(4)?;
        let mut array = [0_u8; 4];
        array.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(array))
    }

    fn read_len_prefixed(&mut self) -> PikaResult<Vec<u8>> {
        let len = usize::try_from(self.read_u32()?)
            .map_err(|_| snapshot_error("field length exceeds platform limits"))?;
        Ok(self.read_slice(len)?.to_vec())
    }

    fn read_slice(&mut self, len: usize) -> PikaResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or_else(|| snapshot_error("offset overflow while decoding"))?;
        if end > self.payload.len() {
            return Err(snapshot_error(format!(
                "unexpected end of payload at byte offset {} while reading {len} bytes",
                self.offset
            )));
        }

        let bytes = &self.payload[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn ensure_fully_consumed(&self) -> PikaResult<()> {
        if self.offset == self.payload.len() {
            return Ok(());
        }
        Err(snapshot_error(format!(
            "trailing bytes after snapshot body: consumed {}, total {}",
            self.offset,
            self.payload.len()
        )))
    }
}
