//! RESP request framing.
//!
//! Clients send multi-bulk arrays (`*<n>\r\n$<len>\r\n<bytes>\r\n...`) or inline text lines.
//! Master links additionally receive `+status` and `-error` lines during the sync handshake,
//! so the decoder surfaces those as their own frame kinds.

use pika_common::error::{PikaError, PikaResult};

const CRLF: &[u8] = b"\r\n";
const MAX_MULTIBULK_ELEMENTS: i64 = 1024 * 1024;
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
const MAX_INLINE_LEN: usize = 64 * 1024;

/// Protocol-decoded command representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Command name in canonical uppercase form.
    pub name: String,
    /// Raw argument payload.
    pub args: Vec<Vec<u8>>,
}

impl ParsedCommand {
    /// Builds a command from its name and arguments, uppercasing the name.
    #[must_use]
    pub fn new(name: &str, args: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            args,
        }
    }

    /// Encodes the command back into one RESP multi-bulk request.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.name.as_bytes());
        parts.extend(self.args.iter().map(Vec::as_slice));
        encode_multibulk(&parts)
    }
}

/// One decoded unit of inbound traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Request array or inline command.
    Command(ParsedCommand),
    /// `+<text>` status line.
    Status(String),
    /// `-<text>` error line.
    Error(String),
}

/// Result of one incremental parse attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus {
    /// More bytes are required.
    Incomplete,
    /// One frame was decoded from the first `consumed` bytes.
    Complete {
        /// Decoded frame.
        frame: Frame,
        /// Bytes to drain from the input buffer.
        consumed: usize,
    },
}

/// Decodes the next frame from `input`.
///
/// Empty inline lines and zero-length arrays are skipped and count toward `consumed` of the
/// following frame.
///
/// # Errors
///
/// Returns `PikaError::Protocol` when the bytes cannot be a valid RESP request.
pub fn parse_next_frame(input: &[u8]) -> PikaResult<ParseStatus> {
    let mut skipped = 0_usize;
    loop {
        let rest = &input[skipped..];
        let Some(&first) = rest.first() else {
            return Ok(ParseStatus::Incomplete);
        };
        let step = match first {
            b'*' => parse_multibulk(rest)?,
            b'+' | b'-' => parse_reply_line(rest)?,
            _ => parse_inline(rest)?,
        };
        match step {
            Step::Incomplete => return Ok(ParseStatus::Incomplete),
            Step::Skip(consumed) => skipped += consumed,
            Step::Frame(frame, consumed) => {
                return Ok(ParseStatus::Complete {
                    frame,
                    consumed: skipped + consumed,
                });
            }
        }
    }
}

/// Encodes one request as a RESP array of bulk strings.
#[must_use]
pub fn encode_multibulk(parts: &[&[u8]]) -> Vec<u8> {
    let payload_len: usize = parts.iter().map(|part| part.len() + 16).sum();
    let mut out = Vec::with_capacity(payload_len + 16);
    out.push(b'*');
    out.extend_from_slice(parts.len().to_string().as_bytes());
    out.extend_from_slice(CRLF);
    for part in parts {
        out.push(b'$');
        out.extend_from_slice(part.len().to_string().as_bytes());
        out.extend_from_slice(CRLF);
        out.extend_from_slice(part);
        out.extend_from_slice(CRLF);
    }
    out
}

enum Step {
    Incomplete,
    Skip(usize),
    Frame(Frame, usize),
}

fn find_crlf(input: &[u8]) -> Option<usize> {
    input.windows(2).position(|window| window == CRLF)
}

fn parse_decimal(line: &[u8], what: &str) -> PikaResult<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| PikaError::Protocol(format!("invalid {what} length")))
}

fn parse_multibulk(input: &[u8]) -> PikaResult<Step> {
    let Some(header_end) = find_crlf(input) else {
        return Ok(Step::Incomplete);
    };
    let count = parse_decimal(&input[1..header_end], "multibulk")?;
    let mut cursor = header_end + CRLF.len();
    if count <= 0 {
        return Ok(Step::Skip(cursor));
    }
    if count > MAX_MULTIBULK_ELEMENTS {
        return Err(PikaError::Protocol("invalid multibulk length".to_owned()));
    }

    let mut parts = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
    for _ in 0..count {
        let rest = &input[cursor..];
        let Some(&marker) = rest.first() else {
            return Ok(Step::Incomplete);
        };
        if marker != b'$' {
            return Err(PikaError::Protocol(format!(
                "expected '$', got '{}'",
                char::from(marker)
            )));
        }
        let Some(line_end) = find_crlf(rest) else {
            return Ok(Step::Incomplete);
        };
        let len = parse_decimal(&rest[1..line_end], "bulk")?;
        if !(0..=MAX_BULK_LEN).contains(&len) {
            return Err(PikaError::Protocol("invalid bulk length".to_owned()));
        }
        let len = usize::try_from(len)
            .map_err(|_| PikaError::Protocol("invalid bulk length".to_owned()))?;
        let body_start = line_end + CRLF.len();
        let body_end = body_start + len;
        if rest.len() < body_end + CRLF.len() {
            return Ok(Step::Incomplete);
        }
        if &rest[body_end..body_end + CRLF.len()] != CRLF {
            return Err(PikaError::Protocol("bulk payload missing CRLF".to_owned()));
        }
        parts.push(rest[body_start..body_end].to_vec());
        cursor += body_end + CRLF.len();
    }

    Ok(Step::Frame(command_from_parts(parts)?, cursor))
}

fn parse_reply_line(input: &[u8]) -> PikaResult<Step> {
    let Some(line_end) = find_crlf(input) else {
        return Ok(Step::Incomplete);
    };
    let text = String::from_utf8_lossy(&input[1..line_end]).into_owned();
    let frame = if input[0] == b'+' {
        Frame::Status(text)
    } else {
        Frame::Error(text)
    };
    Ok(Step::Frame(frame, line_end + CRLF.len()))
}

fn parse_inline(input: &[u8]) -> PikaResult<Step> {
    let Some(newline) = input.iter().position(|byte| *byte == b'\n') else {
        if input.len() > MAX_INLINE_LEN {
            return Err(PikaError::Protocol("too big inline request".to_owned()));
        }
        return Ok(Step::Incomplete);
    };
    let consumed = newline + 1;
    let line = input[..newline].strip_suffix(b"\r").unwrap_or(&input[..newline]);
    let parts = line
        .split(u8::is_ascii_whitespace)
        .filter(|part| !part.is_empty())
        .map(<[u8]>::to_vec)
        .collect::<Vec<_>>();
    if parts.is_empty() {
        return Ok(Step::Skip(consumed));
    }
    Ok(Step::Frame(command_from_parts(parts)?, consumed))
}

fn command_from_parts(mut parts: Vec<Vec<u8>>) -> PikaResult<Frame> {
    let name_bytes = parts.remove(0);
    let name = std::str::from_utf8(&name_bytes)
        .map_err(|_| PikaError::Protocol("command name must be valid UTF-8".to_owned()))?;
    Ok(Frame::Command(ParsedCommand::new(name, parts)))
}
