//! Canonical command frame types.

use pika_facade::protocol::{ParsedCommand, encode_multibulk};

/// Command payload representation used between the connection layer and handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Command name in uppercase canonical form (e.g. `SET`, `TRYSYNC`).
    pub name: String,
    /// Raw byte arguments preserving wire-level payload.
    pub args: Vec<Vec<u8>>,
}

impl CommandFrame {
    /// Creates a command frame from a command name and argument list.
    #[must_use]
    pub fn new(name: impl Into<String>, args: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Number of wire tokens including the command name.
    #[must_use]
    pub fn argc(&self) -> usize {
        self.args.len() + 1
    }

    /// Encodes the frame as the RESP request appended to the binlog.
    #[must_use]
    pub fn to_resp_request(&self) -> Vec<u8> {
        let mut parts = Vec::with_capacity(self.argc());
        parts.push(self.name.as_bytes());
        parts.extend(self.args.iter().map(Vec::as_slice));
        encode_multibulk(&parts)
    }
}

impl From<ParsedCommand> for CommandFrame {
    fn from(command: ParsedCommand) -> Self {
        Self::new(command.name, command.args)
    }
}

/// Canonical command reply representation.
///
/// The reply enum is kept protocol-neutral. Encoding to RESP (or other protocols) happens
/// at the connection boundary, so handlers stay independent from wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    /// `+OK` style replies.
    SimpleString(String),
    /// `$<len> ...` style binary-safe payload.
    BulkString(Vec<u8>),
    /// RESP null bulk string (`$-1`).
    Null,
    /// RESP integer reply (`:<n>`).
    Integer(i64),
    /// RESP array reply (`*<n> ...`).
    Array(Vec<CommandReply>),
    /// RESP null array (`*-1`).
    NullArray,
    /// `-ERR ...` style error.
    Error(String),
    /// Nothing is written back, used for commands replayed from a master link and for a
    /// sync handshake whose acknowledgement is streamed by the binlog consumer.
    NoReply,
}

impl CommandReply {
    /// `+OK` reply.
    #[must_use]
    pub fn ok() -> Self {
        Self::SimpleString("OK".to_owned())
    }

    /// Integer reply from a collection size.
    #[must_use]
    pub fn count(value: usize) -> Self {
        Self::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }

    /// Returns `true` for error replies.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl CommandReply {
    /// Encodes the reply into RESP bytes for Redis-compatible clients.
    #[must_use]
    pub fn to_resp_bytes(&self) -> Vec<u8> {
        match self {
            Self::SimpleString(value) => {
                let mut output = Vec::with_capacity(value.len() + 3);
                output.extend_from_slice(b"+");
                output.extend_from_slice(value.as_bytes());
                output.extend_from_slice(b"\r\n");
                output
            }
            Self::BulkString(value) => {
                let mut output = Vec::new();
                output.extend_from_slice(format!("${}\r\n", value.len()).as_bytes());
                output.extend_from_slice(value);
                output.extend_from_slice(b"\r\n");
                output
            }
            Self::Null => b"$-1\r\n".to_vec(),
            Self::Integer(value) => format!(":{value}\r\n").into_bytes(),
            Self::Array(items) => {
                let mut output = format!("*{}\r\n", items.len()).into_bytes();
                for item in items {
                    output.extend_from_slice(&item.to_resp_bytes());
                }
                output
            }
            Self::NullArray => b"*-1\r\n".to_vec(),
            Self::NoReply => Vec::new(),
            Self::Error(message) => {
                let mut output = Vec::with_capacity(message.len() + 6);
                output.extend_from_slice(b"-ERR ");
                output.extend_from_slice(message.as_bytes());
                output.extend_from_slice(b"\r\n");
                output
            }
        }
    }
}
