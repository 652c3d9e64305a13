//! Command registration and dispatch.
//!
//! Protocol parsing produces a canonical command frame, then an immutable registry resolves the
//! matching spec and validates arity before the caller runs its handler. The registry is generic
//! over the handler type so the server can mix these data handlers with its own administrative
//! ones in a single table.

use pika_storage::Store;

use crate::command::{CommandFrame, CommandReply};

#[path = "dispatch/parse_numbers.rs"]
mod parse_numbers;
#[path = "dispatch/command_spec.rs"]
mod command_spec;
#[path = "dispatch/handlers_string.rs"]
mod handlers_string;
#[path = "dispatch/handlers_hash.rs"]
mod handlers_hash;
#[path = "dispatch/handlers_list.rs"]
mod handlers_list;
#[path = "dispatch/handlers_set.rs"]
mod handlers_set;
#[path = "dispatch/registry.rs"]
mod registry;

pub use command_spec::{CommandArity, CommandKind, CommandSpec};
pub use registry::{CommandRegistry, DATA_COMMANDS};

use parse_numbers::{parse_redis_f64, parse_redis_i64};

/// Handler signature for commands that read or mutate the store.
pub type DataHandler = fn(&Store, &CommandFrame) -> CommandReply;

#[cfg(test)]
#[path = "dispatch/tests.rs"]
mod tests;
