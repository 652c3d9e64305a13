use std::collections::HashMap;

use super::handlers_hash::{handle_hdel, handle_hget, handle_hlen, handle_hset};
use super::handlers_list::{handle_llen, handle_lpop, handle_lpush, handle_rpush};
use super::handlers_set::{
    handle_sadd, handle_scard, handle_srem, handle_zadd, handle_zcard, handle_zscore,
};
use super::handlers_string::{
    handle_del, handle_echo, handle_exists, handle_get, handle_incr, handle_incrby, handle_ping,
    handle_set,
};
use super::{CommandArity, CommandKind, CommandSpec, DataHandler};
use crate::command::{CommandFrame, CommandReply};
use pika_storage::Store;

const fn data(
    name: &'static str,
    arity: CommandArity,
    kind: CommandKind,
    handler: DataHandler,
) -> CommandSpec<DataHandler> {
    CommandSpec {
        name,
        arity,
        kind,
        handler,
    }
}

/// Static table of every store-backed command.
pub static DATA_COMMANDS: &[CommandSpec<DataHandler>] = &[
    data("PING", CommandArity::AtLeast(1), CommandKind::Read, handle_ping),
    data("ECHO", CommandArity::Exact(2), CommandKind::Read, handle_echo),
    data("SET", CommandArity::Exact(3), CommandKind::Write, handle_set),
    data("GET", CommandArity::Exact(2), CommandKind::Read, handle_get),
    data("DEL", CommandArity::AtLeast(2), CommandKind::Write, handle_del),
    data("EXISTS", CommandArity::AtLeast(2), CommandKind::Read, handle_exists),
    data("INCR", CommandArity::Exact(2), CommandKind::Write, handle_incr),
    data("INCRBY", CommandArity::Exact(3), CommandKind::Write, handle_incrby),
    data("HSET", CommandArity::Exact(4), CommandKind::Write, handle_hset),
    data("HGET", CommandArity::Exact(3), CommandKind::Read, handle_hget),
    data("HDEL", CommandArity::AtLeast(3), CommandKind::Write, handle_hdel),
    data("HLEN", CommandArity::Exact(2), CommandKind::Read, handle_hlen),
    data("LPUSH", CommandArity::AtLeast(3), CommandKind::Write, handle_lpush),
    data("RPUSH", CommandArity::AtLeast(3), CommandKind::Write, handle_rpush),
    data("LPOP", CommandArity::Exact(2), CommandKind::Write, handle_lpop),
    data("LLEN", CommandArity::Exact(2), CommandKind::Read, handle_llen),
    data("SADD", CommandArity::AtLeast(3), CommandKind::Write, handle_sadd),
    data("SREM", CommandArity::AtLeast(3), CommandKind::Write, handle_srem),
    data("SCARD", CommandArity::Exact(2), CommandKind::Read, handle_scard),
    data("ZADD", CommandArity::AtLeast(4), CommandKind::Write, handle_zadd),
    data("ZCARD", CommandArity::Exact(2), CommandKind::Read, handle_zcard),
    data("ZSCORE", CommandArity::Exact(3), CommandKind::Read, handle_zscore),
];

/// Immutable command table, built once at startup.
#[derive(Debug, Clone)]
pub struct CommandRegistry<H> {
    entries: HashMap<&'static str, CommandSpec<H>>,
}

impl<H: Copy> CommandRegistry<H> {
    /// Builds a registry from spec tables. A later spec replaces an earlier one of the same name.
    #[must_use]
    pub fn from_specs(specs: impl IntoIterator<Item = CommandSpec<H>>) -> Self {
        let entries = specs.into_iter().map(|spec| (spec.name, spec)).collect();
        Self { entries }
    }

    /// Looks up a spec by name, case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CommandSpec<H>> {
        self.entries.get(name.to_ascii_uppercase().as_str())
    }

    /// Looks up the command for `frame` and validates its arity.
    ///
    /// # Errors
    ///
    /// Returns user-facing error text for unknown command names or invalid argument count.
    pub fn resolve(&self, frame: &CommandFrame) -> Result<&CommandSpec<H>, String> {
        let Some(spec) = self.get(&frame.name) else {
            return Err(format!(
                "unknown command '{}'",
                frame.name.to_ascii_lowercase()
            ));
        };
        if !spec.arity.accepts(frame.argc()) {
            return Err(format!(
                "wrong number of arguments for '{}' command",
                spec.name.to_ascii_lowercase()
            ));
        }
        Ok(spec)
    }

    /// Number of registered commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no command is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CommandRegistry<DataHandler> {
    /// Builds a registry holding only the store-backed commands.
    #[must_use]
    pub fn with_data_commands() -> Self {
        Self::from_specs(DATA_COMMANDS.iter().copied())
    }

    /// Resolves and executes one frame against `store`.
    #[must_use]
    pub fn dispatch(&self, store: &Store, frame: &CommandFrame) -> CommandReply {
        match self.resolve(frame) {
            Ok(spec) => (spec.handler)(store, frame),
            Err(message) => CommandReply::Error(message),
        }
    }
}
