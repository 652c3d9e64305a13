//! Server command table: the store-backed commands from `pika-core` plus administrative commands
//! that act on the [`ServerContext`].
//!
//! Data commands run under the storage read lock; successful writes are appended to the binlog
//! before the lock is released, so slaves observe writes in execution order. Administrative
//! handlers run without the storage lock.

use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;

use pika_common::config::REPLICATION_PORT_OFFSET;
use pika_common::ids::{ClientRole, LogPosition, SegmentNumber};
use pika_core::command::{CommandFrame, CommandReply};
use pika_core::dispatch::{
    CommandArity, CommandKind, CommandRegistry, CommandSpec, DATA_COMMANDS, DataHandler,
};
use pika_replication::segments::SEGMENT_PREFIX;
use tracing::{error, info, warn};

use crate::admin::InfoSection;
use crate::app::ServerContext;
use crate::replication::SyncStrategy;

/// Handler signature for commands acting on the server itself.
pub type AdminHandler = fn(&Arc<ServerContext>, &ExecContext, &CommandFrame) -> CommandReply;

/// Entry of the server command table.
#[derive(Debug, Clone, Copy)]
pub enum ServerHandler {
    /// Runs against the live store.
    Data(DataHandler),
    /// Runs against the server context.
    Admin(AdminHandler),
}

/// Connection the command arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecContext {
    /// Socket descriptor, used by the sync handshake to find the connection.
    pub fd: RawFd,
    /// `ip:port` of the peer.
    pub peer: String,
    /// Role of the connection at execution time.
    pub role: ClientRole,
}

const fn admin(
    name: &'static str,
    arity: CommandArity,
    handler: AdminHandler,
) -> CommandSpec<ServerHandler> {
    CommandSpec {
        name,
        arity,
        kind: CommandKind::Admin,
        handler: ServerHandler::Admin(handler),
    }
}

static ADMIN_COMMANDS: &[CommandSpec<ServerHandler>] = &[
    admin("CLIENT", CommandArity::AtLeast(2), handle_client),
    admin("INFO", CommandArity::AtLeast(1), handle_info),
    admin("SLAVEOF", CommandArity::Exact(3), handle_slaveof),
    admin("TRYSYNC", CommandArity::Exact(5), handle_trysync),
    admin("BGSAVE", CommandArity::Exact(1), handle_bgsave),
    admin("BGSAVEOFF", CommandArity::Exact(1), handle_bgsaveoff),
    admin("FLUSHALL", CommandArity::Exact(1), handle_flushall),
    admin("PURGELOGSTO", CommandArity::Exact(2), handle_purgelogsto),
    admin("LOADDB", CommandArity::Exact(2), handle_loaddb),
    admin("SHUTDOWN", CommandArity::Exact(1), handle_shutdown),
];

/// Builds the immutable command table used by every worker.
#[must_use]
pub fn build_registry() -> CommandRegistry<ServerHandler> {
    let data = DATA_COMMANDS.iter().map(|spec| CommandSpec {
        name: spec.name,
        arity: spec.arity,
        kind: spec.kind,
        handler: ServerHandler::Data(spec.handler),
    });
    CommandRegistry::from_specs(data.chain(ADMIN_COMMANDS.iter().copied()))
}

/// Resolves and runs one command.
///
/// Commands replayed from a master link bypass the readonly check and never produce a reply.
pub fn execute(ctx: &Arc<ServerContext>, exec: &ExecContext, frame: &CommandFrame) -> CommandReply {
    let spec = match ctx.registry.resolve(frame) {
        Ok(spec) => *spec,
        Err(message) => return CommandReply::Error(message),
    };
    let reply = match spec.handler {
        ServerHandler::Data(handler) => execute_data(ctx, exec, spec.kind, handler, frame),
        ServerHandler::Admin(handler) => handler(ctx, exec, frame),
    };
    if exec.role == ClientRole::Master {
        if reply.is_error() {
            warn!(master = %exec.peer, command = %frame.name, ?reply, "replicated command failed");
        }
        return CommandReply::NoReply;
    }
    reply
}

fn execute_data(
    ctx: &ServerContext,
    exec: &ExecContext,
    kind: CommandKind,
    handler: DataHandler,
    frame: &CommandFrame,
) -> CommandReply {
    let is_write = kind == CommandKind::Write;
    if is_write && exec.role != ClientRole::Master && ctx.is_readonly() {
        return CommandReply::Error("server is in readonly mode".to_owned());
    }
    let storage = ctx.storage.read();
    let reply = handler(&storage, frame);
    if is_write && !reply.is_error() {
        append_to_binlog(ctx, frame);
    }
    reply
}

fn append_to_binlog(ctx: &ServerContext, frame: &CommandFrame) {
    if let Err(error) = ctx.binlog.append(&frame.to_resp_request()) {
        error!(command = %frame.name, %error, "binlog append failed");
    }
}

fn arg_text(frame: &CommandFrame, index: usize) -> String {
    frame
        .args
        .get(index)
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .unwrap_or_default()
}

fn handle_client(
    ctx: &Arc<ServerContext>,
    _exec: &ExecContext,
    frame: &CommandFrame,
) -> CommandReply {
    let subcommand = arg_text(frame, 0).to_ascii_lowercase();
    match (subcommand.as_str(), frame.argc()) {
        ("list", 2) => CommandReply::BulkString(ctx.client_list().into_bytes()),
        ("kill", 3) => {
            let target = arg_text(frame, 1);
            if target.eq_ignore_ascii_case("all") {
                let killed = ctx.kill_all_clients();
                info!(killed, "killed all normal clients");
                CommandReply::ok()
            } else if ctx.kill_client(&target) {
                CommandReply::ok()
            } else {
                CommandReply::Error("No such client".to_owned())
            }
        }
        _ => CommandReply::Error("syntax error".to_owned()),
    }
}

fn handle_info(
    ctx: &Arc<ServerContext>,
    _exec: &ExecContext,
    frame: &CommandFrame,
) -> CommandReply {
    let section = if frame.args.is_empty() {
        InfoSection::All
    } else {
        match InfoSection::parse(&arg_text(frame, 0)) {
            Some(section) => section,
            None => return CommandReply::Error("invalid info section".to_owned()),
        }
    };
    if section == InfoSection::Keyspace && arg_text(frame, 1) == "1" {
        let started = ctx.info_keyspace();
        info!(started, "keyspace scan requested");
    }
    CommandReply::BulkString(ctx.info(section).into_bytes())
}

fn handle_slaveof(
    ctx: &Arc<ServerContext>,
    _exec: &ExecContext,
    frame: &CommandFrame,
) -> CommandReply {
    let host = arg_text(frame, 0);
    let port = arg_text(frame, 1);
    if host.eq_ignore_ascii_case("no") && port.eq_ignore_ascii_case("one") {
        ctx.slave_of_no_one();
        return CommandReply::ok();
    }
    let Some((port, replication_port)) = port
        .parse::<u16>()
        .ok()
        .and_then(|port| Some((port, port.checked_add(REPLICATION_PORT_OFFSET)?)))
    else {
        return CommandReply::Error("invalid master port".to_owned());
    };
    let is_self_host = host == ctx.server_ip() || host == "127.0.0.1" || host == "localhost";
    if is_self_host && port == ctx.port() {
        return CommandReply::Error("cannot replicate from itself".to_owned());
    }
    match ctx.slave_of(&host, replication_port) {
        Ok(()) => CommandReply::ok(),
        Err(error) => CommandReply::Error(error.to_string()),
    }
}

fn handle_trysync(
    ctx: &Arc<ServerContext>,
    exec: &ExecContext,
    frame: &CommandFrame,
) -> CommandReply {
    let slave = format!("{}:{}", arg_text(frame, 0), arg_text(frame, 1));
    let (Ok(filenum), Ok(offset)) = (
        arg_text(frame, 2).parse::<SegmentNumber>(),
        arg_text(frame, 3).parse::<u64>(),
    ) else {
        return CommandReply::Error("invalid sync position".to_owned());
    };
    let position = LogPosition::new(filenum, offset);
    match ctx.try_sync(exec.fd, position) {
        SyncStrategy::PartialSync => {
            info!(%slave, %position, "slave synced");
            CommandReply::NoReply
        }
        SyncStrategy::StrategyError => {
            warn!(%slave, %position, "slave sync refused");
            CommandReply::Error("sync position is not available".to_owned())
        }
    }
}

fn handle_bgsave(
    ctx: &Arc<ServerContext>,
    _exec: &ExecContext,
    _frame: &CommandFrame,
) -> CommandReply {
    if !ctx.dump() {
        return CommandReply::Error("bgsave already in progress".to_owned());
    }
    let state = ctx.state.lock();
    CommandReply::SimpleString(format!(
        "{} : {}: {}",
        state.dump.label, state.dump.cursor.filenum, state.dump.cursor.offset
    ))
}

fn handle_bgsaveoff(
    ctx: &Arc<ServerContext>,
    _exec: &ExecContext,
    _frame: &CommandFrame,
) -> CommandReply {
    if ctx.dump_off() {
        CommandReply::ok()
    } else {
        CommandReply::Error("no bgsave in progress".to_owned())
    }
}

fn handle_flushall(
    ctx: &Arc<ServerContext>,
    _exec: &ExecContext,
    _frame: &CommandFrame,
) -> CommandReply {
    if !ctx.flush_all() {
        return CommandReply::Error("flushall failed or already in progress".to_owned());
    }
    CommandReply::ok()
}

fn handle_purgelogsto(
    ctx: &Arc<ServerContext>,
    _exec: &ExecContext,
    frame: &CommandFrame,
) -> CommandReply {
    let arg = arg_text(frame, 0);
    let Ok(to) = arg.strip_prefix(SEGMENT_PREFIX).unwrap_or(&arg).parse::<i64>() else {
        return CommandReply::Error("invalid binlog segment".to_owned());
    };
    let Some(max) = ctx.binlog.current_filenum().checked_sub(1) else {
        return CommandReply::Error("no purgeable binlog segment".to_owned());
    };
    if ctx.purge_logs(max, to) {
        CommandReply::ok()
    } else {
        CommandReply::Error(format!("purge rejected: running or out of range 0..={max}"))
    }
}

fn handle_loaddb(
    ctx: &Arc<ServerContext>,
    _exec: &ExecContext,
    frame: &CommandFrame,
) -> CommandReply {
    let path = arg_text(frame, 0);
    match ctx.load_db(Path::new(&path)) {
        Ok(()) => CommandReply::ok(),
        Err(error) => CommandReply::Error(error.to_string()),
    }
}

fn handle_shutdown(
    ctx: &Arc<ServerContext>,
    exec: &ExecContext,
    _frame: &CommandFrame,
) -> CommandReply {
    warn!(peer = %exec.peer, "shutdown requested by client");
    ctx.request_shutdown();
    CommandReply::NoReply
}
