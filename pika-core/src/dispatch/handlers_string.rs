use super::parse_redis_i64;
use crate::command::{CommandFrame, CommandReply};
use pika_common::error::PikaError;
use pika_storage::Store;

pub(super) fn handle_ping(_store: &Store, frame: &CommandFrame) -> CommandReply {
    match frame.args.as_slice() {
        [] => CommandReply::SimpleString("PONG".to_owned()),
        [message] => CommandReply::BulkString(message.clone()),
        _ => CommandReply::Error("wrong number of arguments for 'PING' command".to_owned()),
    }
}

pub(super) fn handle_echo(_store: &Store, frame: &CommandFrame) -> CommandReply {
    CommandReply::BulkString(frame.args[0].clone())
}

pub(super) fn handle_set(store: &Store, frame: &CommandFrame) -> CommandReply {
    let key = frame.args[0].clone();
    let value = frame.args[1].clone();
    store.write(|keyspace| keyspace.set(key, value));
    CommandReply::ok()
}

pub(super) fn handle_get(store: &Store, frame: &CommandFrame) -> CommandReply {
    store
        .read(|keyspace| keyspace.get(&frame.args[0]).cloned())
        .map_or(CommandReply::Null, CommandReply::BulkString)
}

pub(super) fn handle_del(store: &Store, frame: &CommandFrame) -> CommandReply {
    let removed = store.write(|keyspace| {
        frame
            .args
            .iter()
            .filter(|key| keyspace.del(key))
            .count()
    });
    CommandReply::count(removed)
}

pub(super) fn handle_exists(store: &Store, frame: &CommandFrame) -> CommandReply {
    let present = store.read(|keyspace| {
        frame
            .args
            .iter()
            .filter(|key| keyspace.exists(key))
            .count()
    });
    CommandReply::count(present)
}

pub(super) fn handle_incr(store: &Store, frame: &CommandFrame) -> CommandReply {
    incr_by(store, &frame.args[0], 1)
}

pub(super) fn handle_incrby(store: &Store, frame: &CommandFrame) -> CommandReply {
    let Ok(delta) = parse_redis_i64(&frame.args[1]) else {
        return CommandReply::Error("value is not an integer or out of range".to_owned());
    };
    incr_by(store, &frame.args[0], delta)
}

fn incr_by(store: &Store, key: &[u8], delta: i64) -> CommandReply {
    match store.write(|keyspace| keyspace.incr_by(key, delta)) {
        Ok(value) => CommandReply::Integer(value),
        Err(PikaError::Storage(message)) => CommandReply::Error(message),
        Err(error) => CommandReply::Error(error.to_string()),
    }
}
