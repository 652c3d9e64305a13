use crate::command::{CommandFrame, CommandReply};
use pika_storage::Store;

pub(super) fn handle_lpush(store: &Store, frame: &CommandFrame) -> CommandReply {
    let key = frame.args[0].clone();
    let values = frame.args[1..].to_vec();
    CommandReply::count(store.write(|keyspace| keyspace.lpush(key, values)))
}

pub(super) fn handle_rpush(store: &Store, frame: &CommandFrame) -> CommandReply {
    let key = frame.args[0].clone();
    let values = frame.args[1..].to_vec();
    CommandReply::count(store.write(|keyspace| keyspace.rpush(key, values)))
}

pub(super) fn handle_lpop(store: &Store, frame: &CommandFrame) -> CommandReply {
    store
        .write(|keyspace| keyspace.lpop(&frame.args[0]))
        .map_or(CommandReply::Null, CommandReply::BulkString)
}

pub(super) fn handle_llen(store: &Store, frame: &CommandFrame) -> CommandReply {
    CommandReply::count(store.read(|keyspace| keyspace.llen(&frame.args[0])))
}
