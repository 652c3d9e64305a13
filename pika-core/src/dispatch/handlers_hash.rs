use crate::command::{CommandFrame, CommandReply};
use pika_storage::Store;

pub(super) fn handle_hset(store: &Store, frame: &CommandFrame) -> CommandReply {
    let key = frame.args[0].clone();
    let field = frame.args[1].clone();
    let value = frame.args[2].clone();
    let created = store.write(|keyspace| keyspace.hset(key, field, value));
    CommandReply::Integer(i64::from(created))
}

pub(super) fn handle_hget(store: &Store, frame: &CommandFrame) -> CommandReply {
    store
        .read(|keyspace| keyspace.hget(&frame.args[0], &frame.args[1]).cloned())
        .map_or(CommandReply::Null, CommandReply::BulkString)
}

pub(super) fn handle_hdel(store: &Store, frame: &CommandFrame) -> CommandReply {
    let removed = store.write(|keyspace| keyspace.hdel(&frame.args[0], &frame.args[1..]));
    CommandReply::count(removed)
}

pub(super) fn handle_hlen(store: &Store, frame: &CommandFrame) -> CommandReply {
    CommandReply::count(store.read(|keyspace| keyspace.hlen(&frame.args[0])))
}
