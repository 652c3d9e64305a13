use super::parse_redis_f64;
use crate::command::{CommandFrame, CommandReply};
use pika_storage::Store;

pub(super) fn handle_sadd(store: &Store, frame: &CommandFrame) -> CommandReply {
    let key = frame.args[0].clone();
    let members = frame.args[1..].to_vec();
    CommandReply::count(store.write(|keyspace| keyspace.sadd(key, members)))
}

pub(super) fn handle_srem(store: &Store, frame: &CommandFrame) -> CommandReply {
    CommandReply::count(store.write(|keyspace| keyspace.srem(&frame.args[0], &frame.args[1..])))
}

pub(super) fn handle_scard(store: &Store, frame: &CommandFrame) -> CommandReply {
    CommandReply::count(store.read(|keyspace| keyspace.scard(&frame.args[0])))
}

pub(super) fn handle_zadd(store: &Store, frame: &CommandFrame) -> CommandReply {
    let pairs = &frame.args[1..];
    if pairs.len() % 2 != 0 {
        return CommandReply::Error("syntax error".to_owned());
    }
    let mut entries = Vec::with_capacity(pairs.len() / 2);
    for pair in pairs.chunks_exact(2) {
        let Ok(score) = parse_redis_f64(&pair[0]) else {
            return CommandReply::Error("value is not a valid float".to_owned());
        };
        entries.push((score, pair[1].clone()));
    }
    let key = frame.args[0].clone();
    CommandReply::count(store.write(|keyspace| keyspace.zadd(key, entries)))
}

pub(super) fn handle_zcard(store: &Store, frame: &CommandFrame) -> CommandReply {
    CommandReply::count(store.read(|keyspace| keyspace.zcard(&frame.args[0])))
}

pub(super) fn handle_zscore(store: &Store, frame: &CommandFrame) -> CommandReply {
    store
        .read(|keyspace| keyspace.zscore(&frame.args[0], &frame.args[1]))
        .map_or(CommandReply::Null, |score| {
            CommandReply::BulkString(score.to_string().into_bytes())
        })
}
