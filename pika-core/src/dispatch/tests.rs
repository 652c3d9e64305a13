use super::{CommandArity, CommandKind, CommandRegistry, DATA_COMMANDS};
use crate::command::{CommandFrame, CommandReply};
use googletest::prelude::*;
use pika_storage::{Store, StoreOptions};
use rstest::rstest;

fn frame(parts: &[&str]) -> CommandFrame {
    CommandFrame::new(
        parts[0],
        parts[1..].iter().map(|part| part.as_bytes().to_vec()).collect(),
    )
}

fn open_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let store = Store::open(dir.path(), StoreOptions::default()).expect("store should open");
    (dir, store)
}

#[rstest]
#[case(CommandArity::Exact(3), 3, true)]
#[case(CommandArity::Exact(3), 4, false)]
#[case(CommandArity::AtLeast(2), 2, true)]
#[case(CommandArity::AtLeast(2), 9, true)]
#[case(CommandArity::AtLeast(2), 1, false)]
fn arity_counts_the_command_name(
    #[case] arity: CommandArity,
    #[case] argc: usize,
    #[case] accepted: bool,
) {
    assert_that!(arity.accepts(argc), eq(accepted));
}

#[rstest]
fn data_table_names_are_unique_and_uppercase() {
    let registry = CommandRegistry::with_data_commands();
    assert_that!(registry.len(), eq(DATA_COMMANDS.len()));
    assert_that!(
        DATA_COMMANDS
            .iter()
            .all(|spec| spec.name == spec.name.to_ascii_uppercase()),
        eq(true)
    );
}

#[rstest]
fn resolve_is_case_insensitive() {
    let registry = CommandRegistry::with_data_commands();
    let spec = registry
        .resolve(&frame(&["hset", "h", "f", "v"]))
        .expect("hset should resolve");
    assert_that!(spec.name, eq("HSET"));
    assert_that!(spec.kind, eq(CommandKind::Write));
}

#[rstest]
#[case(&["NOPE"], "unknown command 'nope'")]
#[case(&["GET"], "wrong number of arguments for 'get' command")]
#[case(&["SET", "k"], "wrong number of arguments for 'set' command")]
fn resolve_reports_user_facing_errors(#[case] parts: &[&str], #[case] message: &str) {
    let registry = CommandRegistry::with_data_commands();
    let error = registry
        .resolve(&frame(parts))
        .expect_err("resolution must fail");
    assert_that!(&error, eq(message));
}

#[rstest]
fn string_commands_round_trip_through_store() {
    let (_dir, store) = open_store();
    let registry = CommandRegistry::with_data_commands();

    let set = registry.dispatch(&store, &frame(&["SET", "k", "v"]));
    assert_that!(&set, eq(&CommandReply::ok()));
    let get = registry.dispatch(&store, &frame(&["GET", "k"]));
    assert_that!(&get, eq(&CommandReply::BulkString(b"v".to_vec())));
    let exists = registry.dispatch(&store, &frame(&["EXISTS", "k", "missing"]));
    assert_that!(&exists, eq(&CommandReply::Integer(1)));
    let del = registry.dispatch(&store, &frame(&["DEL", "k", "k"]));
    assert_that!(&del, eq(&CommandReply::Integer(1)));
    let missing = registry.dispatch(&store, &frame(&["GET", "k"]));
    assert_that!(&missing, eq(&CommandReply::Null));
}

#[rstest]
fn incr_reports_non_integer_values() {
    let (_dir, store) = open_store();
    let registry = CommandRegistry::with_data_commands();

    let first = registry.dispatch(&store, &frame(&["INCR", "n"]));
    assert_that!(&first, eq(&CommandReply::Integer(1)));
    let _ = registry.dispatch(&store, &frame(&["SET", "n", "x"]));
    let bad = registry.dispatch(&store, &frame(&["INCR", "n"]));
    assert_that!(bad.is_error(), eq(true));
}

#[rstest]
fn collection_commands_update_family_counts() {
    let (_dir, store) = open_store();
    let registry = CommandRegistry::with_data_commands();

    let hset = registry.dispatch(&store, &frame(&["HSET", "h", "f", "v"]));
    assert_that!(&hset, eq(&CommandReply::Integer(1)));
    let hget = registry.dispatch(&store, &frame(&["HGET", "h", "f"]));
    assert_that!(&hget, eq(&CommandReply::BulkString(b"v".to_vec())));
    let rpush = registry.dispatch(&store, &frame(&["RPUSH", "l", "a", "b"]));
    assert_that!(&rpush, eq(&CommandReply::Integer(2)));
    let lpop = registry.dispatch(&store, &frame(&["LPOP", "l"]));
    assert_that!(&lpop, eq(&CommandReply::BulkString(b"a".to_vec())));
    let sadd = registry.dispatch(&store, &frame(&["SADD", "s", "x", "x", "y"]));
    assert_that!(&sadd, eq(&CommandReply::Integer(2)));
    let zadd = registry.dispatch(&store, &frame(&["ZADD", "z", "1.5", "m"]));
    assert_that!(&zadd, eq(&CommandReply::Integer(1)));
    let zscore = registry.dispatch(&store, &frame(&["ZSCORE", "z", "m"]));
    assert_that!(&zscore, eq(&CommandReply::BulkString(b"1.5".to_vec())));

    let counts = store.key_counts();
    assert_that!(
        (counts.kv, counts.hash, counts.list, counts.set, counts.zset),
        eq((0, 1, 1, 1, 1))
    );
}

#[rstest]
#[case(&["ZADD", "z", "1", "a", "2"])]
#[case(&["ZADD", "z", "nan", "a"])]
#[case(&["ZADD", "z", "abc", "a"])]
fn zadd_rejects_malformed_pairs(#[case] parts: &[&str]) {
    let (_dir, store) = open_store();
    let registry = CommandRegistry::with_data_commands();
    let reply = registry.dispatch(&store, &frame(parts));
    assert_that!(reply.is_error(), eq(true));
    assert_that!(store.key_counts().zset, eq(0));
}
