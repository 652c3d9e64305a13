use super::{Server, ServerContext};
use crate::admin::InfoSection;
use crate::commands::{ExecContext, execute};
use crate::replication::SyncStrategy;
use crate::tasks::DumpJob;
use googletest::prelude::*;
use parking_lot::Mutex;
use pika_common::config::ServerConfig;
use pika_common::error::PikaResult;
use pika_common::ids::{ClientRole, LogPosition};
use pika_core::command::CommandFrame;
use pika_facade::protocol::encode_multibulk;
use pika_replication::segments::{list_segments, segment_path};
use pika_replication::{ConsumerSink, MasterLinkState};
use pika_storage::BackupEngine;
use rstest::rstest;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

struct TestServer {
    dir: TempDir,
    ctx: Arc<ServerContext>,
    client_addr: SocketAddr,
    replication_addr: SocketAddr,
    thread: Option<JoinHandle<PikaResult<()>>>,
}

impl TestServer {
    fn start() -> Self {
        Self::start_with(|_, _| {})
    }

    fn start_with(prepare: impl FnOnce(&Path, &mut ServerConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let mut config = ServerConfig {
            thread_num: 2,
            slave_thread_num: 1,
            server_ip: Some("127.0.0.1".to_owned()),
            db_path: dir.path().join("db"),
            log_path: dir.path().join("log"),
            dump_path: dir.path().join("dump"),
            ..ServerConfig::default()
        };
        prepare(dir.path(), &mut config);

        let loopback = SocketAddr::from(([127, 0, 0, 1], 0));
        let server =
            Server::bind_with_addrs(config, loopback, loopback).expect("server should bind");
        let ctx = Arc::clone(server.context());
        let client_addr = server.client_addr().expect("client address");
        let replication_addr = server.replication_addr().expect("replication address");
        let thread = thread::spawn(move || server.run());
        Self {
            dir,
            ctx,
            client_addr,
            replication_addr,
            thread: Some(thread),
        }
    }

    fn connect(&self) -> Client {
        Client::connect(self.client_addr)
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.ctx.request_shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Client {
    reader: BufReader<TcpStream>,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("client should connect");
        stream
            .set_read_timeout(Some(WAIT))
            .expect("read timeout should apply");
        Self {
            reader: BufReader::new(stream),
        }
    }

    fn local_addr(&self) -> String {
        self.reader
            .get_ref()
            .local_addr()
            .expect("client address")
            .to_string()
    }

    fn request(&mut self, parts: &[&[u8]]) -> String {
        self.reader
            .get_mut()
            .write_all(&encode_multibulk(parts))
            .expect("request should be written");
        self.read_reply()
    }

    fn read_reply(&mut self) -> String {
        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .expect("reply line should arrive");
        let Some(len) = line.strip_prefix('$') else {
            return line;
        };
        let Ok(len) = len.trim_end().parse::<usize>() else {
            return line;
        };
        let mut payload = vec![0_u8; len + 2];
        self.reader
            .read_exact(&mut payload)
            .expect("bulk payload should arrive");
        line.push_str(&String::from_utf8_lossy(&payload));
        line
    }

    fn closed_by_server(&mut self) -> bool {
        let mut byte = [0_u8; 1];
        match self.reader.read(&mut byte) {
            Ok(0) => true,
            Ok(_) => false,
            Err(error) => error.kind() == ErrorKind::ConnectionReset,
        }
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn stored_value(ctx: &ServerContext, key: &[u8]) -> Option<Vec<u8>> {
    ctx.store().read(|keyspace| keyspace.get(key).cloned())
}

fn segment_numbers(dir: &Path) -> Vec<u32> {
    list_segments(dir)
        .expect("segments should list")
        .into_iter()
        .map(|segment| segment.number)
        .collect()
}

#[rstest]
fn clients_execute_commands_over_tcp() {
    let server = TestServer::start();
    let mut client = server.connect();

    assert_that!(&client.request(&[b"PING"]), eq("+PONG\r\n"));
    assert_that!(&client.request(&[b"SET", b"foo", b"bar"]), eq("+OK\r\n"));
    assert_that!(&client.request(&[b"GET", b"foo"]), eq("$3\r\nbar\r\n"));
    assert_that!(&client.request(&[b"get", b"missing"]), eq("$-1\r\n"));
    assert_that!(
        client.request(&[b"NOPE"]).starts_with("-ERR unknown command"),
        eq(true)
    );
    assert_that!(server.ctx.binlog.producer_position().offset > 0, eq(true));
    assert_that!(server.ctx.history_clients(), eq(1));
    assert_that!(server.ctx.accumulated_queries(), eq(5));
}

#[rstest]
fn readonly_node_rejects_client_writes() {
    let server = TestServer::start_with(|_, config| config.readonly = true);
    let mut client = server.connect();

    assert_that!(
        &client.request(&[b"SET", b"k", b"v"]),
        eq("-ERR server is in readonly mode\r\n")
    );
    assert_that!(&client.request(&[b"GET", b"k"]), eq("$-1\r\n"));
    assert_that!(server.ctx.binlog.producer_position().offset, eq(0));
}

#[rstest]
fn clients_spread_round_robin_over_client_workers() {
    let server = TestServer::start();
    let mut clients = (0..4).map(|_| server.connect()).collect::<Vec<_>>();
    for client in &mut clients {
        assert_that!(&client.request(&[b"PING"]), eq("+PONG\r\n"));
    }

    assert_that!(server.ctx.workers[0].client_count(), eq(2));
    assert_that!(server.ctx.workers[1].client_count(), eq(2));
    assert_that!(server.ctx.replication_workers()[0].client_count(), eq(0));
    assert_that!(server.ctx.client_count(), eq(4));
}

#[rstest]
fn client_list_and_kill_by_address() {
    let server = TestServer::start();
    let mut admin = server.connect();
    let mut victim = server.connect();
    assert_that!(&victim.request(&[b"PING"]), eq("+PONG\r\n"));

    let list = admin.request(&[b"CLIENT", b"LIST"]);
    assert_that!(list.matches("addr=").count(), eq(2));
    assert_that!(list.contains(&victim.local_addr()), eq(true));

    let target = victim.local_addr();
    assert_that!(
        &admin.request(&[b"CLIENT", b"KILL", target.as_bytes()]),
        eq("+OK\r\n")
    );
    assert_that!(victim.closed_by_server(), eq(true));
    assert_that!(wait_until(|| server.ctx.client_count() == 1), eq(true));
    assert_that!(
        &admin.request(&[b"CLIENT", b"KILL", target.as_bytes()]),
        eq("-ERR No such client\r\n")
    );
}

#[rstest]
fn client_kill_all_closes_normal_clients() {
    let server = TestServer::start();
    let mut first = server.connect();
    let mut second = server.connect();
    assert_that!(&second.request(&[b"PING"]), eq("+PONG\r\n"));

    assert_that!(&first.request(&[b"CLIENT", b"KILL", b"all"]), eq("+OK\r\n"));
    assert_that!(first.closed_by_server(), eq(true));
    assert_that!(second.closed_by_server(), eq(true));
    assert_that!(wait_until(|| server.ctx.client_count() == 0), eq(true));
}

#[rstest]
fn connections_beyond_the_limit_are_closed() {
    let server = TestServer::start_with(|_, config| {
        config.maxconnection = 1;
        config.root_connection_num = 0;
    });
    let mut admitted = server.connect();
    assert_that!(&admitted.request(&[b"PING"]), eq("+PONG\r\n"));

    let mut rejected = server.connect();
    assert_that!(rejected.closed_by_server(), eq(true));
    assert_that!(server.ctx.history_clients(), eq(1));
    assert_that!(&admitted.request(&[b"PING"]), eq("+PONG\r\n"));
}

#[rstest]
fn background_tasks_run_one_instance_per_kind() {
    let server = TestServer::start();
    let ctx = &server.ctx;

    let flush = ctx.tasks.flush.try_claim().expect("flush slot should be idle");
    assert_that!(ctx.flush_all(), eq(false));
    drop(flush);

    let dump = ctx.tasks.dump.try_claim().expect("dump slot should be idle");
    assert_that!(ctx.dump(), eq(false));
    drop(dump);

    let purge = ctx.tasks.purge.try_claim().expect("purge slot should be idle");
    assert_that!(ctx.purge_logs(0, 0), eq(false));
    drop(purge);

    let scan = ctx.tasks.scan.try_claim().expect("scan slot should be idle");
    assert_that!(ctx.info_keyspace(), eq(false));
    drop(scan);
}

#[rstest]
fn purge_rejects_out_of_range_and_deletes_exact_prefix() {
    let server = TestServer::start_with(|root, _| {
        let log = root.join("log");
        fs::create_dir_all(&log).expect("log dir should be created");
        for number in 0..=5 {
            fs::write(segment_path(&log, number), b"").expect("segment should be written");
        }
    });
    let log = server.path("log");

    assert_that!(server.ctx.purge_logs(4, -1), eq(false));
    assert_that!(server.ctx.purge_logs(4, 5), eq(false));
    assert_that!(server.ctx.purge_logs(4, 2), eq(true));
    server.ctx.tasks.purge.join();

    assert_that!(&segment_numbers(&log), eq(&vec![3, 4, 5]));
}

#[rstest]
fn purgelogsto_keeps_the_segment_being_written() {
    let server = TestServer::start_with(|root, _| {
        let log = root.join("log");
        fs::create_dir_all(&log).expect("log dir should be created");
        for number in 0..=2 {
            fs::write(segment_path(&log, number), b"").expect("segment should be written");
        }
    });
    let mut client = server.connect();

    assert_that!(
        client
            .request(&[b"PURGELOGSTO", b"write2file2"])
            .starts_with("-ERR purge rejected"),
        eq(true)
    );
    assert_that!(
        &client.request(&[b"PURGELOGSTO", b"write2file1"]),
        eq("+OK\r\n")
    );
    server.ctx.tasks.purge.join();
    assert_that!(&segment_numbers(&server.path("log")), eq(&vec![2]));
}

#[rstest]
fn dump_manifest_records_binlog_cursor() {
    let server = TestServer::start_with(|root, _| {
        let log = root.join("log");
        fs::create_dir_all(&log).expect("log dir should be created");
        fs::write(segment_path(&log, 3), [0_u8; 128]).expect("segment should be written");
    });
    server
        .ctx
        .store()
        .write(|keyspace| keyspace.set(b"k".to_vec(), b"v".to_vec()));

    assert_that!(server.ctx.dump(), eq(true));
    server.ctx.tasks.dump.join();
    assert_that!(server.ctx.is_bgsaving().starts_with("No, "), eq(true));

    let dumps = fs::read_dir(server.path("dump"))
        .expect("dump dir should exist")
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    assert_that!(dumps.len(), eq(1));
    let manifest =
        fs::read_to_string(dumps[0].join("info")).expect("manifest should be written");
    assert_that!(manifest.contains("\r\n127.0.0.1\r\n"), eq(true));
    assert_that!(manifest.ends_with("\r\n3\r\n128\r\n"), eq(true));

    server
        .ctx
        .store()
        .write(|keyspace| keyspace.set(b"k".to_vec(), b"changed".to_vec()));
    server.ctx.load_db(&dumps[0]).expect("dump should load");
    assert_that!(&stored_value(&server.ctx, b"k"), eq(&Some(b"v".to_vec())));
}

#[rstest]
fn bgsave_command_reports_label_and_cursor() {
    let server = TestServer::start();
    let mut client = server.connect();

    let reply = client.request(&[b"BGSAVE"]);
    server.ctx.tasks.dump.join();
    assert_that!(reply.starts_with('+'), eq(true));
    assert_that!(reply.ends_with(" : 0: 0\r\n"), eq(true));
    assert_that!(
        &client.request(&[b"BGSAVEOFF"]),
        eq("-ERR no bgsave in progress\r\n")
    );
}

#[rstest]
fn load_db_keeps_live_store_when_path_is_missing() {
    let server = TestServer::start();
    server
        .ctx
        .store()
        .write(|keyspace| keyspace.set(b"k".to_vec(), b"v".to_vec()));

    let missing = server.path("no-such-dump");
    assert_that!(server.ctx.load_db(&missing).is_err(), eq(true));
    assert_that!(&stored_value(&server.ctx, b"k"), eq(&Some(b"v".to_vec())));
}

#[rstest]
fn flush_all_swaps_in_an_empty_store() {
    let server = TestServer::start();
    let mut client = server.connect();
    assert_that!(&client.request(&[b"SET", b"k", b"v"]), eq("+OK\r\n"));

    assert_that!(&client.request(&[b"FLUSHALL"]), eq("+OK\r\n"));
    server.ctx.tasks.flush.join();

    assert_that!(&client.request(&[b"GET", b"k"]), eq("$-1\r\n"));
    assert_that!(server.path("db").is_dir(), eq(true));
    assert_that!(server.path("deleting").exists(), eq(false));
}

#[rstest]
fn keyspace_scan_publishes_counts() {
    let server = TestServer::start();
    server.ctx.store().write(|keyspace| {
        keyspace.set(b"a".to_vec(), b"1".to_vec());
        keyspace.set(b"b".to_vec(), b"2".to_vec());
        keyspace.hset(b"h".to_vec(), b"f".to_vec(), b"v".to_vec());
    });

    assert_that!(server.ctx.info_keyspace(), eq(true));
    server.ctx.tasks.scan.join();

    assert_that!(&server.ctx.is_scanning(), eq("No"));
    let info = server.ctx.info(InfoSection::Keyspace);
    assert_that!(info.contains("kv keys:2\r\n"), eq(true));
    assert_that!(info.contains("hash keys:1\r\n"), eq(true));
    assert_that!(info.contains("set keys:0\r\n"), eq(true));
}

#[rstest]
fn info_command_renders_requested_sections() {
    let server = TestServer::start();
    let mut client = server.connect();

    let all = client.request(&[b"INFO"]);
    assert_that!(all.contains("# Server\r\n"), eq(true));
    assert_that!(all.contains("connected_clients:1\r\n"), eq(true));
    assert_that!(all.contains("role:single\r\n"), eq(true));
    assert_that!(all.contains("# Keyspace"), eq(false));

    let stats = client.request(&[b"INFO", b"stats"]);
    assert_that!(stats.contains("is_bgsaving:No, , 0\r\n"), eq(true));
    assert_that!(stats.contains("# Server"), eq(false));
    assert_that!(
        &client.request(&[b"INFO", b"memory"]),
        eq("-ERR invalid info section\r\n")
    );
}

#[rstest]
fn try_sync_from_unknown_connection_changes_nothing() {
    let server = TestServer::start();

    let strategy = server.ctx.try_sync(-1, LogPosition::new(0, 0));
    assert_that!(strategy, eq(SyncStrategy::StrategyError));
    assert_that!(server.ctx.state.lock().replication.has_followers, eq(false));
    assert_that!(server.ctx.binlog.consumer_count(), eq(0));
}

#[rstest]
fn trysync_from_a_client_port_connection_is_refused() {
    let server = TestServer::start();
    let mut client = server.connect();

    assert_that!(
        &client.request(&[b"TRYSYNC", b"127.0.0.1", b"9221", b"0", b"0"]),
        eq("-ERR sync position is not available\r\n")
    );
    assert_that!(server.ctx.binlog.consumer_count(), eq(0));
}

#[rstest]
fn slave_of_no_one_restores_a_writable_single_node() {
    let server = TestServer::start_with(|_, config| config.readonly = true);
    let ctx = &server.ctx;

    ctx.slave_of("127.0.0.1", 1).expect("first master should be accepted");
    assert_that!(ctx.is_readonly(), eq(true));
    assert_that!(ctx.slave_of("127.0.0.2", 1).is_err(), eq(true));

    ctx.slave_of_no_one();
    let replication = ctx.state.lock().replication.clone();
    assert_that!(replication.link, eq(MasterLinkState::Single));
    assert_that!(replication.follows_master, eq(false));
    assert_that!(replication.master_host.is_empty(), eq(true));
    assert_that!(replication.master_port, eq(0));
    assert_that!(ctx.is_readonly(), eq(false));
    assert_that!(ctx.config.read().readonly, eq(false));
}

#[rstest]
fn slaveof_command_rejects_own_address() {
    let server = TestServer::start();
    let mut client = server.connect();
    let port = server.ctx.port().to_string();

    assert_that!(
        &client.request(&[b"SLAVEOF", b"127.0.0.1", port.as_bytes()]),
        eq("-ERR cannot replicate from itself\r\n")
    );
    assert_that!(
        &client.request(&[b"SLAVEOF", b"10.0.0.1", b"70000"]),
        eq("-ERR invalid master port\r\n")
    );
    assert_that!(&client.request(&[b"SLAVEOF", b"no", b"one"]), eq("+OK\r\n"));
}

#[rstest]
fn master_streams_backlog_and_live_writes_to_slave() {
    let master = TestServer::start();
    let slave = TestServer::start();
    let mut writer = master.connect();
    assert_that!(&writer.request(&[b"SET", b"before", b"1"]), eq("+OK\r\n"));

    slave
        .ctx
        .slave_of("127.0.0.1", master.replication_addr.port())
        .expect("slave should accept the master");
    assert_that!(wait_until(|| master.ctx.slave_list().0 == 1), eq(true));
    assert_that!(
        wait_until(|| stored_value(&slave.ctx, b"before") == Some(b"1".to_vec())),
        eq(true)
    );

    assert_that!(&writer.request(&[b"SET", b"after", b"2"]), eq("+OK\r\n"));
    assert_that!(
        wait_until(|| stored_value(&slave.ctx, b"after") == Some(b"2".to_vec())),
        eq(true)
    );

    let (_, slaves) = master.ctx.slave_list();
    assert_that!(slaves.starts_with("slave0: host_port=127.0.0.1:"), eq(true));
    assert_that!(slaves.ends_with(" state=online\r\n"), eq(true));
    assert_that!(master.ctx.state.lock().replication.role_label(), eq("master"));
    assert_that!(slave.ctx.state.lock().replication.role_label(), eq("slave"));

    let mut reader = slave.connect();
    assert_that!(
        &reader.request(&[b"SET", b"x", b"y"]),
        eq("-ERR server is in readonly mode\r\n")
    );

    slave.ctx.slave_of_no_one();
    assert_that!(wait_until(|| master.ctx.slave_list().0 == 0), eq(true));
    assert_that!(&reader.request(&[b"SET", b"x", b"y"]), eq("+OK\r\n"));
}

#[derive(Default)]
struct LogRecorder {
    records: Mutex<Vec<Vec<u8>>>,
}

impl ConsumerSink for LogRecorder {
    fn on_attached(&self, _position: LogPosition) {}

    fn deliver(&self, record: &[u8]) -> bool {
        self.records.lock().push(record.to_vec());
        true
    }
}

fn set_request(key: &str) -> Vec<u8> {
    CommandFrame::new("SET", vec![key.as_bytes().to_vec(), b"v".to_vec()]).to_resp_request()
}

#[rstest]
fn flushall_is_logged_before_any_write_to_the_new_store() {
    let server = TestServer::start();
    let ctx = Arc::clone(&server.ctx);
    let recorder = Arc::new(LogRecorder::default());
    ctx.binlog
        .add_consumer(ctx.binlog.producer_position(), recorder.clone())
        .expect("recorder should attach");

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let ctx = Arc::clone(&ctx);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let exec = ExecContext {
                fd: -1,
                peer: "127.0.0.1:1".to_owned(),
                role: ClientRole::Normal,
            };
            let mut written = 0_usize;
            while !stop.load(Ordering::Acquire) {
                let key = format!("key{written}");
                let frame = CommandFrame::new("SET", vec![key.into_bytes(), b"v".to_vec()]);
                let _ = execute(&ctx, &exec, &frame);
                written += 1;
            }
            written
        })
    };
    for _ in 0..20 {
        assert_that!(wait_until(|| ctx.flush_all()), eq(true));
    }
    stop.store(true, Ordering::Release);
    let written = writer.join().expect("writer should not panic");
    ctx.tasks.flush.join();

    let flushall = encode_multibulk(&[b"FLUSHALL"]);
    let records = recorder.records.lock().clone();
    let last_flush = records
        .iter()
        .rposition(|record| *record == flushall)
        .expect("flushall should be logged");
    let positions = records
        .iter()
        .enumerate()
        .map(|(index, record)| (record.as_slice(), index))
        .collect::<HashMap<_, _>>();
    for index in 0..written {
        let key = format!("key{index}");
        let request = set_request(&key);
        let logged_at = *positions
            .get(request.as_slice())
            .expect("every write should be logged");
        let stored = stored_value(&ctx, key.as_bytes()).is_some();
        assert_that!(stored, eq(logged_at > last_flush));
    }
}

#[rstest]
fn bgsaveoff_stops_a_running_dump_and_keeps_it_as_failed() {
    let server = TestServer::start();
    server
        .ctx
        .store()
        .write(|keyspace| keyspace.set(b"k".to_vec(), b"v".to_vec()));

    // The restore blocks on opening this fifo until a reader shows up.
    let target = server.path("dump").join("20260101");
    fs::create_dir_all(&target).expect("target should be created");
    let staging = target.join("data.partial");
    let made = Command::new("mkfifo")
        .arg(&staging)
        .status()
        .expect("mkfifo should run");
    assert_that!(made.success(), eq(true));

    let engine = Arc::new(
        BackupEngine::open(server.path("dump").join("tmp")).expect("backup engine should open"),
    );
    engine.set_backup_content(&server.ctx.store());
    let claim = server
        .ctx
        .tasks
        .dump
        .try_claim()
        .expect("dump slot should be idle");
    let job = DumpJob::new(
        Arc::clone(&engine),
        target.clone(),
        "127.0.0.1".to_owned(),
        9221,
        LogPosition::new(0, 0),
    );
    assert_that!(
        server.ctx.start_dump(claim, "20260101000000".to_owned(), job),
        eq(true)
    );
    assert_that!(server.ctx.is_bgsaving().starts_with("Yes, "), eq(true));

    let stopper = {
        let ctx = Arc::clone(&server.ctx);
        thread::spawn(move || ctx.dump_off())
    };
    assert_that!(wait_until(|| engine.is_stopped()), eq(true));
    // Missing once the stopped dump gave up before reaching the fifo.
    let reader = OpenOptions::new().read(true).write(true).open(&staging).ok();
    let stopped = stopper.join().expect("stopper should not panic");
    drop(reader);

    assert_that!(stopped, eq(true));
    assert_that!(server.ctx.tasks.dump.is_running(), eq(false));
    assert_that!(server.ctx.is_bgsaving().starts_with("No, "), eq(true));
    let failed = server.path("dump").join("20260101_FAILED");
    assert_that!(target.exists(), eq(false));
    assert_that!(failed.join("data").exists(), eq(false));
    let manifest = fs::read_to_string(failed.join("info")).expect("manifest should survive");
    assert_that!(manifest.ends_with("\r\n127.0.0.1\r\n9221\r\n0\r\n0\r\n"), eq(true));
}
