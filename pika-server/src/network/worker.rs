use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::{Mutex, RwLock};
use pika_common::error::{PikaError, PikaResult};
use pika_common::ids::{ClientRole, LogPosition, WorkerIndex};
use pika_core::command::{CommandFrame, CommandReply};
use pika_facade::connection::{ConnectionContext, ConnectionState};
use pika_facade::protocol::{Frame, encode_multibulk};
use pika_replication::ConsumerSink;
use tracing::{debug, error, info, warn};

use super::EventSnapshot;
use crate::app::ServerContext;
use crate::commands::{ExecContext, execute};

const WAKE_TOKEN: Token = Token(0);
const CONNECTION_TOKEN_START: usize = 1;
const MAX_EVENTS: usize = 1024;
const READ_CHUNK_BYTES: usize = 8192;
const WRITE_HIGH_WATERMARK_BYTES: usize = 256 * 1024;
const WRITE_LOW_WATERMARK_BYTES: usize = 128 * 1024;
const OUTBOX_LIMIT_BYTES: usize = 64 * 1024 * 1024;
const QPS_INTERVAL: Duration = Duration::from_secs(1);

/// Socket queued by another thread for installation on a worker.
#[derive(Debug)]
pub struct PendingConnection {
    /// Non-blocking stream.
    pub socket: TcpStream,
    /// Remote address.
    pub peer: SocketAddr,
    /// `Master` for the outbound link to this node's master, `Normal` otherwise.
    pub role: ClientRole,
}

/// Client registry entry keyed by `ip:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// `ip:port` of the peer.
    pub addr: String,
    /// Socket descriptor.
    pub fd: RawFd,
    /// Connection role.
    pub role: ClientRole,
    /// Set by `CLIENT KILL`; the owning worker closes the connection on its next wake.
    pub kill_pending: bool,
}

#[derive(Debug, Default)]
struct WorkerTables {
    conns: HashMap<RawFd, Arc<ConnectionHandle>>,
    clients: HashMap<String, ClientInfo>,
}

/// Cross-thread half of one connection.
///
/// The binlog streams records to a slave through it; the owning worker drains the outbox into
/// the socket on its next wake. A peer that lets the outbox pass its limit is cut off: the sink
/// refuses further records and the worker closes the connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    fd: RawFd,
    addr: String,
    role: Mutex<ClientRole>,
    outbox: Mutex<Vec<u8>>,
    outbox_limit: usize,
    overflowed: AtomicBool,
    closed: AtomicBool,
    waker: Arc<Waker>,
}

impl ConnectionHandle {
    fn new(fd: RawFd, addr: String, role: ClientRole, waker: Arc<Waker>) -> Self {
        Self {
            fd,
            addr,
            role: Mutex::new(role),
            outbox: Mutex::new(Vec::new()),
            outbox_limit: OUTBOX_LIMIT_BYTES,
            overflowed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            waker,
        }
    }

    #[cfg(test)]
    fn with_outbox_limit(mut self, limit: usize) -> Self {
        self.outbox_limit = limit;
        self
    }

    /// Socket descriptor.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// `ip:port` of the peer.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Current role.
    #[must_use]
    pub fn role(&self) -> ClientRole {
        *self.role.lock()
    }

    /// Changes the role.
    pub fn set_role(&self, role: ClientRole) {
        *self.role.lock() = role;
    }

    /// Returns `true` once the owning worker closed the connection.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Returns `true` once the outbox passed its limit.
    #[must_use]
    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    fn push_outbound(&self, bytes: &[u8]) -> bool {
        if self.is_closed() || self.is_overflowed() {
            return false;
        }
        {
            let mut outbox = self.outbox.lock();
            if outbox.len() + bytes.len() > self.outbox_limit {
                self.overflowed.store(true, Ordering::Release);
                outbox.clear();
                drop(outbox);
                warn!(addr = %self.addr, limit = self.outbox_limit, "outbox limit exceeded");
                self.wake_owner();
                return false;
            }
            outbox.extend_from_slice(bytes);
        }
        self.wake_owner();
        true
    }

    fn take_outbox(&self) -> Vec<u8> {
        std::mem::take(&mut *self.outbox.lock())
    }

    fn outbox_is_empty(&self) -> bool {
        self.outbox.lock().is_empty()
    }

    fn wake_owner(&self) {
        if let Err(error) = self.waker.wake() {
            warn!(addr = %self.addr, %error, "wake connection owner failed");
        }
    }
}

impl ConsumerSink for ConnectionHandle {
    fn on_attached(&self, position: LogPosition) {
        debug!(addr = %self.addr, %position, "slave attached to binlog");
        let _ = self.push_outbound(b"+OK\r\n");
    }

    fn deliver(&self, record: &[u8]) -> bool {
        self.push_outbound(record)
    }
}

/// State of one worker thread reachable from other threads.
#[derive(Debug)]
pub struct WorkerShared {
    index: WorkerIndex,
    pending: Mutex<VecDeque<PendingConnection>>,
    waker: Arc<Waker>,
    tables: RwLock<WorkerTables>,
    querynum: AtomicU64,
    last_sec_querynum: AtomicU64,
}

impl WorkerShared {
    /// Creates the shared half and the poll instance the worker thread will own.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Io` when poll or waker creation fails.
    pub fn new(index: WorkerIndex) -> PikaResult<(Arc<Self>, Poll)> {
        let poll = Poll::new()
            .map_err(|error| PikaError::io(&format!("create worker {index} poll"), &error))?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)
            .map_err(|error| PikaError::io(&format!("create worker {index} waker"), &error))?;
        let shared = Arc::new(Self {
            index,
            pending: Mutex::new(VecDeque::new()),
            waker: Arc::new(waker),
            tables: RwLock::new(WorkerTables::default()),
            querynum: AtomicU64::new(0),
            last_sec_querynum: AtomicU64::new(0),
        });
        Ok((shared, poll))
    }

    /// Worker index.
    #[must_use]
    pub fn index(&self) -> WorkerIndex {
        self.index
    }

    /// Queues a socket for installation and wakes the worker.
    pub fn enqueue(&self, connection: PendingConnection) {
        self.pending.lock().push_back(connection);
        self.wake();
    }

    /// Interrupts the worker's poll.
    pub fn wake(&self) {
        if let Err(error) = self.waker.wake() {
            warn!(worker = self.index, %error, "wake worker failed");
        }
    }

    /// Connections currently registered.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.tables.read().clients.len()
    }

    /// Snapshot of the client registry.
    #[must_use]
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.tables.read().clients.values().cloned().collect()
    }

    /// Looks up a live connection by descriptor.
    #[must_use]
    pub fn connection(&self, fd: RawFd) -> Option<Arc<ConnectionHandle>> {
        self.tables.read().conns.get(&fd).cloned()
    }

    /// Sets the role of connection `fd` in both tables. Returns `false` when it is unknown.
    pub fn set_role(&self, fd: RawFd, role: ClientRole) -> bool {
        let mut tables = self.tables.write();
        let Some(handle) = tables.conns.get(&fd).cloned() else {
            return false;
        };
        if let Some(client) = tables.clients.get_mut(handle.addr()) {
            client.role = role;
        }
        handle.set_role(role);
        true
    }

    /// Marks client `addr` for closing. Returns `false` when this worker does not own it.
    pub fn kill_client(&self, addr: &str) -> bool {
        {
            let mut tables = self.tables.write();
            let Some(client) = tables.clients.get_mut(addr) else {
                return false;
            };
            client.kill_pending = true;
        }
        self.wake();
        true
    }

    /// Marks every `Normal` client for closing and returns how many were marked.
    pub fn kill_normal_clients(&self) -> usize {
        let killed = {
            let mut tables = self.tables.write();
            let mut killed = 0;
            for client in tables.clients.values_mut() {
                if client.role == ClientRole::Normal {
                    client.kill_pending = true;
                    killed += 1;
                }
            }
            killed
        };
        if killed > 0 {
            self.wake();
        }
        killed
    }

    fn kill_pending_fds(&self) -> Vec<RawFd> {
        self.tables
            .read()
            .clients
            .values()
            .filter(|client| client.kill_pending)
            .map(|client| client.fd)
            .collect()
    }

    /// Commands executed since startup.
    #[must_use]
    pub fn querynum(&self) -> u64 {
        self.querynum.load(Ordering::Relaxed)
    }

    /// Commands executed during the last full second.
    #[must_use]
    pub fn last_sec_querynum(&self) -> u64 {
        self.last_sec_querynum.load(Ordering::Relaxed)
    }

    fn register(&self, handle: &Arc<ConnectionHandle>, role: ClientRole) {
        let mut tables = self.tables.write();
        tables.conns.insert(handle.fd(), Arc::clone(handle));
        tables.clients.insert(
            handle.addr().to_owned(),
            ClientInfo {
                addr: handle.addr().to_owned(),
                fd: handle.fd(),
                role,
                kill_pending: false,
            },
        );
    }

    fn unregister(&self, handle: &ConnectionHandle) {
        let mut tables = self.tables.write();
        tables.conns.remove(&handle.fd());
        if tables
            .clients
            .get(handle.addr())
            .is_some_and(|client| client.fd == handle.fd())
        {
            tables.clients.remove(handle.addr());
        }
    }
}

/// Starts the thread that drives `poll` for worker `shared`.
///
/// # Errors
///
/// Returns `PikaError::Io` when the thread cannot be spawned.
pub fn spawn_worker(
    ctx: Arc<ServerContext>,
    shared: Arc<WorkerShared>,
    poll: Poll,
) -> PikaResult<JoinHandle<()>> {
    let index = shared.index();
    ctx.worker_started();
    let spawned_ctx = Arc::clone(&ctx);
    thread::Builder::new()
        .name(format!("pika-worker-{index}"))
        .spawn(move || {
            WorkerLoop {
                ctx: spawned_ctx,
                shared,
                poll,
                events: Events::with_capacity(MAX_EVENTS),
                next_token: CONNECTION_TOKEN_START,
                connections: HashMap::new(),
                last_querynum: 0,
                next_qps_roll: Instant::now() + QPS_INTERVAL,
            }
            .run();
        })
        .map_err(|error| {
            ctx.worker_exited();
            PikaError::io(&format!("spawn worker {index}"), &error)
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionLifecycle {
    Active,
    Draining,
    Closing,
}

#[derive(Debug)]
struct LocalConnection {
    socket: TcpStream,
    handle: Arc<ConnectionHandle>,
    parser: ConnectionState,
    write_buffer: Vec<u8>,
    lifecycle: ConnectionLifecycle,
    read_paused_by_backpressure: bool,
    interest: Interest,
}

impl LocalConnection {
    fn new(socket: TcpStream, handle: Arc<ConnectionHandle>, peer: SocketAddr) -> Self {
        Self {
            socket,
            handle,
            parser: ConnectionState::new(ConnectionContext { peer }),
            write_buffer: Vec::new(),
            lifecycle: ConnectionLifecycle::Active,
            read_paused_by_backpressure: false,
            interest: Interest::READABLE,
        }
    }

    fn mark_draining(&mut self) {
        if self.lifecycle == ConnectionLifecycle::Active {
            self.lifecycle = ConnectionLifecycle::Draining;
        }
    }

    fn mark_closing(&mut self) {
        self.lifecycle = ConnectionLifecycle::Closing;
    }

    fn can_read(&self) -> bool {
        self.lifecycle == ConnectionLifecycle::Active && !self.read_paused_by_backpressure
    }

    fn should_close_now(&self) -> bool {
        self.lifecycle == ConnectionLifecycle::Closing
            || (self.lifecycle == ConnectionLifecycle::Draining && self.write_buffer.is_empty())
    }

    fn queue_reply(&mut self, bytes: &[u8]) {
        self.write_buffer.extend_from_slice(bytes);
        self.update_backpressure_state();
    }

    fn update_backpressure_state(&mut self) {
        if self.read_paused_by_backpressure {
            if self.write_buffer.len() <= WRITE_LOW_WATERMARK_BYTES {
                self.read_paused_by_backpressure = false;
            }
            return;
        }
        if self.write_buffer.len() >= WRITE_HIGH_WATERMARK_BYTES {
            self.read_paused_by_backpressure = true;
        }
    }
}

struct WorkerLoop {
    ctx: Arc<ServerContext>,
    shared: Arc<WorkerShared>,
    poll: Poll,
    events: Events,
    next_token: usize,
    connections: HashMap<Token, LocalConnection>,
    last_querynum: u64,
    next_qps_roll: Instant,
}

impl WorkerLoop {
    fn run(mut self) {
        debug!(worker = self.shared.index(), "worker started");
        while !self.ctx.is_shutting_down() {
            let timeout = self.next_qps_roll.saturating_duration_since(Instant::now());
            if let Err(error) = self.poll.poll(&mut self.events, Some(timeout)) {
                if error.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(worker = self.shared.index(), %error, "worker poll failed");
                break;
            }
            let snapshots = self
                .events
                .iter()
                .map(EventSnapshot::from_mio_event)
                .collect::<Vec<_>>();
            for snapshot in snapshots {
                if snapshot.token != WAKE_TOKEN {
                    self.handle_connection_event(snapshot);
                }
            }

            self.install_pending();
            self.service_connections();
            self.roll_qps();
        }

        let tokens = self.connections.keys().copied().collect::<Vec<_>>();
        for token in tokens {
            if let Some(connection) = self.connections.remove(&token) {
                self.close_connection(connection);
            }
        }
        debug!(worker = self.shared.index(), "worker stopped");
        self.ctx.worker_exited();
    }

    fn install_pending(&mut self) {
        let pending = self.shared.pending.lock().drain(..).collect::<Vec<_>>();
        for connection in pending {
            let peer = connection.peer;
            if let Err(error) = self.install(connection) {
                warn!(worker = self.shared.index(), %peer, %error, "install connection failed");
            }
        }
    }

    fn install(&mut self, pending: PendingConnection) -> PikaResult<()> {
        let PendingConnection {
            mut socket,
            peer,
            role,
        } = pending;
        let token = self.allocate_connection_token();
        self.poll
            .registry()
            .register(&mut socket, token, Interest::READABLE)
            .map_err(|error| PikaError::io("register connection in worker poll", &error))?;
        let _ = socket.set_nodelay(true);

        let handle = Arc::new(ConnectionHandle::new(
            socket.as_raw_fd(),
            peer.to_string(),
            role,
            Arc::clone(&self.shared.waker),
        ));
        self.shared.register(&handle, role);

        let mut connection = LocalConnection::new(socket, handle, peer);
        if role == ClientRole::Master {
            let request = self.sync_request();
            connection.queue_reply(&request);
            info!(master = %peer, "master link installed, sync requested");
        }
        self.connections.insert(token, connection);
        Ok(())
    }

    fn sync_request(&self) -> Vec<u8> {
        let position = self.ctx.binlog.producer_position();
        let port = self.ctx.port().to_string();
        let filenum = position.filenum.to_string();
        let offset = position.offset.to_string();
        encode_multibulk(&[
            b"TRYSYNC",
            self.ctx.server_ip().as_bytes(),
            port.as_bytes(),
            filenum.as_bytes(),
            offset.as_bytes(),
        ])
    }

    fn service_connections(&mut self) {
        let killed = self.shared.kill_pending_fds();
        let tokens = self.connections.keys().copied().collect::<Vec<_>>();
        for token in tokens {
            let Some(mut connection) = self.connections.remove(&token) else {
                continue;
            };
            if killed.contains(&connection.handle.fd()) {
                info!(addr = %connection.handle.addr(), "client killed");
                connection.mark_closing();
            } else if connection.handle.is_overflowed() {
                warn!(addr = %connection.handle.addr(), "closing peer that stopped reading");
                connection.mark_closing();
            } else {
                Self::drain_outbox(&mut connection);
            }
            self.finish_connection_turn(token, connection);
        }
    }

    fn handle_connection_event(&mut self, snapshot: EventSnapshot) {
        let Some(mut connection) = self.connections.remove(&snapshot.token) else {
            return;
        };
        if snapshot.readable() && connection.can_read() {
            self.read_connection_bytes(&mut connection);
        }
        if snapshot.closed_or_error() {
            connection.mark_draining();
        }
        if snapshot.readable() || snapshot.writable() {
            Self::drain_outbox(&mut connection);
        }
        self.finish_connection_turn(snapshot.token, connection);
    }

    fn finish_connection_turn(&mut self, token: Token, mut connection: LocalConnection) {
        if connection.should_close_now() {
            self.close_connection(connection);
            return;
        }
        if let Err(error) = self.refresh_connection_interest(token, &mut connection) {
            warn!(addr = %connection.handle.addr(), %error, "refresh interest failed");
            self.close_connection(connection);
            return;
        }
        self.connections.insert(token, connection);
    }

    fn read_connection_bytes(&self, connection: &mut LocalConnection) {
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        loop {
            match connection.socket.read(&mut chunk) {
                Ok(0) => {
                    connection.mark_draining();
                    return;
                }
                Ok(read_len) => {
                    connection.parser.feed_bytes(&chunk[..read_len]);
                    self.process_frames(connection);
                    if !connection.can_read() {
                        return;
                    }
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_error) => {
                    connection.mark_closing();
                    return;
                }
            }
        }
    }

    fn process_frames(&self, connection: &mut LocalConnection) {
        while connection.lifecycle == ConnectionLifecycle::Active {
            match connection.parser.try_pop_frame() {
                Ok(Some(frame)) => self.execute_frame(connection, frame),
                Ok(None) => return,
                Err(error) => {
                    let reply = CommandReply::Error(error.to_string());
                    connection.queue_reply(&reply.to_resp_bytes());
                    connection.mark_draining();
                    return;
                }
            }
        }
    }

    fn execute_frame(&self, connection: &mut LocalConnection, frame: Frame) {
        let role = connection.handle.role();
        match frame {
            Frame::Command(command) => {
                self.shared.querynum.fetch_add(1, Ordering::Relaxed);
                let exec = ExecContext {
                    fd: connection.handle.fd(),
                    peer: connection.handle.addr().to_owned(),
                    role,
                };
                let reply = execute(&self.ctx, &exec, &CommandFrame::from(command));
                if reply != CommandReply::NoReply {
                    connection.queue_reply(&reply.to_resp_bytes());
                }
            }
            Frame::Status(status) if role == ClientRole::Master => {
                info!(master = %connection.handle.addr(), %status, "master accepted sync");
            }
            Frame::Error(message) if role == ClientRole::Master => {
                warn!(master = %connection.handle.addr(), %message, "master refused sync");
                connection.mark_closing();
            }
            Frame::Status(_) | Frame::Error(_) => {
                let reply = CommandReply::Error("unexpected reply frame from client".to_owned());
                connection.queue_reply(&reply.to_resp_bytes());
                connection.mark_draining();
            }
        }
    }

    /// Moves outbox bytes into the write buffer while it sits below the high watermark and
    /// writes as much as the socket takes.
    fn drain_outbox(connection: &mut LocalConnection) {
        loop {
            if connection.write_buffer.len() < WRITE_HIGH_WATERMARK_BYTES {
                let outbound = connection.handle.take_outbox();
                if !outbound.is_empty() {
                    connection.queue_reply(&outbound);
                }
            }
            if connection.write_buffer.is_empty() {
                return;
            }
            Self::flush_connection_writes(connection);
            let stalled = !connection.write_buffer.is_empty();
            if stalled
                || connection.lifecycle == ConnectionLifecycle::Closing
                || connection.handle.outbox_is_empty()
            {
                return;
            }
        }
    }

    fn flush_connection_writes(connection: &mut LocalConnection) {
        while !connection.write_buffer.is_empty() {
            match connection.socket.write(connection.write_buffer.as_slice()) {
                Ok(0) => {
                    connection.mark_closing();
                    return;
                }
                Ok(written) => {
                    let _ = connection.write_buffer.drain(..written);
                    connection.update_backpressure_state();
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_error) => {
                    connection.mark_closing();
                    return;
                }
            }
        }
    }

    fn refresh_connection_interest(
        &self,
        token: Token,
        connection: &mut LocalConnection,
    ) -> PikaResult<()> {
        let next_interest = if connection.write_buffer.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if next_interest == connection.interest {
            return Ok(());
        }
        self.poll
            .registry()
            .reregister(&mut connection.socket, token, next_interest)
            .map_err(|error| PikaError::io("refresh connection poll interest", &error))?;
        connection.interest = next_interest;
        Ok(())
    }

    fn close_connection(&self, mut connection: LocalConnection) {
        let _ = self.poll.registry().deregister(&mut connection.socket);
        let handle = &connection.handle;
        handle.mark_closed();
        self.shared.unregister(handle);
        debug!(
            worker = self.shared.index(),
            addr = %handle.addr(),
            role = handle.role().label(),
            "connection closed"
        );
        if handle.role() == ClientRole::Master {
            self.ctx.master_link_lost(handle.addr());
        }
    }

    fn roll_qps(&mut self) {
        let now = Instant::now();
        if now < self.next_qps_roll {
            return;
        }
        let total = self.shared.querynum();
        self.shared
            .last_sec_querynum
            .store(total.saturating_sub(self.last_querynum), Ordering::Relaxed);
        self.last_querynum = total;
        self.next_qps_roll = now + QPS_INTERVAL;
    }

    fn allocate_connection_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token = self.next_token.saturating_add(1);
        token
    }
}
