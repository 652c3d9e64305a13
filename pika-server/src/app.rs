//! Process composition root for `pika-server`.
//!
//! [`Server`] owns the reactor and the worker threads; everything they share lives in one
//! [`ServerContext`] behind an `Arc`. Background tasks receive a clone of the same `Arc`.
//!
//! # Lock hierarchy
//!
//! 1. `ServerContext::storage` (outermost). Data commands hold it for read across the handler
//!    and the binlog append; flush-all, dump setup and `load_db` take it for write.
//! 2. At most one of: a worker's table lock, the binlog mutex, `ServerContext::state`,
//!    `ServerContext::config`. Code never holds two of these at once.
//! 3. Leaf mutexes: connection outboxes and roles, worker pending queues, task slot handles,
//!    the backup engine's content.
//!
//! Administrative handlers run without the storage lock. The readonly flag lives in
//! [`ServerState`], so switching roles never needs to touch the storage lock.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Instant, SystemTime};

use chrono::{DateTime, Local};
use mio::Waker;
use parking_lot::{Mutex, RwLock};
use pika_common::config::ServerConfig;
use pika_common::error::PikaResult;
use pika_common::ids::LogPosition;
use pika_core::dispatch::CommandRegistry;
use pika_replication::{Binlog, ReplicationState};
use pika_storage::{BackupEngine, KeyCounts, Store, StoreOptions};
use tracing::{error, info, warn};

use crate::commands::{ServerHandler, build_registry};
use crate::network::{AdmissionLimits, Reactor, RoundRobin, WorkerShared, spawn_worker};
use crate::tasks::TaskSlots;

/// Bookkeeping of the current or last dump.
#[derive(Debug, Default)]
pub struct DumpState {
    /// `%Y%m%d%H%M%S` local time the dump started.
    pub label: String,
    /// Monotonic start time of the running dump.
    pub started_at: Option<Instant>,
    /// Binlog cursor captured together with the backup content.
    pub cursor: LogPosition,
    /// Engine of the running dump; `None` when idle.
    pub engine: Option<Arc<BackupEngine>>,
}

/// Result of the last keyspace scan.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyspaceScan {
    /// Per-family key counts of the last finished scan.
    pub counts: KeyCounts,
    /// Local time the last finished scan started.
    pub started_at: Option<DateTime<Local>>,
    /// Local start time of the scan in progress.
    pub running_since: Option<DateTime<Local>>,
}

/// Mutable process state guarded by one coarse mutex.
#[derive(Debug)]
pub struct ServerState {
    /// Role flags and master link.
    pub replication: ReplicationState,
    /// Write commands from regular clients are rejected.
    pub readonly: bool,
    /// Dump bookkeeping.
    pub dump: DumpState,
    /// Published by the keyspace scan task.
    pub keyspace: KeyspaceScan,
    /// Start of the day window the next age-based purge looks at.
    pub last_purge_time: SystemTime,
}

/// State shared by the reactor, the workers and background tasks.
pub struct ServerContext {
    /// Running configuration.
    pub config: RwLock<ServerConfig>,
    /// Coarse process state.
    pub state: Mutex<ServerState>,
    /// Live store; swapped wholesale by flush-all and `load_db`.
    pub storage: RwLock<Arc<Store>>,
    /// Write log feeding slaves.
    pub binlog: Arc<Binlog>,
    /// Shared halves of every worker thread, indexed by worker number.
    pub workers: Vec<Arc<WorkerShared>>,
    /// Background task slots.
    pub tasks: TaskSlots,
    /// Data and administrative command table.
    pub registry: CommandRegistry<ServerHandler>,
    client_rr: RoundRobin,
    slave_rr: RoundRobin,
    thread_num: usize,
    slave_thread_num: usize,
    server_ip: String,
    port: u16,
    history_clients: AtomicU64,
    start_time: Instant,
    shutdown: AtomicBool,
    running_workers: AtomicUsize,
    reactor_waker: Arc<Waker>,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("server_ip", &self.server_ip)
            .field("port", &self.port)
            .field("workers", &self.workers.len())
            .field("shutdown", &self.shutdown.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl ServerContext {
    /// Number of client worker threads, `[0, thread_num)`.
    #[must_use]
    pub fn thread_num(&self) -> usize {
        self.thread_num
    }

    /// Worker indices serving slave connections.
    #[must_use]
    pub fn replication_workers(&self) -> &[Arc<WorkerShared>] {
        let end = self.thread_num + self.slave_thread_num;
        &self.workers[self.thread_num..end]
    }

    /// Worker that owns the outbound master link.
    #[must_use]
    pub fn master_link_worker(&self) -> Option<&Arc<WorkerShared>> {
        self.workers.last()
    }

    /// Next client worker, round-robin.
    #[must_use]
    pub fn next_client_worker(&self) -> &Arc<WorkerShared> {
        &self.workers[self.client_rr.next_index()]
    }

    /// Next replication worker, round-robin.
    #[must_use]
    pub fn next_replication_worker(&self) -> &Arc<WorkerShared> {
        &self.workers[self.slave_rr.next_index()]
    }

    /// Address this node reports to masters and writes into dump manifests.
    #[must_use]
    pub fn server_ip(&self) -> &str {
        &self.server_ip
    }

    /// Client port this node listens on.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current connection ceilings.
    #[must_use]
    pub fn admission_limits(&self) -> AdmissionLimits {
        let config = self.config.read();
        AdmissionLimits {
            maxconnection: config.maxconnection,
            root_connection_num: config.root_connection_num,
        }
    }

    /// Counts one more accepted client connection.
    pub fn record_accepted_client(&self) {
        self.history_clients.fetch_add(1, Ordering::Relaxed);
    }

    /// Clients accepted since startup.
    #[must_use]
    pub fn history_clients(&self) -> u64 {
        self.history_clients.load(Ordering::Relaxed)
    }

    /// Seconds since the context was built.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Returns `true` when write commands from regular clients must be rejected.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.state.lock().readonly
    }

    /// Current store handle.
    #[must_use]
    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.storage.read())
    }

    /// Asks the reactor and every worker to stop.
    pub fn request_shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutdown requested");
        for worker in &self.workers {
            worker.wake();
        }
        if let Err(error) = self.reactor_waker.wake() {
            warn!(%error, "wake reactor failed");
        }
    }

    /// Returns `true` once shutdown was requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Worker threads that have not exited yet.
    #[must_use]
    pub fn running_workers(&self) -> usize {
        self.running_workers.load(Ordering::Acquire)
    }

    pub(crate) fn worker_started(&self) {
        self.running_workers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn worker_exited(&self) {
        self.running_workers.fetch_sub(1, Ordering::AcqRel);
        if let Err(error) = self.reactor_waker.wake() {
            warn!(%error, "wake reactor failed");
        }
    }

    /// One-second maintenance: auto-purge, then master connect retries.
    pub fn tick(self: &Arc<Self>) {
        self.auto_purge();
        self.replication_tick();
    }
}

/// Running server: reactor plus worker threads.
#[derive(Debug)]
pub struct Server {
    ctx: Arc<ServerContext>,
    reactor: Reactor,
    worker_threads: Vec<JoinHandle<()>>,
}

impl Server {
    /// Opens storage and binlog, binds both listeners and starts the worker pool.
    ///
    /// # Errors
    ///
    /// Returns the first startup failure: store, binlog, listener bind or poll creation.
    pub fn bind(config: ServerConfig) -> PikaResult<Self> {
        let client_addr = config.client_bind_addr();
        let replication_addr = config.replication_bind_addr();
        Self::bind_with_addrs(config, client_addr, replication_addr)
    }

    /// Same as [`Server::bind`] with explicit listener addresses.
    ///
    /// # Errors
    ///
    /// Returns the first startup failure: store, binlog, listener bind or poll creation.
    pub fn bind_with_addrs(
        config: ServerConfig,
        client_addr: SocketAddr,
        replication_addr: SocketAddr,
    ) -> PikaResult<Self> {
        let store = Store::open(&config.db_path, StoreOptions::default())?;
        let binlog = Binlog::open(&config.log_path, config.binlog_file_size)?;
        let reactor = Reactor::bind(client_addr, replication_addr)?;

        let mut workers = Vec::with_capacity(config.worker_thread_count());
        let mut polls = Vec::with_capacity(config.worker_thread_count());
        for index in 0..config.worker_thread_count() {
            let (shared, poll) = WorkerShared::new(index)?;
            workers.push(shared);
            polls.push(poll);
        }

        let server_ip = detect_server_ip(&config);
        let port = reactor.client_addr()?.port();
        let ctx = Arc::new(ServerContext {
            state: Mutex::new(ServerState {
                replication: ReplicationState::default(),
                readonly: config.readonly,
                dump: DumpState::default(),
                keyspace: KeyspaceScan::default(),
                last_purge_time: SystemTime::now(),
            }),
            storage: RwLock::new(Arc::new(store)),
            binlog: Arc::new(binlog),
            workers,
            tasks: TaskSlots::default(),
            registry: build_registry(),
            client_rr: RoundRobin::new(0, config.thread_num),
            slave_rr: RoundRobin::new(config.thread_num, config.slave_thread_num),
            thread_num: config.thread_num,
            slave_thread_num: config.slave_thread_num,
            server_ip,
            port,
            history_clients: AtomicU64::new(0),
            start_time: Instant::now(),
            shutdown: AtomicBool::new(false),
            running_workers: AtomicUsize::new(0),
            reactor_waker: reactor.waker(),
            config: RwLock::new(config),
        });

        let mut server = Self {
            ctx: Arc::clone(&ctx),
            reactor,
            worker_threads: Vec::with_capacity(polls.len()),
        };
        for (shared, poll) in ctx.workers.iter().zip(polls) {
            let handle = spawn_worker(Arc::clone(&ctx), Arc::clone(shared), poll)?;
            server.worker_threads.push(handle);
        }
        info!(
            ip = %ctx.server_ip,
            port = ctx.port,
            workers = ctx.workers.len(),
            "server started"
        );
        Ok(server)
    }

    /// Shared context.
    #[cfg(test)]
    #[must_use]
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Bound client listener address.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Io` when the socket cannot report its address.
    pub fn client_addr(&self) -> PikaResult<SocketAddr> {
        self.reactor.client_addr()
    }

    /// Bound replication listener address.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Io` when the socket cannot report its address.
    pub fn replication_addr(&self) -> PikaResult<SocketAddr> {
        self.reactor.replication_addr()
    }

    /// Runs the reactor until shutdown, then joins workers and checkpoints the store.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Io` when polling fails fatally or the final checkpoint fails.
    pub fn run(mut self) -> PikaResult<()> {
        let result = self.reactor.run(&self.ctx);
        if result.is_err() {
            self.ctx.request_shutdown();
        }
        self.join_workers();
        result?;
        self.ctx.tasks.dump.join();
        self.ctx.store().checkpoint()?;
        info!("server stopped");
        Ok(())
    }

    fn join_workers(&mut self) {
        for handle in self.worker_threads.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.ctx.request_shutdown();
        self.join_workers();
    }
}

fn detect_server_ip(config: &ServerConfig) -> String {
    if let Some(ip) = config.server_ip.as_deref() {
        return ip.to_owned();
    }
    // Connecting a UDP socket only consults the routing table; no packet is sent.
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(10, 255, 255, 255), 9))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .to_string()
}

#[cfg(test)]
#[path = "app/app_tests.rs"]
mod app_tests;
