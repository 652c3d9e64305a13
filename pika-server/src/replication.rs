//! Replication coordinator: master-link lifecycle on the slave side and the sync handshake on
//! the master side.
//!
//! The link state machine lives in [`pika_replication::ReplicationState`] under the coarse state
//! mutex. Socket work (connect, kill) always happens after that mutex is released.

use std::net::{SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use pika_common::error::{PikaError, PikaResult};
use pika_common::ids::{ClientRole, LogPosition};
use pika_replication::ConsumerSink;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{info, warn};

use crate::app::ServerContext;
use crate::network::PendingConnection;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(600);

/// Outcome of a slave's `TRYSYNC` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// The slave streams the binlog from the requested position.
    PartialSync,
    /// The connection or the position is unusable; the slave may retry another position.
    StrategyError,
}

impl ServerContext {
    /// Starts following the master whose replication listener is `host:port`.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::InvalidState` when a master is already configured.
    pub fn slave_of(&self, host: &str, port: u16) -> PikaResult<()> {
        let mut state = self.state.lock();
        state.replication.configure_master(host, port)?;
        state.readonly = true;
        info!(host, port, "master configured, node is now readonly");
        Ok(())
    }

    /// Forgets the master and closes the link to it.
    pub fn disconnect_from_master(&self) {
        let link = self.state.lock().replication.clear_master();
        if let Some(addr) = link {
            let killed = self.kill_client(&addr);
            info!(%addr, killed, "master link dropped");
        }
    }

    /// Stops following a master and accepts writes again.
    pub fn slave_of_no_one(&self) {
        self.disconnect_from_master();
        self.state.lock().readonly = false;
        self.config.write().readonly = false;
        info!("replication stopped, node is writable");
    }

    /// Handles `TRYSYNC` from the connection `fd`: attaches it to the binlog at `position`.
    ///
    /// Only connections owned by replication workers qualify. Nothing changes on failure.
    pub fn try_sync(&self, fd: RawFd, position: LogPosition) -> SyncStrategy {
        let found = self
            .replication_workers()
            .iter()
            .find_map(|worker| worker.connection(fd).map(|handle| (worker, handle)));
        let Some((worker, handle)) = found else {
            warn!(fd, "sync requested from a connection outside the replication workers");
            return SyncStrategy::StrategyError;
        };

        let sink: Arc<dyn ConsumerSink> = handle.clone();
        if let Err(error) = self.binlog.add_consumer(position, sink) {
            warn!(addr = %handle.addr(), %position, %error, "binlog consumer rejected");
            return SyncStrategy::StrategyError;
        }
        self.state.lock().replication.add_follower();
        worker.set_role(fd, ClientRole::Slave);
        SyncStrategy::PartialSync
    }

    /// Called by the owning worker when the master link closed on its own.
    pub fn master_link_lost(&self, addr: &str) {
        if self.state.lock().replication.master_link_lost(addr) {
            warn!(%addr, "master link lost, reconnecting");
        }
    }

    /// Dials the configured master when a connection attempt is due.
    pub(crate) fn replication_tick(&self) {
        let pending = self.state.lock().replication.pending_connect();
        if let Some((host, port)) = pending {
            self.connect_to_master(&host, port);
        }
    }

    fn connect_to_master(&self, host: &str, port: u16) {
        let stream = match dial(host, port) {
            Ok(stream) => stream,
            Err(error) => {
                warn!(host, port, %error, "connect to master failed");
                return;
            }
        };
        let Some(worker) = self.master_link_worker() else {
            return;
        };

        let peer = stream.peer;
        let link_addr = peer.to_string();
        {
            let mut state = self.state.lock();
            if state.replication.pending_connect() != Some((host.to_owned(), port)) {
                info!(host, port, "master changed while connecting, dropping socket");
                return;
            }
            state.replication.master_connected(link_addr.clone());
        }
        worker.enqueue(PendingConnection {
            socket: stream.socket,
            peer,
            role: ClientRole::Master,
        });
        info!(master = %link_addr, worker = worker.index(), "master connected");
    }
}

struct Dialed {
    socket: mio::net::TcpStream,
    peer: SocketAddr,
}

fn dial(host: &str, port: u16) -> PikaResult<Dialed> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|error| PikaError::io(&format!("resolve {host}:{port}"), &error))?
        .next()
        .ok_or_else(|| PikaError::Replication(format!("{host}:{port} did not resolve")))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|error| PikaError::io("create master socket", &error))?;
    socket
        .set_keepalive(true)
        .map_err(|error| PikaError::io("enable SO_KEEPALIVE", &error))?;
    socket
        .set_reuse_address(true)
        .map_err(|error| PikaError::io("enable SO_REUSEADDR", &error))?;
    socket
        .connect_timeout(&addr.into(), CONNECT_TIMEOUT)
        .map_err(|error| PikaError::io(&format!("connect {addr}"), &error))?;
    if let Some(error) = socket
        .take_error()
        .map_err(|error| PikaError::io("read socket error option", &error))?
    {
        return Err(PikaError::io(&format!("connect {addr}"), &error));
    }
    socket
        .set_nonblocking(true)
        .map_err(|error| PikaError::io("set master socket non-blocking", &error))?;

    let stream = StdTcpStream::from(socket);
    let peer = stream
        .peer_addr()
        .map_err(|error| PikaError::io("query master peer address", &error))?;
    Ok(Dialed {
        socket: mio::net::TcpStream::from_std(stream),
        peer,
    })
}
