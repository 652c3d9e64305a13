use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use pika_common::error::{PikaError, PikaResult};
use pika_common::ids::ClientRole;
use tracing::{debug, info, warn};

use super::EventSnapshot;
use super::admission::admit;
use super::worker::PendingConnection;
use crate::app::ServerContext;

const CLIENT_LISTENER_TOKEN: Token = Token(0);
const REPLICATION_LISTENER_TOKEN: Token = Token(1);
const WAKE_TOKEN: Token = Token(2);
const MAX_EVENTS: usize = 256;
const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    Client,
    Replication,
}

/// Accepting event loop and one-second maintenance timer.
#[derive(Debug)]
pub struct Reactor {
    poll: Poll,
    events: Events,
    client_listener: TcpListener,
    replication_listener: TcpListener,
    waker: Arc<Waker>,
}

impl Reactor {
    /// Binds the client and replication listeners.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Io` when poll creation, bind or registration fails.
    pub fn bind(client_addr: SocketAddr, replication_addr: SocketAddr) -> PikaResult<Self> {
        let poll = Poll::new().map_err(|error| PikaError::io("create reactor poll", &error))?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)
            .map_err(|error| PikaError::io("create reactor waker", &error))?;

        let mut client_listener = TcpListener::bind(client_addr).map_err(|error| {
            PikaError::io(&format!("bind client listener {client_addr}"), &error)
        })?;
        poll.registry()
            .register(&mut client_listener, CLIENT_LISTENER_TOKEN, Interest::READABLE)
            .map_err(|error| PikaError::io("register client listener", &error))?;

        let mut replication_listener = TcpListener::bind(replication_addr).map_err(|error| {
            PikaError::io(
                &format!("bind replication listener {replication_addr}"),
                &error,
            )
        })?;
        poll.registry()
            .register(
                &mut replication_listener,
                REPLICATION_LISTENER_TOKEN,
                Interest::READABLE,
            )
            .map_err(|error| PikaError::io("register replication listener", &error))?;

        Ok(Self {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            client_listener,
            replication_listener,
            waker: Arc::new(waker),
        })
    }

    /// Waker that interrupts a blocked [`Reactor::run`] iteration.
    #[must_use]
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Bound client listener address.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Io` when the socket cannot report its address.
    pub fn client_addr(&self) -> PikaResult<SocketAddr> {
        self.client_listener
            .local_addr()
            .map_err(|error| PikaError::io("query client listener address", &error))
    }

    /// Bound replication listener address.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Io` when the socket cannot report its address.
    pub fn replication_addr(&self) -> PikaResult<SocketAddr> {
        self.replication_listener
            .local_addr()
            .map_err(|error| PikaError::io("query replication listener address", &error))
    }

    /// Blocks until shutdown was requested and every worker has exited.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Io` when polling fails for a reason other than an interrupt.
    pub fn run(&mut self, ctx: &Arc<ServerContext>) -> PikaResult<()> {
        let mut next_tick = Instant::now() + TICK_INTERVAL;
        loop {
            if ctx.is_shutting_down() && ctx.running_workers() == 0 {
                return Ok(());
            }

            let timeout = next_tick.saturating_duration_since(Instant::now());
            if let Err(error) = self.poll.poll(&mut self.events, Some(timeout)) {
                if error.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(PikaError::io("reactor poll wait", &error));
            }
            let snapshots = self
                .events
                .iter()
                .map(EventSnapshot::from_mio_event)
                .collect::<Vec<_>>();

            for snapshot in snapshots {
                let kind = match snapshot.token {
                    CLIENT_LISTENER_TOKEN => ListenerKind::Client,
                    REPLICATION_LISTENER_TOKEN => ListenerKind::Replication,
                    _ => continue,
                };
                if snapshot.is_error() {
                    warn!(?kind, "listener reported an error event");
                    continue;
                }
                if !ctx.is_shutting_down() {
                    self.accept_connections(ctx, kind);
                }
            }

            if Instant::now() >= next_tick {
                if !ctx.is_shutting_down() {
                    ctx.tick();
                }
                next_tick = Instant::now() + TICK_INTERVAL;
            }
        }
    }

    fn accept_connections(&self, ctx: &ServerContext, kind: ListenerKind) {
        let listener = match kind {
            ListenerKind::Client => &self.client_listener,
            ListenerKind::Replication => &self.replication_listener,
        };
        loop {
            match listener.accept() {
                Ok((socket, peer)) => match kind {
                    ListenerKind::Client => {
                        let current = ctx.client_count();
                        let mut own_addrs = Vec::<IpAddr>::with_capacity(2);
                        if let Ok(local) = socket.local_addr() {
                            own_addrs.push(local.ip());
                        }
                        if let Ok(ip) = ctx.server_ip().parse::<IpAddr>() {
                            own_addrs.push(ip);
                        }
                        if !admit(current, ctx.admission_limits(), peer.ip(), &own_addrs) {
                            warn!(%peer, current, "max connections reached, closing");
                            continue;
                        }
                        let worker = ctx.next_client_worker();
                        debug!(%peer, worker = worker.index(), "client accepted");
                        worker.enqueue(PendingConnection {
                            socket,
                            peer,
                            role: ClientRole::Normal,
                        });
                        ctx.record_accepted_client();
                    }
                    ListenerKind::Replication => {
                        let worker = ctx.next_replication_worker();
                        info!(%peer, worker = worker.index(), "replication peer accepted");
                        worker.enqueue(PendingConnection {
                            socket,
                            peer,
                            role: ClientRole::Normal,
                        });
                    }
                },
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(error)
                    if matches!(
                        error.kind(),
                        std::io::ErrorKind::Interrupted | std::io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    debug!(?kind, %error, "transient accept failure");
                }
                Err(error) => {
                    warn!(?kind, %error, "accept failed");
                    return;
                }
            }
        }
    }
}
