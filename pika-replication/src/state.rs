//! Replication role and master-link state machine.

use pika_common::error::{PikaError, PikaResult};

/// Progress of the outbound link to a configured master.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MasterLinkState {
    /// No master configured.
    #[default]
    Single,
    /// Master configured; the next tick attempts a connection.
    Connect,
    /// Socket handed to a worker; the sync handshake is in flight or established.
    Connecting,
}

impl MasterLinkState {
    /// Returns the lowercase label used in status output.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Connect => "connect",
            Self::Connecting => "connecting",
        }
    }
}

/// Role flags and master-link bookkeeping for one node.
///
/// `follows_master` and `has_followers` are independent: a node can be a slave of one master and
/// a master for its own slaves at the same time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationState {
    /// This node replicates from a master.
    pub follows_master: bool,
    /// At least one slave completed the sync handshake with this node.
    pub has_followers: bool,
    /// Master-link state machine.
    pub link: MasterLinkState,
    /// Configured master host; empty when none.
    pub master_host: String,
    /// Configured master replication port; zero when none.
    pub master_port: u16,
    /// `ip:port` of the live master connection, the client registry key used to kill it.
    pub master_link_addr: Option<String>,
}

impl ReplicationState {
    /// Records a master to follow and schedules a connection attempt.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::InvalidState` when a master is already configured.
    pub fn configure_master(&mut self, host: impl Into<String>, port: u16) -> PikaResult<()> {
        if self.link != MasterLinkState::Single || self.follows_master {
            return Err(PikaError::InvalidState("already following a master"));
        }
        self.master_host = host.into();
        self.master_port = port;
        self.link = MasterLinkState::Connect;
        Ok(())
    }

    /// Returns the master address to dial when a connection attempt is due.
    #[must_use]
    pub fn pending_connect(&self) -> Option<(String, u16)> {
        (self.link == MasterLinkState::Connect)
            .then(|| (self.master_host.clone(), self.master_port))
    }

    /// Marks the outbound connection as handed over to a worker.
    pub fn master_connected(&mut self, link_addr: String) {
        self.follows_master = true;
        self.link = MasterLinkState::Connecting;
        self.master_link_addr = Some(link_addr);
    }

    /// Handles the master connection closing on its own.
    ///
    /// Returns `true` when a reconnect was scheduled, i.e. `link_addr` is the current link and
    /// the master is still configured.
    pub fn master_link_lost(&mut self, link_addr: &str) -> bool {
        if self.link != MasterLinkState::Connecting
            || self.master_link_addr.as_deref() != Some(link_addr)
        {
            return false;
        }
        self.follows_master = false;
        self.master_link_addr = None;
        self.link = MasterLinkState::Connect;
        true
    }

    /// Forgets the master and returns the link address whose client entry must be killed.
    pub fn clear_master(&mut self) -> Option<String> {
        self.follows_master = false;
        self.master_host.clear();
        self.master_port = 0;
        self.link = MasterLinkState::Single;
        self.master_link_addr.take()
    }

    /// Records a completed slave handshake.
    pub fn add_follower(&mut self) {
        self.has_followers = true;
    }

    /// Role label for status output.
    #[must_use]
    pub const fn role_label(&self) -> &'static str {
        match (self.has_followers, self.follows_master) {
            (false, false) => "single",
            (true, false) => "master",
            (false, true) => "slave",
            (true, true) => "master|slave",
        }
    }
}
