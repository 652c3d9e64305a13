//! Runtime configuration shared by module bootstrap code.
//!
//! The server reads one TOML file at startup. Every key is optional and falls back to the
//! defaults below, so a minimal file only names the paths and ports that differ.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PikaError, PikaResult};

/// Distance between the client port and the replication port.
pub const REPLICATION_PORT_OFFSET: u16 = 100;

/// Bootstrap configuration used by `pika-server` during process startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Client listener port. The replication listener uses `port + 100`.
    pub port: u16,
    /// Number of worker threads serving regular clients.
    pub thread_num: usize,
    /// Number of worker threads serving slave connections.
    pub slave_thread_num: usize,
    /// Soft ceiling of connected clients; only local peers are admitted above it.
    pub maxconnection: usize,
    /// Extra slots above `maxconnection` reserved for local administrative peers.
    pub root_connection_num: usize,
    /// Address this node reports as its own; detected from the routing table when unset.
    pub server_ip: Option<String>,
    /// Live storage directory.
    pub db_path: PathBuf,
    /// Binlog segment directory.
    pub log_path: PathBuf,
    /// Root directory for dumps.
    pub dump_path: PathBuf,
    /// Prefix prepended to the dated dump directory name.
    pub dump_prefix: String,
    /// Segment count above which the oldest binlog segments are purged.
    pub expire_logs_nums: u32,
    /// Age in days after which binlog segments are purged.
    pub expire_logs_days: u32,
    /// Size in bytes at which the binlog rolls to the next segment.
    pub binlog_file_size: u64,
    /// Rejects write commands from regular clients.
    pub readonly: bool,
    /// Default `tracing` filter directive, overridden by `RUST_LOG`.
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9221,
            thread_num: 4,
            slave_thread_num: 2,
            maxconnection: 20_000,
            root_connection_num: 2,
            server_ip: None,
            db_path: PathBuf::from("./db/"),
            log_path: PathBuf::from("./log/"),
            dump_path: PathBuf::from("./dump/"),
            dump_prefix: String::new(),
            expire_logs_nums: 10,
            expire_logs_days: 7,
            binlog_file_size: 100 * 1024 * 1024,
            readonly: false,
            log_level: "info".to_owned(),
        }
    }
}

impl ServerConfig {
    /// Loads and validates one TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Io` when the file cannot be read and `PikaError::InvalidConfig`
    /// when it does not parse or fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> PikaResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|error| PikaError::io(&format!("read config {}", path.display()), &error))?;
        Self::from_toml(&contents)
    }

    /// Parses and validates configuration text.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::InvalidConfig` when the text is not valid TOML or fails validation.
    pub fn from_toml(contents: &str) -> PikaResult<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|error| PikaError::InvalidConfig(format!("parse TOML failed: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants the server relies on.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::InvalidConfig` naming the first offending key.
    pub fn validate(&self) -> PikaResult<()> {
        if self.thread_num == 0 {
            return Err(PikaError::InvalidConfig("thread_num must be at least 1".to_owned()));
        }
        if self.slave_thread_num == 0 {
            return Err(PikaError::InvalidConfig(
                "slave_thread_num must be at least 1".to_owned(),
            ));
        }
        if self.port > u16::MAX - REPLICATION_PORT_OFFSET {
            return Err(PikaError::InvalidConfig(format!(
                "port {} leaves no room for the replication port",
                self.port
            )));
        }
        if self.binlog_file_size == 0 {
            return Err(PikaError::InvalidConfig(
                "binlog_file_size must be positive".to_owned(),
            ));
        }
        for (key, path) in [
            ("db_path", &self.db_path),
            ("log_path", &self.log_path),
            ("dump_path", &self.dump_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(PikaError::InvalidConfig(format!("{key} cannot be empty")));
            }
        }
        if let Some(ip) = self.server_ip.as_deref()
            && ip.parse::<IpAddr>().is_err()
        {
            return Err(PikaError::InvalidConfig(format!(
                "server_ip `{ip}` is not an IP address"
            )));
        }
        Ok(())
    }

    /// Replication listener port.
    #[must_use]
    pub fn replication_port(&self) -> u16 {
        self.port.saturating_add(REPLICATION_PORT_OFFSET)
    }

    /// Client listener bind address.
    #[must_use]
    pub fn client_bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    /// Replication listener bind address.
    #[must_use]
    pub fn replication_bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.replication_port()))
    }

    /// Total worker threads: client workers, slave workers and the master-link worker.
    #[must_use]
    pub fn worker_thread_count(&self) -> usize {
        self.thread_num + self.slave_thread_num + 1
    }

    /// Hard ceiling of connected clients, local peers included.
    #[must_use]
    pub fn absolute_connection_limit(&self) -> usize {
        self.maxconnection.saturating_add(self.root_connection_num)
    }
}
