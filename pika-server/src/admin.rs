//! Status and client management surface of the server context.
//!
//! Every method here takes worker table locks one at a time and never while the state mutex is
//! held, so they can run from any worker thread.

use std::fmt::Write as _;

use chrono::Local;
use pika_common::ids::ClientRole;

use crate::app::ServerContext;

const SCAN_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Section selector of the `INFO` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoSection {
    /// Every section except keyspace.
    All,
    Server,
    Clients,
    Stats,
    Replication,
    Keyspace,
    Log,
}

impl InfoSection {
    /// Parses a section name, case-insensitively.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let section = match name.to_ascii_lowercase().as_str() {
            "all" => Self::All,
            "server" => Self::Server,
            "clients" => Self::Clients,
            "stats" => Self::Stats,
            "replication" => Self::Replication,
            "keyspace" => Self::Keyspace,
            "log" => Self::Log,
            _ => return None,
        };
        Some(section)
    }

    fn includes(self, section: Self) -> bool {
        self == section || (self == Self::All && section != Self::Keyspace)
    }
}

impl ServerContext {
    /// Connections registered on every worker, slaves and the master link included.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.workers.iter().map(|worker| worker.client_count()).sum()
    }

    /// One `addr=<ip:port> fd=<fd>` line per connection, ordered by descriptor.
    #[must_use]
    pub fn client_list(&self) -> String {
        let mut clients = self
            .workers
            .iter()
            .flat_map(|worker| worker.clients())
            .collect::<Vec<_>>();
        clients.sort_by_key(|client| client.fd);

        let mut output = String::new();
        for client in clients {
            let _ = writeln!(output, "addr={} fd={}", client.addr, client.fd);
        }
        output
    }

    /// Number of synced slaves and one `slave<N>: host_port=<addr> state=online` line each.
    #[must_use]
    pub fn slave_list(&self) -> (usize, String) {
        let mut output = String::new();
        let mut count = 0;
        for worker in self.replication_workers() {
            for client in worker.clients() {
                if client.role != ClientRole::Slave {
                    continue;
                }
                let _ = write!(
                    output,
                    "slave{count}: host_port={} state=online\r\n",
                    client.addr
                );
                count += 1;
            }
        }
        (count, output)
    }

    /// Commands executed during the last second, summed over every worker.
    #[must_use]
    pub fn current_qps(&self) -> u64 {
        self.workers
            .iter()
            .map(|worker| worker.last_sec_querynum())
            .sum()
    }

    /// Commands executed since startup.
    #[must_use]
    pub fn accumulated_queries(&self) -> u64 {
        self.workers.iter().map(|worker| worker.querynum()).sum()
    }

    /// Marks the connection `addr` for closing. Returns `false` when no worker owns it.
    pub fn kill_client(&self, addr: &str) -> bool {
        self.workers.iter().any(|worker| worker.kill_client(addr))
    }

    /// Marks every normal client on the client workers for closing.
    ///
    /// Slaves and the master link are kept.
    pub fn kill_all_clients(&self) -> usize {
        self.workers[..self.thread_num()]
            .iter()
            .map(|worker| worker.kill_normal_clients())
            .sum()
    }

    /// `Yes, <label>, <elapsed secs>` while a dump runs, `No, <label>, 0` otherwise.
    #[must_use]
    pub fn is_bgsaving(&self) -> String {
        let state = self.state.lock();
        match state.dump.started_at {
            Some(started) => format!(
                "Yes, {}, {}",
                state.dump.label,
                started.elapsed().as_secs()
            ),
            None => format!("No, {}, 0", state.dump.label),
        }
    }

    /// `Yes, <start time>, <elapsed secs>` while a keyspace scan runs, `No` otherwise.
    #[must_use]
    pub fn is_scanning(&self) -> String {
        let running_since = self.state.lock().keyspace.running_since;
        match running_since {
            Some(since) => format!(
                "Yes, {}, {}",
                since.format(SCAN_TIME_FORMAT),
                (Local::now() - since).num_seconds()
            ),
            None => "No".to_owned(),
        }
    }

    /// Renders the `INFO` text for `section`.
    #[must_use]
    pub fn info(&self, section: InfoSection) -> String {
        let mut output = String::new();
        if section.includes(InfoSection::Server) {
            self.info_server(&mut output);
        }
        if section.includes(InfoSection::Clients) {
            let _ = write!(
                output,
                "# Clients\r\nconnected_clients:{}\r\n\r\n",
                self.client_count()
            );
        }
        if section.includes(InfoSection::Stats) {
            self.info_stats(&mut output);
        }
        if section.includes(InfoSection::Replication) {
            self.info_replication(&mut output);
        }
        if section.includes(InfoSection::Keyspace) {
            self.info_keyspace_counts(&mut output);
        }
        if section.includes(InfoSection::Log) {
            self.info_log(&mut output);
        }
        output
    }

    fn info_server(&self, output: &mut String) {
        let uptime = self.uptime_secs();
        let _ = write!(
            output,
            "# Server\r\n\
             pika_version:{}\r\n\
             os:{} {}\r\n\
             process_id:{}\r\n\
             tcp_port:{}\r\n\
             thread_num:{}\r\n\
             sync_thread_num:{}\r\n\
             uptime_in_seconds:{}\r\n\
             uptime_in_days:{}\r\n\r\n",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH,
            std::process::id(),
            self.port(),
            self.thread_num(),
            self.replication_workers().len(),
            uptime,
            uptime / 86_400 + 1,
        );
    }

    fn info_stats(&self, output: &mut String) {
        let _ = write!(
            output,
            "# Stats\r\n\
             total_connections_received:{}\r\n\
             instantaneous_ops_per_sec:{}\r\n\
             total_commands_processed:{}\r\n\
             is_bgsaving:{}\r\n\
             is_scaning_keyspace:{}\r\n\
             is_compact:No\r\n\r\n",
            self.history_clients(),
            self.current_qps(),
            self.accumulated_queries(),
            self.is_bgsaving(),
            self.is_scanning(),
        );
    }

    fn info_replication(&self, output: &mut String) {
        let (replication, readonly) = {
            let state = self.state.lock();
            (state.replication.clone(), state.readonly)
        };
        let _ = write!(output, "# Replication\r\nrole:{}\r\n", replication.role_label());
        if replication.follows_master || !replication.master_host.is_empty() {
            let link_status = if replication.follows_master { "up" } else { "down" };
            let _ = write!(
                output,
                "master_host:{}\r\nmaster_port:{}\r\nmaster_link_status:{}\r\nrepl_state:{}\r\n",
                replication.master_host,
                replication.master_port,
                link_status,
                replication.link.label(),
            );
        }
        let (slaves, slave_lines) = self.slave_list();
        let _ = write!(
            output,
            "readonly:{}\r\nconnected_slaves:{slaves}\r\n{slave_lines}\r\n",
            if readonly { "yes" } else { "no" }
        );
    }

    fn info_keyspace_counts(&self, output: &mut String) {
        let scan = self.state.lock().keyspace;
        let time = scan
            .started_at
            .map(|started| started.format(SCAN_TIME_FORMAT).to_string())
            .unwrap_or_default();
        let _ = write!(
            output,
            "# Keyspace\r\n\
             # Time:{time}\r\n\
             kv keys:{}\r\n\
             hash keys:{}\r\n\
             list keys:{}\r\n\
             zset keys:{}\r\n\
             set keys:{}\r\n\r\n",
            scan.counts.kv,
            scan.counts.hash,
            scan.counts.list,
            scan.counts.zset,
            scan.counts.set,
        );
    }

    fn info_log(&self, output: &mut String) {
        let position = self.binlog.producer_position();
        let segments = self.binlog.segment_count().unwrap_or_default();
        let (expire_days, expire_nums) = {
            let config = self.config.read();
            (config.expire_logs_days, config.expire_logs_nums)
        };
        let _ = write!(
            output,
            "# Log\r\n\
             binlog_offset:{} {}\r\n\
             binlog_segments:{segments}\r\n\
             expire_logs_days:{expire_days}\r\n\
             expire_logs_nums:{expire_nums}\r\n\r\n",
            position.filenum, position.offset,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::InfoSection;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("server", Some(InfoSection::Server))]
    #[case("REPLICATION", Some(InfoSection::Replication))]
    #[case("KeySpace", Some(InfoSection::Keyspace))]
    #[case("memory", None)]
    fn section_names_parse_case_insensitively(
        #[case] name: &str,
        #[case] expected: Option<InfoSection>,
    ) {
        assert_that!(InfoSection::parse(name), eq(expected));
    }

    #[rstest]
    fn all_skips_keyspace_counts() {
        assert_that!(InfoSection::All.includes(InfoSection::Stats), eq(true));
        assert_that!(InfoSection::All.includes(InfoSection::Keyspace), eq(false));
        assert_that!(InfoSection::Log.includes(InfoSection::Server), eq(false));
    }
}
