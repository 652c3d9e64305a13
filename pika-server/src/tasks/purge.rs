use std::time::{Duration, SystemTime};

use pika_replication::segments::{max_deadline_index, remove_segments_up_to};
use tracing::{error, info, warn};

use crate::app::ServerContext;

const DAY: Duration = Duration::from_secs(24 * 3600);
/// Newest segments kept by the age-based purge.
const DAY_PURGE_KEEP: u32 = 10;

impl ServerContext {
    /// Deletes every binlog segment numbered `<= to` in the background.
    ///
    /// Returns `false` when a purge is running, `to` is negative or `to > max`.
    pub fn purge_logs(&self, max: u32, to: i64) -> bool {
        let Ok(to) = u32::try_from(to) else {
            return false;
        };
        if to > max {
            return false;
        }
        let Some(claim) = self.tasks.purge.try_claim() else {
            return false;
        };

        let dir = self.binlog.dir().to_path_buf();
        let spawned = claim.spawn(move || match remove_segments_up_to(&dir, to) {
            Ok(removed) => info!(to, removed = removed.len(), "binlog purge finished"),
            Err(error) => error!(to, %error, "binlog purge failed"),
        });
        match spawned {
            Ok(()) => true,
            Err(error) => {
                error!(%error, "binlog purge not started");
                false
            }
        }
    }

    /// Count- and age-based binlog retention, run once per tick.
    pub(crate) fn auto_purge(&self) {
        let (expire_nums, expire_days) = {
            let config = self.config.read();
            (config.expire_logs_nums, config.expire_logs_days)
        };
        let num = match self.binlog.segment_count() {
            Ok(num) => num,
            Err(error) => {
                warn!(%error, "count binlog segments failed");
                return;
            }
        };
        let max = self.binlog.current_filenum();

        if num > expire_nums as usize
            && max >= DAY_PURGE_KEEP
            && let Some(to) = max.checked_sub(expire_nums)
            && self.purge_logs(max, i64::from(to))
        {
            warn!(to, num, "auto purge by segment count");
        }

        let last = self.state.lock().last_purge_time;
        let window = DAY.saturating_mul(expire_days);
        let elapsed = SystemTime::now().duration_since(last).unwrap_or_default();
        if elapsed < window {
            return;
        }
        let index = match max_deadline_index(self.binlog.dir(), last + DAY) {
            Ok(index) => index,
            Err(error) => {
                warn!(%error, "scan binlog segment ages failed");
                return;
            }
        };
        let advance = match index {
            None => true,
            Some(index) => {
                max >= DAY_PURGE_KEEP
                    && self.purge_logs(max - DAY_PURGE_KEEP, i64::from(index))
            }
        };
        if advance {
            let mut state = self.state.lock();
            state.last_purge_time += DAY;
            warn!(?index, num, "auto purge by age");
        }
    }
}
