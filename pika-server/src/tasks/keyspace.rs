use std::sync::Arc;

use chrono::Local;
use tracing::{debug, error};

use crate::app::{KeyspaceScan, ServerContext};

impl ServerContext {
    /// Starts a background count of keys per data family.
    ///
    /// Returns `false` when a scan is already running.
    pub fn info_keyspace(self: &Arc<Self>) -> bool {
        let Some(claim) = self.tasks.scan.try_claim() else {
            return false;
        };
        let started_at = Local::now();
        self.state.lock().keyspace.running_since = Some(started_at);

        let ctx = Arc::clone(self);
        let spawned = claim.spawn(move || {
            let counts = ctx.store().key_counts();
            debug!(?counts, "keyspace scan finished");
            ctx.state.lock().keyspace = KeyspaceScan {
                counts,
                started_at: Some(started_at),
                running_since: None,
            };
        });
        if let Err(error) = spawned {
            error!(%error, "keyspace scan not started");
            self.state.lock().keyspace.running_since = None;
            return false;
        }
        true
    }
}
