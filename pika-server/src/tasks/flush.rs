use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pika_common::error::{PikaError, PikaResult};
use pika_facade::protocol::encode_multibulk;
use pika_storage::{Store, StoreOptions};
use tracing::{error, info, warn};

use crate::app::ServerContext;

const DELETING_DIR: &str = "deleting";

impl ServerContext {
    /// Replaces the store with an empty one and deletes the old directory in the background.
    ///
    /// The `FLUSHALL` record is appended to the binlog before the storage write lock is released,
    /// so no write against the new store can precede it in the log.
    ///
    /// Returns `false` when a flush is already running or the swap failed.
    pub fn flush_all(&self) -> bool {
        let Some(claim) = self.tasks.flush.try_claim() else {
            return false;
        };
        let db_path = self.config.read().db_path.clone();
        let deleting = deleting_path(&db_path);

        {
            let mut storage = self.storage.write();
            let reopened = swap_in_empty_store(&db_path, &deleting, |path| {
                Store::open(path, StoreOptions::default())
            });
            match reopened {
                Ok(store) => *storage = Arc::new(store),
                Err(error) => {
                    error!(%error, db = %db_path.display(), "flushall failed");
                    return false;
                }
            }
            if let Err(error) = self.binlog.append(&encode_multibulk(&[b"FLUSHALL"])) {
                error!(%error, "binlog append of flushall failed");
            }
        }
        warn!(db = %db_path.display(), "flushall swapped in an empty store");

        let spawned = claim.spawn(move || {
            info!(path = %deleting.display(), "deleting flushed store");
            if let Err(error) = fs::remove_dir_all(&deleting) {
                error!(%error, path = %deleting.display(), "delete flushed store failed");
            }
        });
        if let Err(error) = spawned {
            error!(%error, "flushall cleanup not started");
        }
        true
    }

    /// Opens the store at `path` and makes it the live store.
    ///
    /// # Errors
    ///
    /// Returns the open failure; the live store is left untouched.
    pub fn load_db(&self, path: &Path) -> PikaResult<()> {
        let mut storage = self.storage.write();
        let store = Store::open(
            path,
            StoreOptions {
                create_if_missing: false,
            },
        )?;
        *storage = Arc::new(store);
        warn!(path = %path.display(), "store replaced");
        Ok(())
    }
}

fn deleting_path(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join(DELETING_DIR)
}

fn swap_in_empty_store(
    db_path: &Path,
    deleting: &Path,
    open: impl FnOnce(&Path) -> PikaResult<Store>,
) -> PikaResult<Store> {
    if deleting.exists() {
        fs::remove_dir_all(deleting).map_err(|error| {
            PikaError::io(&format!("remove stale {}", deleting.display()), &error)
        })?;
    }
    let moved = db_path.exists();
    if moved {
        fs::rename(db_path, deleting).map_err(|error| {
            PikaError::io(
                &format!("rename {} to {}", db_path.display(), deleting.display()),
                &error,
            )
        })?;
    }
    open(db_path).inspect_err(|_| {
        if moved && let Err(error) = restore_moved_store(db_path, deleting) {
            error!(%error, db = %db_path.display(), "live store left at deleting path");
        }
    })
}

fn restore_moved_store(db_path: &Path, deleting: &Path) -> PikaResult<()> {
    if db_path.exists() {
        fs::remove_dir_all(db_path).map_err(|error| {
            PikaError::io(&format!("remove partial {}", db_path.display()), &error)
        })?;
    }
    fs::rename(deleting, db_path).map_err(|error| {
        PikaError::io(
            &format!("rename {} back to {}", deleting.display(), db_path.display()),
            &error,
        )
    })
}
