//! Backup engine used by the dump task.
//!
//! Backups live under `<root>/<id>/data`. Content is bound from a pinned store view, so a backup
//! reflects the store at `set_backup_content` time even while writes continue.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use pika_common::error::{PikaError, PikaResult};
use tracing::{debug, info};

use crate::engine::{DATA_FILE, Store};
use crate::keyspace::Keyspace;
use crate::snapshot::encode_keyspace;

const WRITE_CHUNK: usize = 64 * 1024;

/// Identifier of one backup under the engine root.
pub type BackupId = u32;

/// Creates and restores directory backups of one store.
#[derive(Debug)]
pub struct BackupEngine {
    root: PathBuf,
    content: Mutex<Option<Arc<Keyspace>>>,
    stop: AtomicBool,
}

impl BackupEngine {
    /// Opens (creating if needed) a backup root directory.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Io` when the root cannot be created.
    pub fn open(root: impl AsRef<Path>) -> PikaResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|error| {
            PikaError::io(&format!("create backup root {}", root.display()), &error)
        })?;
        Ok(Self {
            root,
            content: Mutex::new(None),
            stop: AtomicBool::new(false),
        })
    }

    /// Backup root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pins the current contents of `store` as the source of the next backup.
    pub fn set_backup_content(&self, store: &Store) {
        *self.content.lock() = Some(store.pin_view());
    }

    /// Writes the bound content as a new backup and returns its id.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::InvalidState` when no content is bound, `PikaError::Storage` when
    /// `stop_backup` was called and `PikaError::Io` on filesystem failures. A stopped backup
    /// leaves no directory behind.
    pub fn create_new_backup(&self) -> PikaResult<BackupId> {
        let content = self
            .content
            .lock()
            .clone()
            .ok_or(PikaError::InvalidState("backup content is not set"))?;
        self.check_stopped()?;

        let id = self.latest_backup_id()?.map_or(1, |latest| latest + 1);
        let backup_dir = self.root.join(id.to_string());
        fs::create_dir_all(&backup_dir).map_err(|error| {
            PikaError::io(&format!("create backup dir {}", backup_dir.display()), &error)
        })?;

        let payload = encode_keyspace(&content)?;
        if let Err(error) = self.write_chunked(&backup_dir.join(DATA_FILE), &payload) {
            let _ = fs::remove_dir_all(&backup_dir);
            return Err(error);
        }
        info!(id, bytes = payload.len(), root = %self.root.display(), "backup created");
        Ok(id)
    }

    /// Copies backup `id` into `target` as a loadable store directory.
    ///
    /// The data file is staged next to its final name and only renamed into place once fully
    /// written, so a stopped restore never leaves a loadable but truncated store.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Storage` when stopped, and `PikaError::Io` when the backup does not
    /// exist or on filesystem failures.
    pub fn restore_from_backup(&self, id: BackupId, target: &Path) -> PikaResult<()> {
        self.check_stopped()?;
        let source = self.root.join(id.to_string()).join(DATA_FILE);
        let payload = fs::read(&source).map_err(|error| {
            PikaError::io(&format!("read backup {}", source.display()), &error)
        })?;
        fs::create_dir_all(target).map_err(|error| {
            PikaError::io(&format!("create restore dir {}", target.display()), &error)
        })?;
        let data = target.join(DATA_FILE);
        let staging = data.with_extension("partial");
        if let Err(error) = self
            .write_chunked(&staging, &payload)
            .and_then(|()| self.check_stopped())
        {
            let _ = fs::remove_file(&staging);
            return Err(error);
        }
        fs::rename(&staging, &data)
            .map_err(|error| PikaError::io(&format!("rename {}", staging.display()), &error))?;
        debug!(id, target = %target.display(), "backup restored");
        Ok(())
    }

    /// Requests in-flight and future backup work to stop.
    pub fn stop_backup(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Returns `true` once `stop_backup` was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Highest backup id present under the root.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Io` when the root cannot be listed.
    pub fn latest_backup_id(&self) -> PikaResult<Option<BackupId>> {
        let entries = fs::read_dir(&self.root).map_err(|error| {
            PikaError::io(&format!("list backup root {}", self.root.display()), &error)
        })?;
        Ok(entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<BackupId>().ok())
            .max())
    }

    fn check_stopped(&self) -> PikaResult<()> {
        if self.is_stopped() {
            return Err(PikaError::Storage("backup stopped".to_owned()));
        }
        Ok(())
    }

    fn write_chunked(&self, path: &Path, payload: &[u8]) -> PikaResult<()> {
        let mut file = File::create(path)
            .map_err(|error| PikaError::io(&format!("create {}", path.display()), &error))?;
        for chunk in payload.chunks(WRITE_CHUNK) {
            self.check_stopped()?;
            file.write_all(chunk)
                .map_err(|error| PikaError::io(&format!("write {}", path.display()), &error))?;
        }
        file.sync_all()
            .map_err(|error| PikaError::io(&format!("sync {}", path.display()), &error))
    }
}

#[cfg(test)]
mod tests {
    use super::BackupEngine;
    use crate::engine::{Store, StoreOptions};
    use googletest::prelude::*;
    use rstest::rstest;

    fn seeded_store(path: &std::path::Path) -> Store {
        let store = Store::open(path, StoreOptions::default()).expect("open should succeed");
        store.write(|keyspace| {
            keyspace.set(b"k".to_vec(), b"v".to_vec());
            let _ = keyspace.sadd(b"s".to_vec(), vec![b"m".to_vec()]);
        });
        store
    }

    #[rstest]
    fn backup_then_restore_yields_loadable_store() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let store = seeded_store(&dir.path().join("db"));
        let engine = BackupEngine::open(dir.path().join("tmp")).expect("engine should open");

        engine.set_backup_content(&store);
        store.write(|keyspace| keyspace.set(b"late".to_vec(), b"x".to_vec()));
        let id = engine.create_new_backup().expect("backup should succeed");
        assert_that!(id, eq(1));
        let latest = engine.latest_backup_id().expect("listing should succeed");
        assert_that!(latest, eq(Some(1)));

        let target = dir.path().join("dump");
        engine.restore_from_backup(id, &target).expect("restore should succeed");
        let restored =
            Store::open(&target, StoreOptions::default()).expect("restored store should open");
        assert_that!(restored.key_counts().kv, eq(1));
        assert_that!(restored.key_counts().set, eq(1));
    }

    #[rstest]
    fn backup_without_content_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let engine = BackupEngine::open(dir.path()).expect("engine should open");
        assert_that!(engine.create_new_backup().is_err(), eq(true));
    }

    #[rstest]
    fn stopped_engine_refuses_to_back_up() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let store = seeded_store(&dir.path().join("db"));
        let engine = BackupEngine::open(dir.path().join("tmp")).expect("engine should open");
        engine.set_backup_content(&store);
        engine.stop_backup();

        assert_that!(engine.create_new_backup().is_err(), eq(true));
        let latest = engine.latest_backup_id().expect("listing should succeed");
        assert_that!(latest, eq(None));
    }

    #[rstest]
    fn stopped_restore_leaves_no_data_file() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let store = seeded_store(&dir.path().join("db"));
        let engine = BackupEngine::open(dir.path().join("tmp")).expect("engine should open");
        engine.set_backup_content(&store);
        let id = engine.create_new_backup().expect("backup should succeed");

        engine.stop_backup();
        let target = dir.path().join("dump");
        assert_that!(engine.is_stopped(), eq(true));
        assert_that!(engine.restore_from_backup(id, &target).is_err(), eq(true));
        assert_that!(target.join(super::DATA_FILE).exists(), eq(false));
    }
}
