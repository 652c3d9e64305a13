use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use pika_common::error::{PikaError, PikaResult};
use pika_common::ids::LogPosition;
use pika_storage::BackupEngine;
use tracing::{error, info, warn};

use crate::app::{DumpState, ServerContext};
use crate::tasks::TaskClaim;

const LABEL_FORMAT: &str = "%Y%m%d%H%M%S";
const TMP_DIR: &str = "tmp";
const MANIFEST_FILE: &str = "info";
const FAILED_SUFFIX: &str = "_FAILED";

/// One dump run: backup, restore into the dated target, manifest.
#[derive(Debug)]
pub struct DumpJob {
    engine: Arc<BackupEngine>,
    target: PathBuf,
    tmp: PathBuf,
    started: Instant,
    server_ip: String,
    port: u16,
    cursor: LogPosition,
}

impl DumpJob {
    pub fn new(
        engine: Arc<BackupEngine>,
        target: PathBuf,
        server_ip: String,
        port: u16,
        cursor: LogPosition,
    ) -> Self {
        let tmp = engine.root().to_path_buf();
        Self {
            engine,
            target,
            tmp,
            started: Instant::now(),
            server_ip,
            port,
            cursor,
        }
    }

    /// Runs the dump. The manifest is written even when the backup failed; a failed target is
    /// then moved aside to `<target>_FAILED`.
    pub fn run(&self) -> PikaResult<()> {
        let result = self.backup_into_target();
        if let Err(error) = fs::remove_dir_all(&self.tmp) {
            warn!(%error, tmp = %self.tmp.display(), "remove dump tmp dir failed");
        }
        let result = result.and(self.write_manifest());
        if let Err(error) = &result {
            error!(%error, target = %self.target.display(), "dump failed");
            self.mark_failed();
        }
        result
    }

    fn backup_into_target(&self) -> PikaResult<()> {
        let id = self.engine.create_new_backup()?;
        self.engine.restore_from_backup(id, &self.target)
    }

    fn manifest(&self) -> String {
        format!(
            "{}s\r\n{}\r\n{}\r\n{}\r\n{}\r\n",
            self.started.elapsed().as_secs(),
            self.server_ip,
            self.port,
            self.cursor.filenum,
            self.cursor.offset
        )
    }

    fn write_manifest(&self) -> PikaResult<()> {
        let path = self.target.join(MANIFEST_FILE);
        fs::write(&path, self.manifest())
            .map_err(|error| PikaError::io(&format!("write manifest {}", path.display()), &error))
    }

    fn mark_failed(&self) {
        let mut failed = self.target.clone().into_os_string();
        failed.push(FAILED_SUFFIX);
        let failed = PathBuf::from(failed);
        if failed.exists()
            && let Err(error) = fs::remove_dir_all(&failed)
        {
            warn!(%error, path = %failed.display(), "remove old failed dump");
        }
        if let Err(error) = fs::rename(&self.target, &failed) {
            warn!(%error, path = %failed.display(), "rename failed dump");
        }
    }
}

impl ServerContext {
    /// Starts a background dump of the live store into `dump_path`.
    ///
    /// Returns `false` when a dump is already running or the target cannot be prepared.
    pub fn dump(self: &Arc<Self>) -> bool {
        let Some(claim) = self.tasks.dump.try_claim() else {
            return false;
        };
        let (dump_path, prefix) = {
            let config = self.config.read();
            (config.dump_path.clone(), config.dump_prefix.clone())
        };
        let label = Local::now().format(LABEL_FORMAT).to_string();
        let day = label.get(..8).unwrap_or(&label);
        let target = dump_path.join(format!("{prefix}{day}"));

        let engine = match prepare_dump_dirs(&target, &dump_path.join(TMP_DIR)) {
            Ok(engine) => Arc::new(engine),
            Err(error) => {
                warn!(%error, target = %target.display(), "dump not started");
                return false;
            }
        };
        let cursor = {
            let storage = self.storage.write();
            engine.set_backup_content(&storage);
            self.binlog.producer_position()
        };
        let job = DumpJob::new(engine, target, self.server_ip().to_owned(), self.port(), cursor);
        self.start_dump(claim, label, job)
    }

    /// Publishes `job` as the running dump and starts its thread.
    pub(crate) fn start_dump(
        self: &Arc<Self>,
        claim: TaskClaim<'_>,
        label: String,
        job: DumpJob,
    ) -> bool {
        let cursor = job.cursor;
        self.state.lock().dump = DumpState {
            label: label.clone(),
            started_at: Some(Instant::now()),
            cursor,
            engine: Some(Arc::clone(&job.engine)),
        };
        info!(%label, %cursor, target = %job.target.display(), "dump started");

        let ctx = Arc::clone(self);
        let spawned = claim.spawn(move || {
            if job.run().is_ok() {
                info!(target = %job.target.display(), "dump finished");
            }
            let mut state = ctx.state.lock();
            state.dump.started_at = None;
            state.dump.engine = None;
        });
        if let Err(error) = spawned {
            error!(%error, "dump thread not started");
            let mut state = self.state.lock();
            state.dump.started_at = None;
            state.dump.engine = None;
            return false;
        }
        true
    }

    /// Stops the running dump and blocks until its thread has finished.
    ///
    /// Returns `false` when no dump is running.
    pub fn dump_off(&self) -> bool {
        let engine = self.state.lock().dump.engine.clone();
        let Some(engine) = engine else {
            return false;
        };
        if !self.tasks.dump.is_running() {
            return false;
        }
        engine.stop_backup();
        self.tasks.dump.join();
        warn!("dump stopped on request");
        true
    }
}

fn prepare_dump_dirs(target: &Path, tmp: &Path) -> PikaResult<BackupEngine> {
    if target.exists() {
        fs::remove_dir_all(target).map_err(|error| {
            PikaError::io(&format!("remove old dump {}", target.display()), &error)
        })?;
    }
    fs::create_dir_all(target).map_err(|error| {
        PikaError::io(&format!("create dump dir {}", target.display()), &error)
    })?;
    if tmp.exists() {
        fs::remove_dir_all(tmp).map_err(|error| {
            PikaError::io(&format!("clear dump tmp {}", tmp.display()), &error)
        })?;
    }
    BackupEngine::open(tmp)
}

#[cfg(test)]
mod tests {
    use super::{DumpJob, MANIFEST_FILE};
    use googletest::prelude::*;
    use pika_common::ids::LogPosition;
    use pika_storage::{BackupEngine, Store, StoreOptions};
    use rstest::rstest;
    use std::fs;
    use std::sync::Arc;

    #[rstest]
    fn successful_dump_restores_store_and_writes_manifest() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let store = Store::open(dir.path().join("db"), StoreOptions::default())
            .expect("store should open");
        store.write(|keyspace| keyspace.set(b"k".to_vec(), b"v".to_vec()));

        let engine = Arc::new(
            BackupEngine::open(dir.path().join("tmp")).expect("backup engine should open"),
        );
        engine.set_backup_content(&store);
        let target = dir.path().join("dump-20260101");
        fs::create_dir_all(&target).expect("target should be created");

        let job = DumpJob::new(
            engine,
            target.clone(),
            "10.0.0.7".to_owned(),
            9221,
            LogPosition::new(3, 128),
        );
        job.run().expect("dump should succeed");

        let manifest =
            fs::read_to_string(target.join(MANIFEST_FILE)).expect("manifest should exist");
        let lines = manifest.split("\r\n").collect::<Vec<_>>();
        assert_that!(lines.len(), eq(6_usize));
        assert_that!(lines[0].ends_with('s'), eq(true));
        assert_that!(
            &lines[1..].to_vec(),
            eq(&vec!["10.0.0.7", "9221", "3", "128", ""])
        );
        assert_that!(dir.path().join("tmp").exists(), eq(false));

        let restored = Store::open(
            &target,
            StoreOptions {
                create_if_missing: false,
            },
        )
        .expect("dump should be loadable");
        assert_that!(
            &restored.read(|keyspace| keyspace.get(b"k").cloned()),
            eq(&Some(b"v".to_vec()))
        );
    }

    #[rstest]
    fn failed_dump_replaces_previous_failed_directory() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let engine = Arc::new(
            BackupEngine::open(dir.path().join("tmp")).expect("backup engine should open"),
        );
        let target = dir.path().join("20260101");
        let failed = dir.path().join("20260101_FAILED");
        fs::create_dir_all(&target).expect("target should be created");
        fs::create_dir_all(&failed).expect("old failed dir should be created");
        fs::write(failed.join("stale"), b"old").expect("stale file should be written");

        let job = DumpJob::new(
            engine,
            target.clone(),
            "127.0.0.1".to_owned(),
            9221,
            LogPosition::new(0, 0),
        );
        assert_that!(job.run().is_err(), eq(true));

        assert_that!(target.exists(), eq(false));
        assert_that!(failed.join("stale").exists(), eq(false));
        let manifest =
            fs::read_to_string(failed.join(MANIFEST_FILE)).expect("manifest should survive");
        assert_that!(manifest.ends_with("\r\n0\r\n0\r\n"), eq(true));
    }
}
