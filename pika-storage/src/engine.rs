//! Directory-backed store handle.
//!
//! A store owns one directory. Its contents live in memory behind a copy-on-write `Arc`, and
//! `checkpoint` persists them to `<dir>/data` through the snapshot codec.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use pika_common::error::{PikaError, PikaResult};
use tracing::debug;

use crate::keyspace::{KeyCounts, Keyspace};
use crate::snapshot::{decode_keyspace, encode_keyspace};

/// File name of the checkpoint inside a store or backup directory.
pub const DATA_FILE: &str = "data";

/// Options applied when opening a store directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Create the directory when it does not exist.
    pub create_if_missing: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
        }
    }
}

/// One open store.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    keyspace: RwLock<Arc<Keyspace>>,
}

impl Store {
    /// Opens the store at `path`, loading `<path>/data` when present.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Io` when the directory cannot be created or read and
    /// `PikaError::Storage` when the checkpoint is corrupt or the directory is missing while
    /// `create_if_missing` is off.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> PikaResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_dir() {
            if !options.create_if_missing {
                return Err(PikaError::Storage(format!(
                    "store directory {} does not exist",
                    path.display()
                )));
            }
            fs::create_dir_all(&path).map_err(|error| {
                PikaError::io(&format!("create store dir {}", path.display()), &error)
            })?;
        }

        let data_path = path.join(DATA_FILE);
        let keyspace = if data_path.is_file() {
            let payload = fs::read(&data_path).map_err(|error| {
                PikaError::io(&format!("read checkpoint {}", data_path.display()), &error)
            })?;
            decode_keyspace(&payload)?
        } else {
            Keyspace::default()
        };
        debug!(path = %path.display(), counts = ?keyspace.key_counts(), "store opened");

        Ok(Self {
            path,
            keyspace: RwLock::new(Arc::new(keyspace)),
        })
    }

    /// Directory this store was opened at.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a consistent point-in-time view. Later writes do not affect it.
    #[must_use]
    pub fn pin_view(&self) -> Arc<Keyspace> {
        Arc::clone(&self.keyspace.read())
    }

    /// Runs a read-only closure against the current contents.
    pub fn read<R>(&self, f: impl FnOnce(&Keyspace) -> R) -> R {
        f(&self.keyspace.read())
    }

    /// Runs a mutating closure, cloning the contents first when a pinned view shares them.
    pub fn write<R>(&self, f: impl FnOnce(&mut Keyspace) -> R) -> R {
        let mut guard = self.keyspace.write();
        f(Arc::make_mut(&mut guard))
    }

    /// Counts keys in each family.
    #[must_use]
    pub fn key_counts(&self) -> KeyCounts {
        self.read(Keyspace::key_counts)
    }

    /// Persists the current contents to `<path>/data`.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Io` when the checkpoint cannot be written.
    pub fn checkpoint(&self) -> PikaResult<()> {
        let payload = encode_keyspace(&self.pin_view())?;
        write_file_atomically(&self.path.join(DATA_FILE), &payload)
    }
}

/// Writes `payload` next to `target` and renames it into place.
fn write_file_atomically(target: &Path, payload: &[u8]) -> PikaResult<()> {
    let staging = target.with_extension("partial");
    fs::write(&staging, payload).map_err(|error| {
        PikaError::io(&format!("write {}", staging.display()), &error)
    })?;
    fs::rename(&staging, target)
        .map_err(|error| PikaError::io(&format!("rename {}", staging.display()), &error))
}

#[cfg(test)]
mod tests {
    use super::{DATA_FILE, Store, StoreOptions};
    use crate::keyspace::KeyCounts;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn open_creates_missing_directory() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("db");

        let store = Store::open(&path, StoreOptions::default()).expect("open should succeed");
        assert_that!(path.is_dir(), eq(true));
        assert_that!(store.key_counts(), eq(KeyCounts::default()));
    }

    #[rstest]
    fn open_without_create_rejects_missing_directory() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let options = StoreOptions {
            create_if_missing: false,
        };
        assert_that!(Store::open(dir.path().join("absent"), options).is_err(), eq(true));
    }

    #[rstest]
    fn pinned_view_is_unaffected_by_later_writes() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let store = Store::open(dir.path(), StoreOptions::default()).expect("open should succeed");
        store.write(|keyspace| keyspace.set(b"a".to_vec(), b"1".to_vec()));

        let view = store.pin_view();
        store.write(|keyspace| keyspace.set(b"b".to_vec(), b"2".to_vec()));

        assert_that!(view.key_counts().kv, eq(1));
        assert_that!(store.key_counts().kv, eq(2));
    }

    #[rstest]
    fn checkpoint_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        {
            let store =
                Store::open(dir.path(), StoreOptions::default()).expect("open should succeed");
            store.write(|keyspace| {
                keyspace.set(b"k".to_vec(), b"v".to_vec());
                let _ = keyspace.lpush(b"l".to_vec(), vec![b"x".to_vec()]);
            });
            store.checkpoint().expect("checkpoint should succeed");
        }
        assert_that!(dir.path().join(DATA_FILE).is_file(), eq(true));

        let reopened =
            Store::open(dir.path(), StoreOptions::default()).expect("reopen should succeed");
        let value = reopened.read(|keyspace| keyspace.get(b"k").cloned());
        assert_that!(&value, eq(&Some(b"v".to_vec())));
        assert_that!(reopened.key_counts().list, eq(1));
    }
}
