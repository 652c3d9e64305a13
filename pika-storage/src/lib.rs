//! Storage engine: five in-memory data families, directory checkpoints and backups.

pub mod backup;
pub mod engine;
pub mod keyspace;
pub mod snapshot;

pub use backup::{BackupEngine, BackupId};
pub use engine::{Store, StoreOptions};
pub use keyspace::{KeyCounts, Keyspace};
