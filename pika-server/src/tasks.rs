//! Background task supervisor.
//!
//! Flush-all, dump, log purge and keyspace scan each own one [`TaskSlot`]. Starting a task claims
//! the slot (a second start fails fast with `false`), runs the body on a named OS thread and
//! releases the slot from inside that thread when the body returns or panics.

mod dump;
mod flush;
mod keyspace;
mod purge;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use pika_common::error::{PikaError, PikaResult};
use tracing::{debug, warn};

#[cfg(test)]
pub(crate) use dump::DumpJob;

#[derive(Debug, Default)]
struct RunningFlag {
    running: Mutex<bool>,
    idle: Condvar,
}

impl RunningFlag {
    fn release(&self) {
        *self.running.lock() = false;
        self.idle.notify_all();
    }
}

/// One mutually exclusive background task kind.
#[derive(Debug)]
pub struct TaskSlot {
    kind: &'static str,
    flag: Arc<RunningFlag>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSlot {
    /// Creates an idle slot; `kind` names the spawned thread.
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            flag: Arc::new(RunningFlag::default()),
            handle: Mutex::new(None),
        }
    }

    /// Returns `true` while a claim or its thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.flag.running.lock()
    }

    /// Claims the slot, or returns `None` when a task of this kind is already running.
    #[must_use]
    pub fn try_claim(&self) -> Option<TaskClaim<'_>> {
        let mut running = self.flag.running.lock();
        if *running {
            return None;
        }
        *running = true;
        Some(TaskClaim {
            slot: self,
            spawned: false,
        })
    }

    /// Blocks until the slot is free again, then reaps the finished thread.
    ///
    /// Waits on the running flag rather than the thread handle, so a claim whose thread is not
    /// spawned yet is waited for too.
    pub fn join(&self) {
        {
            let mut running = self.flag.running.lock();
            while *running {
                self.flag.idle.wait(&mut running);
            }
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!(kind = self.kind, "background task panicked");
        }
    }
}

/// Exclusive right to start one task in a [`TaskSlot`].
///
/// Dropping an unspawned claim frees the slot again.
#[derive(Debug)]
pub struct TaskClaim<'a> {
    slot: &'a TaskSlot,
    spawned: bool,
}

impl TaskClaim<'_> {
    /// Runs `body` on a new named thread that releases the slot as its last act.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Io` when the thread cannot be spawned; the slot is released.
    pub fn spawn(mut self, body: impl FnOnce() + Send + 'static) -> PikaResult<()> {
        let release = ReleaseOnDrop(Arc::clone(&self.slot.flag));
        let kind = self.slot.kind;
        let handle = thread::Builder::new()
            .name(format!("pika-{kind}"))
            .spawn(move || {
                let _release = release;
                body();
                debug!(kind, "background task finished");
            })
            .map_err(|error| PikaError::io(&format!("spawn {kind} task"), &error))?;
        *self.slot.handle.lock() = Some(handle);
        self.spawned = true;
        Ok(())
    }
}

impl Drop for TaskClaim<'_> {
    fn drop(&mut self) {
        if !self.spawned {
            self.slot.flag.release();
        }
    }
}

struct ReleaseOnDrop(Arc<RunningFlag>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// The four task slots of one server.
#[derive(Debug)]
pub struct TaskSlots {
    /// Flush-all.
    pub flush: TaskSlot,
    /// Dump (snapshot).
    pub dump: TaskSlot,
    /// Binlog purge.
    pub purge: TaskSlot,
    /// Keyspace scan.
    pub scan: TaskSlot,
}

impl Default for TaskSlots {
    fn default() -> Self {
        Self {
            flush: TaskSlot::new("flushall"),
            dump: TaskSlot::new("dump"),
            purge: TaskSlot::new("purge"),
            scan: TaskSlot::new("keyscan"),
        }
    }
}
