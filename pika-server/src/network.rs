//! Readiness-driven networking: one accepting reactor plus a pool of worker threads.
//!
//! The reactor owns both listeners and hands accepted sockets to workers through their pending
//! queues. Every worker runs its own `mio::Poll` over the connections it owns and wakes up
//! through a `mio::Waker` when other threads queue sockets or replication bytes for it.

mod admission;
mod reactor;
mod round_robin;
mod worker;

pub use admission::AdmissionLimits;
pub use reactor::Reactor;
pub use round_robin::RoundRobin;
pub use worker::{PendingConnection, WorkerShared, spawn_worker};

#[derive(Debug, Clone, Copy)]
struct EventSnapshot {
    token: mio::Token,
    flags: u8,
}

const EVENT_FLAG_READABLE: u8 = 1_u8 << 0;
const EVENT_FLAG_WRITABLE: u8 = 1_u8 << 1;
const EVENT_FLAG_READ_CLOSED: u8 = 1_u8 << 2;
const EVENT_FLAG_WRITE_CLOSED: u8 = 1_u8 << 3;
const EVENT_FLAG_ERROR: u8 = 1_u8 << 4;

impl EventSnapshot {
    fn from_mio_event(event: &mio::event::Event) -> Self {
        let mut flags = 0_u8;
        if event.is_readable() {
            flags |= EVENT_FLAG_READABLE;
        }
        if event.is_writable() {
            flags |= EVENT_FLAG_WRITABLE;
        }
        if event.is_read_closed() {
            flags |= EVENT_FLAG_READ_CLOSED;
        }
        if event.is_write_closed() {
            flags |= EVENT_FLAG_WRITE_CLOSED;
        }
        if event.is_error() {
            flags |= EVENT_FLAG_ERROR;
        }
        Self {
            token: event.token(),
            flags,
        }
    }

    fn readable(self) -> bool {
        (self.flags & EVENT_FLAG_READABLE) != 0
    }

    fn writable(self) -> bool {
        (self.flags & EVENT_FLAG_WRITABLE) != 0
    }

    fn closed_or_error(self) -> bool {
        (self.flags & (EVENT_FLAG_READ_CLOSED | EVENT_FLAG_WRITE_CLOSED | EVENT_FLAG_ERROR)) != 0
    }

    fn is_error(self) -> bool {
        (self.flags & EVENT_FLAG_ERROR) != 0
    }
}
