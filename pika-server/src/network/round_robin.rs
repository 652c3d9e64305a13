use std::sync::atomic::{AtomicUsize, Ordering};

use pika_common::ids::WorkerIndex;

/// Lock-free round-robin picker over the worker range `[start, start + len)`.
#[derive(Debug)]
pub struct RoundRobin {
    counter: AtomicUsize,
    start: WorkerIndex,
    len: usize,
}

impl RoundRobin {
    /// Creates a picker over `len` workers starting at `start`.
    #[must_use]
    pub const fn new(start: WorkerIndex, len: usize) -> Self {
        Self {
            counter: AtomicUsize::new(0),
            start,
            len: if len == 0 { 1 } else { len },
        }
    }

    /// Returns the next worker index.
    pub fn next_index(&self) -> WorkerIndex {
        self.start + self.counter.fetch_add(1, Ordering::Relaxed) % self.len
    }
}

#[cfg(test)]
mod tests {
    use super::RoundRobin;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 4, 0)]
    #[case(0, 4, 5)]
    #[case(4, 2, 3)]
    fn nth_assignment_lands_on_n_mod_len(
        #[case] start: usize,
        #[case] len: usize,
        #[case] skip: usize,
    ) {
        let picker = RoundRobin::new(start, len);
        for _ in 0..skip {
            let _ = picker.next_index();
        }
        assert_that!(picker.next_index(), eq(start + skip % len));
    }

    #[rstest]
    fn assignments_spread_evenly() {
        let picker = RoundRobin::new(2, 3);
        let mut hits = [0_usize; 3];
        for _ in 0..300 {
            hits[picker.next_index() - 2] += 1;
        }
        assert_that!(hits, eq([100, 100, 100]));
    }
}
