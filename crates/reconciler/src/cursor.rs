//! Two-phase resume cursor for the sync stream.
//!
//! `processed` advances as soon as a record is applied; `committed` only
//! advances once a stream session closes cleanly and is what the next
//! session resumes from. Both only ever move forward.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ResumeCursor {
    processed: AtomicU64,
    committed: AtomicU64,
}

impl ResumeCursor {
    /// Cursor resuming from `sequence`.
    #[must_use]
    pub const fn starting_at(sequence: u64) -> Self {
        Self {
            processed: AtomicU64::new(sequence),
            committed: AtomicU64::new(sequence),
        }
    }

    /// Highest sequence applied so far.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    /// Sequence the next sync session resumes from.
    #[must_use]
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    /// Record that `sequence` has been applied.
    pub fn observe(&self, sequence: u64) {
        self.processed.fetch_max(sequence, Ordering::AcqRel);
    }

    /// Commit `sequence` as the resume point. Returns the committed value,
    /// which is never lower than before.
    pub fn commit(&self, sequence: u64) -> u64 {
        self.processed.fetch_max(sequence, Ordering::AcqRel);
        let previous = self.committed.fetch_max(sequence, Ordering::AcqRel);
        previous.max(sequence)
    }
}
