//! Resume point bookkeeping.
//!
//! Every scanned marker is tracked with the number of its jobs that have not
//! reached a terminal state. The resume point only moves past a marker once
//! that marker and every marker before it are fully terminal, so a restart
//! redelivers anything unfinished.

use std::collections::BTreeMap;

use nwnbridge_domain::SequenceMarker;

#[derive(Debug)]
pub struct ResumeTracker {
    resume: SequenceMarker,
    persisted: SequenceMarker,
    /// marker -> jobs still outstanding for it
    outstanding: BTreeMap<SequenceMarker, usize>,
}

impl ResumeTracker {
    /// Start from a marker that is already durable.
    pub fn new(persisted: SequenceMarker) -> Self {
        Self {
            resume: persisted,
            persisted,
            outstanding: BTreeMap::new(),
        }
    }

    /// A scanned change produced `jobs` jobs (possibly none).
    pub fn record_scanned(&mut self, marker: SequenceMarker, jobs: usize) {
        if marker <= self.resume {
            return;
        }
        *self.outstanding.entry(marker).or_insert(0) += jobs;
        self.advance();
    }

    /// One job for `marker` reached a terminal state.
    pub fn job_finished(&mut self, marker: SequenceMarker) {
        if let Some(count) = self.outstanding.get_mut(&marker) {
            *count = count.saturating_sub(1);
        }
        self.advance();
    }

    /// Latest marker whose changes, and all before it, are terminal.
    pub fn resume_marker(&self) -> SequenceMarker {
        self.resume
    }

    /// Resume point when it has moved past the last durable one.
    pub fn unpersisted(&self) -> Option<SequenceMarker> {
        (self.resume > self.persisted).then_some(self.resume)
    }

    pub fn mark_persisted(&mut self, marker: SequenceMarker) {
        if marker > self.persisted {
            self.persisted = marker;
        }
    }

    /// Scanned markers that still hold the resume point back.
    pub fn outstanding_markers(&self) -> usize {
        self.outstanding.len()
    }

    fn advance(&mut self) {
        while let Some(entry) = self.outstanding.first_entry() {
            if *entry.get() > 0 {
                break;
            }
            let (marker, _) = entry.remove_entry();
            self.resume = marker;
        }
    }
}
