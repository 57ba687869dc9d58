//! # Inspection Registry
//!
//! The set of close-inspection readers currently scanning. The skim scanner
//! pauses while this set is non-empty; match workers consult it before
//! spawning a new inspection so that no address is inspected twice.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

use crate::scanner::{Direction, InspectionDescriptor};

/// Counters shared between an inspection reader and the workers checking
/// the sectors it dispatched.
#[derive(Debug, Default)]
pub struct InspectionStats {
    sectors_scanned: AtomicU64,
    successes: AtomicU64,
    consecutive_successes: AtomicU64,
    finished: AtomicBool,
}

impl InspectionStats {
    pub fn record_scanned(&self) {
        self.sectors_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_streak(&self) {
        self.consecutive_successes.store(0, Ordering::Relaxed);
    }

    pub fn streak(&self) -> u64 {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn sectors_scanned(&self) -> u64 {
        self.sectors_scanned.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let scanned = self.sectors_scanned();
        if scanned == 0 {
            return 0.0;
        }
        self.successes() as f64 / scanned as f64
    }

    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectionSnapshot {
    pub descriptor: InspectionDescriptor,
    pub sectors_scanned: u64,
    pub successes: u64,
    pub consecutive_successes: u64,
    pub finished: bool,
}

#[derive(Debug, Clone)]
pub struct ActiveInspection {
    pub descriptor: InspectionDescriptor,
    pub stats: Arc<InspectionStats>,
}

impl ActiveInspection {
    pub fn snapshot(&self) -> InspectionSnapshot {
        InspectionSnapshot {
            descriptor: self.descriptor,
            sectors_scanned: self.stats.sectors_scanned(),
            successes: self.stats.successes(),
            consecutive_successes: self.stats.streak(),
            finished: self.stats.is_finished(),
        }
    }
}

/// A forward/backward pair registered together around one origin.
#[derive(Debug, Clone)]
pub struct InspectionPair {
    pub origin: u64,
    pub forward: ActiveInspection,
    pub backward: ActiveInspection,
}

#[derive(Debug, Default)]
pub struct InspectionRegistry {
    active: Vec<ActiveInspection>,
    next_id: u64,
    started: u64,
}

impl InspectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Pairs registered over the lifetime of the job.
    pub fn pairs_started(&self) -> u64 {
        self.started
    }

    /// True when `offset` lies inside the window of any active inspection.
    pub fn inspection_in_progress(&self, offset: u64) -> bool {
        self.active
            .iter()
            .any(|inspection| inspection.descriptor.covers(offset))
    }

    pub fn register_pair(&mut self, origin: u64, span: u64) -> InspectionPair {
        let forward = self.register(Direction::Forward, origin, span);
        let backward = self.register(Direction::Backward, origin, span);
        self.started += 1;
        InspectionPair {
            origin,
            forward,
            backward,
        }
    }

    fn register(&mut self, direction: Direction, origin: u64, span: u64) -> ActiveInspection {
        self.next_id += 1;
        let inspection = ActiveInspection {
            descriptor: InspectionDescriptor::new(self.next_id, direction, origin, span),
            stats: Arc::new(InspectionStats::default()),
        };
        self.active.push(inspection.clone());
        inspection
    }

    pub fn deregister(&mut self, id: u64) -> Option<ActiveInspection> {
        let pos = self
            .active
            .iter()
            .position(|inspection| inspection.descriptor.id == id)?;
        Some(self.active.remove(pos))
    }

    pub fn snapshots(&self) -> Vec<InspectionSnapshot> {
        self.active.iter().map(ActiveInspection::snapshot).collect()
    }
}
