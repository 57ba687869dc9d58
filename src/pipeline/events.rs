//! # Job Events
//!
//! Events published by the engine for external observers (progress displays,
//! the on-disk event log). The engine only publishes; it never waits on an
//! observer's reaction.

use std::sync::Arc;

use crossbeam_channel::Sender;
use serde::Serialize;
use tracing::{debug, info};

use crate::scanner::InspectionDescriptor;

use super::JobOutcome;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A file sector was matched for the first time.
    SectorResolved { index: usize, offset: u64 },
    /// A forward/backward close-inspection pair was registered.
    InspectionStarted {
        origin: u64,
        forward: InspectionDescriptor,
        backward: InspectionDescriptor,
    },
    /// A close-inspection reader deregistered.
    InspectionFinished {
        descriptor: InspectionDescriptor,
        sectors_scanned: u64,
        successes: u64,
        reached_end: bool,
    },
    SkimPaused { resume_at: u64 },
    SkimResumed { offset: u64 },
    /// The skim wrapped to offset zero and will stop at `until`.
    SecondPassStarted { until: u64 },
    PerformanceRecalculated {
        reader: String,
        average_seconds: f64,
        remaining_seconds: f64,
        progress: f64,
    },
    Finished { outcome: JobOutcome },
}

pub trait JobObserver: Send + Sync {
    fn on_event(&self, event: &JobEvent);
}

pub struct NullObserver;

impl JobObserver for NullObserver {
    fn on_event(&self, _event: &JobEvent) {}
}

/// Forwards every event into a channel.
pub struct ChannelObserver {
    tx: Sender<JobEvent>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<JobEvent>) -> Self {
        Self { tx }
    }
}

impl JobObserver for ChannelObserver {
    fn on_event(&self, event: &JobEvent) {
        if let Err(err) = self.tx.send(event.clone()) {
            debug!("event channel closed, dropping event: {err}");
        }
    }
}

/// Logs lifecycle events through `tracing`.
pub struct LogObserver;

impl JobObserver for LogObserver {
    fn on_event(&self, event: &JobEvent) {
        match event {
            JobEvent::SectorResolved { index, offset } => {
                debug!("sector {index} resolved at {offset:#x}");
            }
            JobEvent::InspectionStarted { origin, .. } => {
                info!("close inspection started around {origin:#x}");
            }
            JobEvent::InspectionFinished {
                descriptor,
                sectors_scanned,
                successes,
                reached_end,
            } => {
                debug!(
                    "inspection {} finished: scanned={} hits={} reached_end={}",
                    descriptor.label(),
                    sectors_scanned,
                    successes,
                    reached_end
                );
            }
            JobEvent::SkimPaused { resume_at } => debug!("skim paused at {resume_at:#x}"),
            JobEvent::SkimResumed { offset } => debug!("skim resumed at {offset:#x}"),
            JobEvent::SecondPassStarted { until } => {
                info!("end of device reached; second pass from 0 up to {until:#x}");
            }
            JobEvent::PerformanceRecalculated {
                reader,
                average_seconds,
                remaining_seconds,
                progress,
            } => {
                debug!(
                    "{reader}: window_avg={average_seconds:.3}s eta={remaining_seconds:.0}s progress={:.1}%",
                    progress * 100.0
                );
            }
            JobEvent::Finished { outcome } => {
                info!(
                    "job finished success={} auto_filled={} resolved={}/{}",
                    outcome.success, outcome.auto_filled, outcome.resolved, outcome.total_sectors
                );
            }
        }
    }
}

/// Delivers each event to several observers in order.
pub struct FanoutObserver {
    observers: Vec<Arc<dyn JobObserver>>,
}

impl FanoutObserver {
    pub fn new(observers: Vec<Arc<dyn JobObserver>>) -> Self {
        Self { observers }
    }
}

impl JobObserver for FanoutObserver {
    fn on_event(&self, event: &JobEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}
