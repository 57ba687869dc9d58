//! # Skim Scanner
//!
//! Sparse sweep of the device: read one sector, skip half a file's worth of
//! sectors, repeat. Any file fragment at least that long has a sector on the
//! sweep lattice, so a hit anywhere in it is enough to start a close
//! inspection.
//!
//! The scanner is a small state machine. It pauses whenever close
//! inspections are registered and resumes when the last one leaves. When it
//! reaches the end of the device it may wrap to offset zero and sweep up to
//! where it started.

use std::sync::Arc;

use crossbeam_channel::{Receiver, select};
use tracing::{debug, info};

use crate::constants::SECTOR_BYTES;
use crate::device::SectorReader;
use crate::perf::{self, PerformanceEstimator};
use crate::pipeline::events::JobEvent;
use crate::pipeline::workers::MatchTask;
use crate::pipeline::{FinishReason, JobContext, lock};
use crate::sectors::is_meaningless;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkimState {
    Idle,
    Scanning,
    Paused,
    Resuming,
    /// Second pass from offset zero up to the start offset.
    Draining,
    Completed,
    Aborted,
}

/// Bytes skipped after each skim read for a file of `total_sectors`.
pub fn skim_stride(total_sectors: u64) -> u64 {
    (total_sectors / 2) * SECTOR_BYTES
}

pub(crate) struct SkimScanner {
    ctx: Arc<JobContext>,
    reader: SectorReader,
    start_offset: u64,
    stride: u64,
    second_pass: bool,
    resume_at: u64,
    perf: PerformanceEstimator,
    resume_rx: Receiver<()>,
    shutdown_rx: Receiver<()>,
}

impl SkimScanner {
    pub(crate) fn new(
        ctx: Arc<JobContext>,
        start_offset: u64,
        stride: u64,
        initial_average: Option<f64>,
        resume_rx: Receiver<()>,
        shutdown_rx: Receiver<()>,
    ) -> Self {
        let reader = SectorReader::new(Arc::clone(&ctx.device));
        let mut perf = PerformanceEstimator::new(
            perf::skim_reads(reader.device_len(), stride),
            ctx.settings.skim_sample_size,
        );
        if let Some(avg) = initial_average {
            perf = perf.with_initial_average(avg);
        }
        Self {
            ctx,
            reader,
            start_offset,
            stride,
            second_pass: false,
            resume_at: start_offset,
            perf,
            resume_rx,
            shutdown_rx,
        }
    }

    pub(crate) fn run(mut self) -> SkimState {
        let mut state = SkimState::Idle;
        loop {
            state = match state {
                SkimState::Idle => self.begin(),
                SkimState::Scanning | SkimState::Draining => self.scan(),
                SkimState::Paused => self.wait_for_resume(),
                SkimState::Resuming => self.resume(),
                SkimState::Completed | SkimState::Aborted => {
                    debug!(
                        "skim stopped at {:#x} after {} reads",
                        self.reader.position(),
                        self.perf.sectors_read()
                    );
                    return state;
                }
            };
        }
    }

    fn begin(&mut self) -> SkimState {
        info!(
            "skim from {:#x} every {} bytes",
            self.start_offset,
            SECTOR_BYTES + self.stride
        );
        self.reader.seek(self.start_offset);
        self.perf.start();
        SkimState::Scanning
    }

    fn scan(&mut self) -> SkimState {
        loop {
            if self.ctx.is_finished() {
                return SkimState::Aborted;
            }
            // Read only while no inspection is registered; the lock is held across the read.
            let read = {
                let registry = lock(&self.ctx.registry);
                if registry.is_empty() {
                    Some(self.reader.read_sector())
                } else {
                    None
                }
            };
            let sector = match read {
                None => return self.pause(),
                Some(None) => return self.end_of_device(),
                Some(Some(sector)) => sector,
            };
            let end_offset = self.reader.position();
            if self.second_pass && end_offset > self.start_offset {
                return self.pass_exhausted();
            }

            if !is_meaningless(&sector) && !self.ctx.dispatch(MatchTask::skim(sector, end_offset)) {
                return SkimState::Aborted;
            }
            if let Some(sample) = self.perf.increment() {
                self.ctx.publish(&JobEvent::PerformanceRecalculated {
                    reader: "skim".to_string(),
                    average_seconds: sample.average_seconds,
                    remaining_seconds: sample.remaining_seconds,
                    progress: sample.progress,
                });
            }
            self.reader.skip(self.stride);
        }
    }

    fn pause(&mut self) -> SkimState {
        self.resume_at = self.reader.position();
        self.ctx.publish(&JobEvent::SkimPaused {
            resume_at: self.resume_at,
        });
        SkimState::Paused
    }

    fn wait_for_resume(&mut self) -> SkimState {
        select! {
            recv(self.resume_rx) -> msg => match msg {
                Ok(()) => SkimState::Resuming,
                Err(_) => SkimState::Aborted,
            },
            recv(self.shutdown_rx) -> _ => SkimState::Aborted,
        }
    }

    fn resume(&mut self) -> SkimState {
        self.ctx.clear_resuming();
        if self.ctx.is_finished() {
            return SkimState::Aborted;
        }
        // A stale resume; the reader still registered will send another.
        if !lock(&self.ctx.registry).is_empty() {
            return SkimState::Paused;
        }
        self.reader.seek(self.resume_at);
        self.perf.start();
        self.ctx.publish(&JobEvent::SkimResumed {
            offset: self.resume_at,
        });
        if self.second_pass {
            SkimState::Draining
        } else {
            SkimState::Scanning
        }
    }

    /// Let queued match checks land before deciding anything at a pass
    /// boundary; they may complete the job or start an inspection.
    fn settle(&mut self) -> Option<SkimState> {
        self.ctx.wait_for_idle_workers();
        if self.ctx.is_finished() {
            return Some(SkimState::Aborted);
        }
        if !lock(&self.ctx.registry).is_empty() {
            return Some(self.pause());
        }
        None
    }

    fn end_of_device(&mut self) -> SkimState {
        if let Some(state) = self.settle() {
            return state;
        }
        if self.second_pass || self.start_offset == 0 || !self.ctx.settings.wrap_around {
            return self.exhausted();
        }
        self.second_pass = true;
        self.reader.seek(0);
        self.ctx.publish(&JobEvent::SecondPassStarted {
            until: self.start_offset,
        });
        SkimState::Draining
    }

    fn pass_exhausted(&mut self) -> SkimState {
        if let Some(state) = self.settle() {
            return state;
        }
        self.exhausted()
    }

    fn exhausted(&mut self) -> SkimState {
        info!(
            "skim covered the device; {}/{} sectors resolved",
            self.ctx.resolved(),
            self.ctx.total_sectors
        );
        if self.ctx.fail(FinishReason::DeviceExhausted) {
            SkimState::Completed
        } else {
            SkimState::Aborted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_is_half_the_file() {
        assert_eq!(skim_stride(16), 8 * 512);
        assert_eq!(skim_stride(17), 8 * 512);
        assert_eq!(skim_stride(1), 0);
    }
}
