//! # Close Inspection
//!
//! Dense scan of the neighbourhood of a skim hit. Each hit starts a pair of
//! readers: one scanning forward from the hit, one scanning up to it from
//! below. Every sector they read goes to the match workers, except
//! meaningless sectors, which are only sent while the reader is on a streak
//! of consecutive matches.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::constants::SECTOR_BYTES;
use crate::device::SectorReader;
use crate::perf::PerformanceEstimator;
use crate::pipeline::JobContext;
use crate::pipeline::events::JobEvent;
use crate::pipeline::registry::ActiveInspection;
use crate::pipeline::workers::MatchTask;
use crate::sectors::is_meaningless;

use super::Direction;

/// Why a reader's scan loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    LimitReached,
    EndOfDevice,
    Unproductive,
    JobFinished,
}

pub(crate) struct CloseInspectionReader {
    ctx: Arc<JobContext>,
    inspection: ActiveInspection,
    reader: SectorReader,
    perf: PerformanceEstimator,
}

impl CloseInspectionReader {
    pub(crate) fn new(ctx: Arc<JobContext>, inspection: ActiveInspection) -> Self {
        let reader = SectorReader::new(Arc::clone(&ctx.device));
        let perf = PerformanceEstimator::new(
            inspection.descriptor.sector_limit,
            ctx.settings.inspection_sample_size,
        );
        Self {
            ctx,
            inspection,
            reader,
            perf,
        }
    }

    pub(crate) fn run(mut self) {
        let descriptor = self.inspection.descriptor;
        debug!(
            "inspection {} scanning {} sectors from {:#x}",
            descriptor.label(),
            descriptor.sector_limit,
            descriptor.actual_start_offset
        );
        self.reader.seek(descriptor.actual_start_offset);
        self.perf.start();

        let exit = self.scan();
        let chain_origin = match exit {
            Exit::LimitReached => self.chain_origin(),
            _ => None,
        };
        debug!("inspection {} stopped: {exit:?}", descriptor.label());

        let stats = Arc::clone(&self.inspection.stats);
        self.ctx
            .retire_inspection(&self.inspection, exit == Exit::EndOfDevice, chain_origin);
        stats.mark_finished();
    }

    fn scan(&mut self) -> Exit {
        let stats = Arc::clone(&self.inspection.stats);
        let recheck_streak = self.ctx.settings.meaningless_recheck_streak;
        let early_abort = self.ctx.settings.early_abort;
        let throttle = Duration::from_millis(self.ctx.settings.inspection_throttle_ms);
        let label = self.inspection.descriptor.label();

        for _ in 0..self.inspection.descriptor.sector_limit {
            if self.ctx.is_finished() {
                return Exit::JobFinished;
            }
            let Some(sector) = self.reader.read_sector() else {
                return Exit::EndOfDevice;
            };
            if !is_meaningless(&sector) || stats.streak() >= recheck_streak {
                let task =
                    MatchTask::inspection(sector, self.reader.position(), Arc::clone(&stats));
                if !self.ctx.dispatch(task) {
                    return Exit::JobFinished;
                }
            }
            stats.record_scanned();

            if let Some(sample) = self.perf.increment() {
                self.ctx.publish(&JobEvent::PerformanceRecalculated {
                    reader: label.clone(),
                    average_seconds: sample.average_seconds,
                    remaining_seconds: sample.remaining_seconds,
                    progress: sample.progress,
                });
            }
            if let Some(abort) = early_abort {
                if abort.should_abort(stats.sectors_scanned(), stats.successes()) {
                    return Exit::Unproductive;
                }
            }
            if !throttle.is_zero() {
                std::thread::sleep(throttle);
            }
        }
        Exit::LimitReached
    }

    /// Origin for a follow-up pair when chaining is on and this reader was
    /// still matching at the edge of its range.
    fn chain_origin(&self) -> Option<u64> {
        let settings = &self.ctx.settings;
        if !settings.chain_inspections {
            return None;
        }
        let stats = &self.inspection.stats;
        if stats.streak() == 0 && stats.hit_rate() <= settings.chain_min_hit_rate {
            return None;
        }
        let descriptor = self.inspection.descriptor;
        let reach = descriptor.span.saturating_mul(SECTOR_BYTES);
        match descriptor.direction {
            Direction::Forward => Some(self.reader.position().saturating_add(reach)),
            Direction::Backward => descriptor.actual_start_offset.checked_sub(reach),
        }
    }
}
