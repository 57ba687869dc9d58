//! # Pipeline Workers
//!
//! Match-worker pool and the event-log recording thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, select};
use tracing::{debug, warn};

use crate::constants::SECTOR_BYTES;
use crate::metadata::EventSink;
use crate::sectors::Sector;

use super::events::JobEvent;
use super::registry::InspectionStats;
use super::{JobContext, JobError, lock};

/// One sector to check against the store.
pub struct MatchTask {
    pub sector: Sector,
    /// Device offset just past the sector.
    pub end_offset: u64,
    /// Stats of the close inspection that read the sector; `None` for skim reads.
    pub inspection: Option<Arc<InspectionStats>>,
}

impl MatchTask {
    pub fn skim(sector: Sector, end_offset: u64) -> Self {
        Self {
            sector,
            end_offset,
            inspection: None,
        }
    }

    pub fn inspection(sector: Sector, end_offset: u64, stats: Arc<InspectionStats>) -> Self {
        Self {
            sector,
            end_offset,
            inspection: Some(stats),
        }
    }

    pub fn actual_offset(&self) -> u64 {
        self.end_offset.saturating_sub(SECTOR_BYTES)
    }
}

/// Tasks sent but not yet fully checked.
#[derive(Debug, Default)]
pub(crate) struct PendingTasks {
    count: Mutex<u64>,
    idle: Condvar,
}

impl PendingTasks {
    pub(crate) fn add(&self) {
        *lock(&self.count) += 1;
    }

    pub(crate) fn complete(&self) {
        let mut count = lock(&self.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    pub(crate) fn count(&self) -> u64 {
        *lock(&self.count)
    }

    /// Block until nothing is queued or the job has finished.
    pub(crate) fn wait_idle(&self, finished: &AtomicBool) {
        let mut count = lock(&self.count);
        while *count > 0 && !finished.load(Ordering::Acquire) {
            count = self
                .idle
                .wait_timeout(count, Duration::from_millis(50))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Spawn the match-worker pool. Workers exit when the task channel
/// disconnects or the shutdown channel closes.
pub(crate) fn spawn_match_workers(
    workers: usize,
    ctx: Arc<JobContext>,
    rx: Receiver<MatchTask>,
    shutdown: Receiver<()>,
) -> Result<Vec<thread::JoinHandle<()>>, JobError> {
    let mut handles = Vec::new();
    let worker_count = workers.max(1);

    for id in 0..worker_count {
        let ctx = ctx.clone();
        let rx = rx.clone();
        let shutdown = shutdown.clone();

        let handle = thread::Builder::new()
            .name(format!("match-{id}"))
            .spawn(move || {
                loop {
                    select! {
                        recv(rx) -> msg => match msg {
                            Ok(task) => {
                                check_sector(&ctx, task);
                                ctx.pending.complete();
                            }
                            Err(_) => break,
                        },
                        recv(shutdown) -> _ => break,
                    }
                }
                debug!("match worker {id} exiting");
            })
            .map_err(|source| JobError::Spawn {
                what: "match worker",
                source,
            })?;
        handles.push(handle);
    }

    Ok(handles)
}

/// Check one sector against the store and act on the verdict: resolve it,
/// feed the originating inspection's streak, start a new inspection, or
/// finish the job.
pub(crate) fn check_sector(ctx: &Arc<JobContext>, task: MatchTask) {
    if ctx.is_finished() {
        return;
    }
    let offset = task.actual_offset();

    let verdict = {
        let mut store = lock(&ctx.store);
        store.try_match(&task.sector).map(|index| {
            let first = store.record_match(index, offset);
            (index, first, store.is_complete())
        })
    };

    let Some((index, first, complete)) = verdict else {
        if let Some(stats) = &task.inspection {
            stats.reset_streak();
        }
        return;
    };

    if first {
        ctx.sector_resolved(index, offset);
    }

    match &task.inspection {
        Some(stats) => stats.record_success(),
        None if !complete => {
            ctx.new_close_inspection(offset);
        }
        None => {}
    }

    if complete && ctx.try_begin_finish() {
        ctx.finish();
    }
}

/// Spawn the thread that writes job events to the event log.
pub fn spawn_event_log_thread(
    sink: Box<dyn EventSink>,
    rx: Receiver<JobEvent>,
    error_count: Arc<AtomicU64>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for event in rx {
            if let Err(err) = sink.record_event(&event) {
                error_count.fetch_add(1, Ordering::Relaxed);
                warn!("event log record error: {err}");
            }
        }
        if let Err(err) = sink.flush() {
            error_count.fetch_add(1, Ordering::Relaxed);
            warn!("event log flush error: {err}");
        }
    })
}
