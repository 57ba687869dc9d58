//! # Pipeline Module
//!
//! Orchestrates one recovery job: the skim scanner, the close inspections it
//! triggers, the match-worker pool they all feed, and the final
//! reconstruction. Every component reaches shared state through one
//! [`JobContext`]; there is no global job.
//!
//! Locking discipline:
//! - the sector store mutex is held only for one match check and never
//!   across a device read;
//! - the registry mutex guards the active-inspection set, and the skim
//!   scanner holds it across its emptiness check and its sector read so it
//!   never reads while an inspection is registered;
//! - the two mutexes are never held at the same time;
//! - `finished` is the only cancellation signal, and the thread that flips
//!   it from false to true alone produces the job outcome.

pub mod events;
pub mod reconstruct;
pub mod registry;
pub mod workers;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ScanSettings;
use crate::constants::{CHANNEL_CAPACITY_MULTIPLIER, MIN_CHANNEL_CAPACITY};
use crate::device::{DeviceSource, SectorReader};
use crate::perf;
use crate::scanner::inspection::CloseInspectionReader;
use crate::scanner::skim::{self, SkimScanner, SkimState};
use crate::sectors::SectorStore;

use events::{JobEvent, JobObserver};
use registry::{ActiveInspection, InspectionPair, InspectionRegistry, InspectionSnapshot};
use workers::{MatchTask, PendingTasks};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("start offset {offset:#x} is beyond device length {device_len:#x}")]
    InvalidStartOffset { offset: u64, device_len: u64 },
    #[error("failed to spawn {what} thread: {source}")]
    Spawn {
        what: &'static str,
        source: std::io::Error,
    },
    #[error("reconstruction failed: {0}")]
    Reconstruct(#[from] std::io::Error),
    #[error("job stopped without reporting an outcome")]
    NoOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Every meaningful sector was found and the file was rebuilt.
    Complete,
    /// The skim covered the whole device without completing.
    DeviceExhausted,
    /// The caller gave up on the run.
    Abandoned,
    /// Every sector was located but the rebuilt file could not be written.
    ReconstructionFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub success: bool,
    pub reason: FinishReason,
    pub auto_filled: u64,
    pub resolved: u64,
    pub total_sectors: u64,
    pub output_path: Option<PathBuf>,
    pub output_sha256: Option<String>,
    /// The rebuilt file hashes the same as the source.
    pub verified: bool,
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub start_offset: u64,
    pub workers: usize,
    pub output_path: PathBuf,
    pub settings: ScanSettings,
}

impl JobOptions {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            start_offset: 0,
            workers: num_cpus::get(),
            output_path,
            settings: ScanSettings::default(),
        }
    }
}

/// Poisoned locks are recovered; every critical section leaves its data consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct JobContext {
    pub(crate) settings: ScanSettings,
    pub(crate) device: Arc<dyn DeviceSource>,
    pub(crate) store: Mutex<SectorStore>,
    pub(crate) registry: Mutex<InspectionRegistry>,
    pub(crate) total_sectors: u64,
    pub(crate) sector_limit: u64,
    pub(crate) output_path: PathBuf,
    observer: Arc<dyn JobObserver>,
    finished: AtomicBool,
    done_count: AtomicU64,
    resuming: AtomicBool,
    resume_tx: Sender<()>,
    tasks: Sender<MatchTask>,
    pending: PendingTasks,
    outcome_tx: Sender<Result<JobOutcome, JobError>>,
    inspection_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobContext {
    pub(crate) fn publish(&self, event: &JobEvent) {
        self.observer.on_event(event);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Flip `finished` from false to true. Only the caller that wins may
    /// produce the outcome.
    pub(crate) fn try_begin_finish(&self) -> bool {
        self.finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn resolved(&self) -> u64 {
        self.done_count.load(Ordering::Relaxed)
    }

    pub(crate) fn sector_resolved(&self, index: usize, offset: u64) {
        self.done_count.fetch_add(1, Ordering::Relaxed);
        self.publish(&JobEvent::SectorResolved { index, offset });
    }

    /// Queue a match check. Returns false once the worker pool has shut down.
    pub(crate) fn dispatch(&self, task: MatchTask) -> bool {
        self.pending.add();
        if self.tasks.send(task).is_err() {
            self.pending.complete();
            return false;
        }
        true
    }

    pub(crate) fn wait_for_idle_workers(&self) {
        self.pending.wait_idle(&self.finished);
    }

    /// Register and start a close-inspection pair around `offset` unless an
    /// active inspection already covers it.
    pub(crate) fn new_close_inspection(self: &Arc<Self>, offset: u64) -> bool {
        let pair = {
            let mut registry = lock(&self.registry);
            if self.is_finished() || registry.inspection_in_progress(offset) {
                return false;
            }
            let pair = registry.register_pair(offset, self.sector_limit);
            self.publish_started(&pair);
            pair
        };
        self.start_pair(pair);
        true
    }

    fn publish_started(&self, pair: &InspectionPair) {
        self.publish(&JobEvent::InspectionStarted {
            origin: pair.origin,
            forward: pair.forward.descriptor,
            backward: pair.backward.descriptor,
        });
    }

    fn start_pair(self: &Arc<Self>, pair: InspectionPair) {
        for inspection in [pair.forward, pair.backward] {
            let reader = CloseInspectionReader::new(Arc::clone(self), inspection.clone());
            let spawned = thread::Builder::new()
                .name(format!("inspect-{}", inspection.descriptor.label()))
                .spawn(move || reader.run());
            match spawned {
                Ok(handle) => lock(&self.inspection_handles).push(handle),
                Err(err) => {
                    warn!(
                        "failed to start inspection {}: {err}",
                        inspection.descriptor.label()
                    );
                    self.retire_inspection(&inspection, false, None);
                    inspection.stats.mark_finished();
                }
            }
        }
    }

    /// Deregister a reader whose scan loop has exited. A chained pair is
    /// registered before the reader leaves so the skim stays paused.
    pub(crate) fn retire_inspection(
        self: &Arc<Self>,
        inspection: &ActiveInspection,
        reached_end: bool,
        chain_origin: Option<u64>,
    ) {
        let chained = {
            let mut registry = lock(&self.registry);
            let chained = chain_origin
                .filter(|origin| !self.is_finished() && !registry.inspection_in_progress(*origin))
                .map(|origin| {
                    let pair = registry.register_pair(origin, self.sector_limit);
                    self.publish_started(&pair);
                    pair
                });
            registry.deregister(inspection.descriptor.id);
            self.publish(&JobEvent::InspectionFinished {
                descriptor: inspection.descriptor,
                sectors_scanned: inspection.stats.sectors_scanned(),
                successes: inspection.stats.successes(),
                reached_end,
            });
            chained
        };

        if let Some(pair) = chained {
            debug!("chaining inspection to {:#x}", pair.origin);
            self.start_pair(pair);
        } else if reached_end {
            self.notify_end_of_device(inspection);
        } else {
            self.request_resume();
        }
    }

    /// An inspection ran off the end of the device. The skim handles the end
    /// of the device itself once its own cursor gets there, so this only
    /// wakes it.
    fn notify_end_of_device(&self, inspection: &ActiveInspection) {
        debug!(
            "inspection {} reached end of device",
            inspection.descriptor.label()
        );
        self.request_resume();
    }

    /// Wake the paused skim if no inspection is active. Concurrent callers
    /// collapse into one resume; a call that finds inspections still
    /// registered is a no-op.
    pub(crate) fn request_resume(&self) {
        if self
            .resuming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let registry = lock(&self.registry);
        if registry.is_empty() && !self.is_finished() {
            // Unbounded; never blocks while the registry is held.
            let _ = self.resume_tx.send(());
        } else {
            self.resuming.store(false, Ordering::Release);
        }
    }

    pub(crate) fn clear_resuming(&self) {
        self.resuming.store(false, Ordering::Release);
    }

    /// Rebuild the file. Called once, by the thread that won `try_begin_finish`.
    /// A write failure still ends the run with a `Finished` event; `wait`
    /// returns the underlying error.
    pub(crate) fn finish(&self) {
        let result = reconstruct::reconstruct(self);
        match &result {
            Ok(outcome) => {
                info!(
                    "reconstructed {} auto_filled={} verified={}",
                    self.output_path.display(),
                    outcome.auto_filled,
                    outcome.verified
                );
                self.publish(&JobEvent::Finished {
                    outcome: outcome.clone(),
                });
            }
            Err(err) => {
                warn!("reconstruction failed: {err}");
                self.publish(&JobEvent::Finished {
                    outcome: self.failed_outcome(FinishReason::ReconstructionFailed),
                });
            }
        }
        let _ = self.outcome_tx.send(result);
    }

    fn failed_outcome(&self, reason: FinishReason) -> JobOutcome {
        JobOutcome {
            success: false,
            reason,
            auto_filled: 0,
            resolved: self.resolved(),
            total_sectors: self.total_sectors,
            output_path: None,
            output_sha256: None,
            verified: false,
        }
    }

    /// Report failure if the job has not finished yet. Returns false when
    /// another thread already finished it.
    pub(crate) fn fail(&self, reason: FinishReason) -> bool {
        if !self.try_begin_finish() {
            return false;
        }
        let outcome = self.failed_outcome(reason);
        info!(
            "job failed reason={:?} resolved={}/{}",
            reason, outcome.resolved, outcome.total_sectors
        );
        self.publish(&JobEvent::Finished {
            outcome: outcome.clone(),
        });
        let _ = self.outcome_tx.send(Ok(outcome));
        true
    }
}

/// One recovery run: a source file's sectors, a device, and where to put
/// the rebuilt file.
pub struct Job {
    store: SectorStore,
    device: Arc<dyn DeviceSource>,
    options: JobOptions,
    observer: Arc<dyn JobObserver>,
}

impl Job {
    pub fn new(
        store: SectorStore,
        device: Arc<dyn DeviceSource>,
        options: JobOptions,
        observer: Arc<dyn JobObserver>,
    ) -> Self {
        Self {
            store,
            device,
            options,
            observer,
        }
    }

    /// Run to completion on the calling thread.
    pub fn run(self) -> Result<JobOutcome, JobError> {
        self.start()?.wait()
    }

    /// Spawn the worker pool and the skim scanner and return immediately.
    pub fn start(self) -> Result<RunningJob, JobError> {
        let Job {
            store,
            device,
            options,
            observer,
        } = self;

        let device_len = device.len();
        if options.start_offset > device_len {
            return Err(JobError::InvalidStartOffset {
                offset: options.start_offset,
                device_len,
            });
        }

        let total_sectors = store.len() as u64;
        let stride = skim::skim_stride(total_sectors);
        let sector_limit = options.settings.sector_limit(total_sectors);
        let workers = options.workers.max(1);
        let already_complete = store.is_complete();

        let channel_cap = workers
            .saturating_mul(CHANNEL_CAPACITY_MULTIPLIER)
            .max(MIN_CHANNEL_CAPACITY);
        let (task_tx, task_rx) = bounded::<MatchTask>(channel_cap);
        let (resume_tx, resume_rx) = unbounded::<()>();
        let (outcome_tx, outcome_rx) = bounded(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        info!(
            "job start: sectors={} device_len={} start={:#x} stride={} inspection_limit={} workers={}",
            total_sectors, device_len, options.start_offset, stride, sector_limit, workers
        );

        let ctx = Arc::new(JobContext {
            settings: options.settings.clone(),
            device: Arc::clone(&device),
            store: Mutex::new(store),
            registry: Mutex::new(InspectionRegistry::new()),
            total_sectors,
            sector_limit,
            output_path: options.output_path.clone(),
            observer,
            finished: AtomicBool::new(false),
            done_count: AtomicU64::new(0),
            resuming: AtomicBool::new(false),
            resume_tx,
            tasks: task_tx,
            pending: PendingTasks::default(),
            outcome_tx,
            inspection_handles: Mutex::new(Vec::new()),
        });

        let mut running = RunningJob {
            ctx: Arc::clone(&ctx),
            outcome_rx,
            shutdown_tx: Some(shutdown_tx),
            skim_handle: None,
            worker_handles: Vec::new(),
        };

        if already_complete {
            info!("source has no meaningful sectors; rebuilding without scanning");
            if ctx.try_begin_finish() {
                ctx.finish();
            }
            return Ok(running);
        }

        running.worker_handles =
            workers::spawn_match_workers(workers, Arc::clone(&ctx), task_rx, shutdown_rx.clone())?;

        let mut calibration_reader = SectorReader::new(Arc::clone(&device));
        let initial_average = perf::calibrate(
            &mut calibration_reader,
            stride,
            options.settings.calibration_samples,
            options.settings.skim_sample_size,
        );
        if let Some(avg) = initial_average {
            debug!("calibration window estimate {avg:.4}s");
        }

        let scanner = SkimScanner::new(
            Arc::clone(&ctx),
            options.start_offset,
            stride,
            initial_average,
            resume_rx,
            shutdown_rx,
        );
        let handle = thread::Builder::new()
            .name("skim".to_string())
            .spawn(move || scanner.run())
            .map_err(|source| JobError::Spawn {
                what: "skim",
                source,
            })?;
        running.skim_handle = Some(handle);

        Ok(running)
    }
}

/// Handle to a job whose threads are running.
pub struct RunningJob {
    ctx: Arc<JobContext>,
    outcome_rx: Receiver<Result<JobOutcome, JobError>>,
    shutdown_tx: Option<Sender<()>>,
    skim_handle: Option<JoinHandle<SkimState>>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl RunningJob {
    pub fn total_sectors(&self) -> u64 {
        self.ctx.total_sectors
    }

    /// Sectors matched so far.
    pub fn resolved(&self) -> u64 {
        self.ctx.resolved()
    }

    /// Match checks queued or executing.
    pub fn queued_tasks(&self) -> u64 {
        self.ctx.pending.count()
    }

    pub fn is_finished(&self) -> bool {
        self.ctx.is_finished()
    }

    pub fn active_inspections(&self) -> Vec<InspectionSnapshot> {
        lock(&self.ctx.registry).snapshots()
    }

    /// Give up on the run. Scanners stop at their next sector boundary and
    /// the outcome reports failure with reason `Abandoned`.
    pub fn abandon(&self) -> bool {
        self.ctx.fail(FinishReason::Abandoned)
    }

    /// A handle that can abandon the run from another thread, e.g. a signal
    /// handler, without keeping the job alive.
    pub fn abandon_handle(&self) -> AbandonHandle {
        AbandonHandle {
            ctx: Arc::downgrade(&self.ctx),
        }
    }

    /// Block until the job finishes, then stop and join every thread.
    pub fn wait(mut self) -> Result<JobOutcome, JobError> {
        let outcome = self.outcome_rx.recv().map_err(|_| JobError::NoOutcome);
        self.shutdown();
        outcome?
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects every worker's and the skim's shutdown receiver.
        self.shutdown_tx.take();
        for handle in self.worker_handles.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.skim_handle.take() {
            match handle.join() {
                Ok(state) => debug!("skim scanner exited in state {state:?}"),
                Err(_) => warn!("skim scanner panicked"),
            }
        }
        // Readers may be spawned while earlier ones are joined.
        loop {
            let handles: Vec<_> = lock(&self.ctx.inspection_handles).drain(..).collect();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.join();
            }
        }
    }
}

#[derive(Clone)]
pub struct AbandonHandle {
    ctx: Weak<JobContext>,
}

impl AbandonHandle {
    /// Returns false if the job already finished or is gone.
    pub fn abandon(&self) -> bool {
        self.ctx
            .upgrade()
            .is_some_and(|ctx| ctx.fail(FinishReason::Abandoned))
    }
}

impl Drop for RunningJob {
    fn drop(&mut self) {
        if !self.ctx.is_finished() {
            self.ctx.fail(FinishReason::Abandoned);
        }
        self.shutdown();
    }
}
