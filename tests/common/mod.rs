//! Shared test infrastructure: synthetic source files, device images with
//! file fragments planted at chosen sectors, and event capture.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crossbeam_channel::unbounded;

use recoverability::config::ScanSettings;
use recoverability::device::{self, DeviceError, DeviceSource};
use recoverability::pipeline::events::{ChannelObserver, JobEvent, JobObserver};
use recoverability::pipeline::{Job, JobOptions, JobOutcome};
use recoverability::sectors::SectorStore;

pub const SECTOR: usize = 512;

/// Source bytes whose sectors are all distinct and none meaningless.
pub fn distinct_source(sectors: usize, seed: u8) -> Vec<u8> {
    let mut bytes = vec![0u8; sectors * SECTOR];
    for (index, sector) in bytes.chunks_mut(SECTOR).enumerate() {
        sector.fill(seed.wrapping_add(index as u8) | 0x01);
        sector[..8].copy_from_slice(&(index as u64).to_le_bytes());
        sector[8] = seed;
    }
    bytes
}

/// Zero-filled device image with `len` bytes.
pub fn blank_image(len: usize) -> Vec<u8> {
    vec![0u8; len]
}

/// Copy `sectors` (file sector indices, in order) of `source` onto `image`
/// starting at device sector `at`. The last file sector is zero-padded.
pub fn plant(image: &mut [u8], source: &[u8], sectors: std::ops::Range<usize>, at: usize) {
    for (i, file_sector) in sectors.enumerate() {
        let mut sector = [0u8; SECTOR];
        let start = file_sector * SECTOR;
        let end = (start + SECTOR).min(source.len());
        sector[..end - start].copy_from_slice(&source[start..end]);
        let dst = (at + i) * SECTOR;
        image[dst..dst + SECTOR].copy_from_slice(&sector);
    }
}

pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, bytes).expect("write file");
    path
}

/// Settings for deterministic, quick runs: no calibration pass.
pub fn fast_settings() -> ScanSettings {
    ScanSettings {
        calibration_samples: 0,
        ..ScanSettings::default()
    }
}

pub fn options(output_path: PathBuf, start_offset: u64, settings: ScanSettings) -> JobOptions {
    JobOptions {
        start_offset,
        workers: 4,
        output_path,
        settings,
    }
}

pub struct RunResult {
    pub outcome: JobOutcome,
    pub events: Vec<JobEvent>,
}

impl RunResult {
    pub fn count(&self, pred: impl Fn(&JobEvent) -> bool) -> usize {
        self.events.iter().filter(|event| pred(event)).count()
    }

    pub fn inspections_started(&self) -> usize {
        self.count(|event| matches!(event, JobEvent::InspectionStarted { .. }))
    }

    pub fn sectors_resolved(&self) -> usize {
        self.count(|event| matches!(event, JobEvent::SectorResolved { .. }))
    }

    pub fn finished_events(&self) -> usize {
        self.count(|event| matches!(event, JobEvent::Finished { .. }))
    }
}

/// Run a job over an on-disk image and collect every event it published.
pub fn run_on_image(
    dir: &Path,
    source: &[u8],
    image: &[u8],
    start_offset: u64,
    settings: ScanSettings,
) -> RunResult {
    let source_path = write_file(dir, "source.bin", source);
    let image_path = write_file(dir, "disk.img", image);
    let device = device::open_device(&image_path).expect("open image");
    let store = SectorStore::load(&source_path, u64::MAX).expect("load source");
    let output = dir.join("out").join(store.reconstructed_file_name());
    run_job(store, device, options(output, start_offset, settings), Vec::new())
}

pub fn run_job(
    store: SectorStore,
    device: Arc<dyn DeviceSource>,
    options: JobOptions,
    extra: Vec<Arc<dyn JobObserver>>,
) -> RunResult {
    let (tx, rx) = unbounded();
    let mut observers: Vec<Arc<dyn JobObserver>> = vec![Arc::new(ChannelObserver::new(tx))];
    observers.extend(extra);
    let observer = Arc::new(recoverability::pipeline::events::FanoutObserver::new(observers));
    let outcome = Job::new(store, device, options, observer)
        .run()
        .expect("job run");
    RunResult {
        outcome,
        events: rx.try_iter().collect(),
    }
}

/// One entry of an interleaved trace of device reads and registry changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEntry {
    SkimRead(u64),
    PairStarted { origin: u64, low: u64, high: u64 },
    ReaderFinished { origin: u64 },
}

pub type Trace = Arc<Mutex<Vec<TraceEntry>>>;

/// Device wrapper recording every read made from the skim thread.
pub struct TracingDevice {
    inner: Arc<dyn DeviceSource>,
    trace: Trace,
}

impl TracingDevice {
    pub fn new(inner: Arc<dyn DeviceSource>, trace: Trace) -> Self {
        Self { inner, trace }
    }
}

impl DeviceSource for TracingDevice {
    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DeviceError> {
        if std::thread::current().name() == Some("skim") {
            self.trace
                .lock()
                .expect("trace")
                .push(TraceEntry::SkimRead(offset));
        }
        self.inner.read_at(offset, buf)
    }
}

/// Observer appending registry changes to the same trace.
pub struct TraceObserver {
    trace: Trace,
}

impl TraceObserver {
    pub fn new(trace: Trace) -> Self {
        Self { trace }
    }
}

impl JobObserver for TraceObserver {
    fn on_event(&self, event: &JobEvent) {
        let entry = match event {
            JobEvent::InspectionStarted { origin, forward, .. } => {
                let (low, high) = forward.window();
                TraceEntry::PairStarted {
                    origin: *origin,
                    low,
                    high,
                }
            }
            JobEvent::InspectionFinished { descriptor, .. } => TraceEntry::ReaderFinished {
                origin: descriptor.origin_offset,
            },
            _ => return,
        };
        self.trace.lock().expect("trace").push(entry);
    }
}

/// Device wrapper that sleeps on every read.
pub struct SlowDevice {
    inner: Arc<dyn DeviceSource>,
    delay: std::time::Duration,
}

impl SlowDevice {
    pub fn new(inner: Arc<dyn DeviceSource>, delay: std::time::Duration) -> Self {
        Self { inner, delay }
    }
}

impl DeviceSource for SlowDevice {
    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DeviceError> {
        std::thread::sleep(self.delay);
        self.inner.read_at(offset, buf)
    }
}
