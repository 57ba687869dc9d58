mod common;

use std::sync::{Arc, Mutex};

use recoverability::config::InspectionSpan;
use recoverability::device::{DeviceSource, MemorySource};
use recoverability::pipeline::FinishReason;
use recoverability::pipeline::events::{JobEvent, JobObserver};
use recoverability::sectors::SectorStore;

use common::{
    SECTOR, TraceEntry, TraceObserver, TracingDevice, blank_image, distinct_source,
    fast_settings, plant,
};

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Image with many short fragments of a 32-sector file, so inspections
/// start, overlap in time and end throughout the run.
fn scattered_image(source: &[u8]) -> Vec<u8> {
    let mut image = blank_image(4 << 20);
    // Skim step for 32 sectors is 17.
    for (chunk, at) in [(0..4, 170), (4..10, 1700), (10..16, 3400), (16..24, 5100), (24..32, 6800)] {
        plant(&mut image, source, chunk, at);
    }
    image
}

fn traced_run(workers: usize) -> (common::RunResult, Vec<TraceEntry>) {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    let source = distinct_source(32, 0x3C);
    let image = scattered_image(&source);

    let trace = Arc::new(Mutex::new(Vec::new()));
    let inner: Arc<dyn DeviceSource> = Arc::new(MemorySource::new(image));
    let device = Arc::new(TracingDevice::new(inner, Arc::clone(&trace)));
    let store = SectorStore::from_bytes("s.bin", &source).expect("store");
    let mut options = common::options(
        temp_dir.path().join("s_RECONSTRUCTED.bin"),
        0,
        fast_settings(),
    );
    options.workers = workers;
    let extra: Vec<Arc<dyn JobObserver>> = vec![Arc::new(TraceObserver::new(Arc::clone(&trace)))];

    let result = common::run_job(store, device, options, extra);
    let entries = trace.lock().expect("trace").clone();
    (result, entries)
}

#[test]
fn skim_never_reads_while_inspections_are_active() {
    let rounds = env_u64("RECOVERABILITY_STRESS_ROUNDS", 5);
    for round in 0..rounds {
        let (result, trace) = traced_run(8);
        assert!(result.outcome.success, "round {round}: {:?}", result.outcome);

        let mut active = 0i64;
        for entry in &trace {
            match entry {
                TraceEntry::PairStarted { .. } => active += 2,
                TraceEntry::ReaderFinished { .. } => active -= 1,
                TraceEntry::SkimRead(offset) => {
                    assert_eq!(
                        active, 0,
                        "round {round}: skim read {offset:#x} with {active} readers active"
                    );
                }
            }
            assert!(active >= 0);
        }
        assert_eq!(active, 0, "round {round}: readers left registered");
    }
}

#[test]
fn no_pair_starts_inside_an_active_window() {
    let rounds = env_u64("RECOVERABILITY_STRESS_ROUNDS", 5);
    for round in 0..rounds {
        let (_, trace) = traced_run(8);
        // origin -> (window, readers still running)
        let mut active: Vec<(u64, u64, u64, u32)> = Vec::new();
        for entry in &trace {
            match entry {
                TraceEntry::PairStarted { origin, low, high } => {
                    assert!(
                        !active.iter().any(|(_, lo, hi, _)| lo <= origin && origin < hi),
                        "round {round}: pair at {origin:#x} started inside an active window"
                    );
                    active.push((*origin, *low, *high, 2));
                }
                TraceEntry::ReaderFinished { origin } => {
                    let pos = active
                        .iter()
                        .position(|(o, ..)| o == origin)
                        .expect("finished reader was registered");
                    active[pos].3 -= 1;
                    if active[pos].3 == 0 {
                        active.remove(pos);
                    }
                }
                TraceEntry::SkimRead(_) => {}
            }
        }
    }
}

#[test]
fn exactly_one_finish_per_run() {
    let rounds = env_u64("RECOVERABILITY_STRESS_ROUNDS", 5);
    for round in 0..rounds {
        for workers in [1, 2, 16] {
            let (result, _) = traced_run(workers);
            assert_eq!(result.finished_events(), 1, "round {round} workers {workers}");
            assert!(result.outcome.success);
            assert_eq!(result.outcome.resolved, 32);
            assert_eq!(result.sectors_resolved(), 32);
        }
    }
}

/// Files 0..8 at 90, six garbage sectors, files 8..16 at 104. Starting at
/// 104 without wrap-around, the only skim hit is file sector 8, and a half
/// span around it cannot reach files 0..6.
fn gapped_run(chain: bool) -> common::RunResult {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    let source = distinct_source(16, 0x52);
    let mut image = blank_image(512 * SECTOR);
    plant(&mut image, &source, 0..8, 90);
    image[98 * SECTOR..104 * SECTOR].fill(0x5A);
    plant(&mut image, &source, 8..16, 104);

    let mut settings = fast_settings();
    settings.inspection_span = InspectionSpan::Half;
    settings.wrap_around = false;
    settings.chain_inspections = chain;
    settings.chain_min_hit_rate = 0.2;
    // Give workers time to score each sector before the reader decides.
    settings.inspection_throttle_ms = 2;
    common::run_on_image(temp_dir.path(), &source, &image, 104 * SECTOR as u64, settings)
}

#[test]
fn chained_inspection_reaches_past_a_gap() {
    let result = gapped_run(true);
    assert!(result.outcome.success, "outcome: {:?}", result.outcome);
    let origins: Vec<u64> = result
        .events
        .iter()
        .filter_map(|event| match event {
            JobEvent::InspectionStarted { origin, .. } => Some(*origin),
            _ => None,
        })
        .collect();
    assert_eq!(origins[0], 104 * SECTOR as u64);
    assert!(origins.contains(&(88 * SECTOR as u64)), "origins: {origins:?}");
}

#[test]
fn without_chaining_the_gap_is_not_crossed() {
    let result = gapped_run(false);
    assert!(!result.outcome.success);
    assert_eq!(result.outcome.reason, FinishReason::DeviceExhausted);
    assert_eq!(result.outcome.resolved, 10);
    assert_eq!(result.inspections_started(), 1);
}
