mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use recoverability::device::{DeviceSource, MemorySource};
use recoverability::pipeline::events::NullObserver;
use recoverability::pipeline::{FinishReason, Job};
use recoverability::sectors::SectorStore;

use common::{SECTOR, SlowDevice, blank_image, distinct_source, fast_settings};

fn slow_job(dir: &std::path::Path) -> Job {
    let store = SectorStore::from_bytes("a.bin", &distinct_source(16, 0x05)).expect("store");
    // 8 MiB of zeros at 1 ms per read keeps the skim busy for seconds.
    let inner: Arc<dyn DeviceSource> = Arc::new(MemorySource::new(blank_image(8 << 20)));
    let device = Arc::new(SlowDevice::new(inner, Duration::from_millis(1)));
    let options = common::options(dir.join("a_RECONSTRUCTED.bin"), 0, fast_settings());
    Job::new(store, device, options, Arc::new(NullObserver))
}

#[test]
fn abandon_stops_run_and_reports_failure() {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    let running = slow_job(temp_dir.path()).start().expect("start");
    std::thread::sleep(Duration::from_millis(20));

    assert!(running.abandon());
    assert!(running.is_finished());
    // A second abandon has nothing left to stop.
    assert!(!running.abandon());

    let started = Instant::now();
    let outcome = running.wait().expect("outcome");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!outcome.success);
    assert_eq!(outcome.reason, FinishReason::Abandoned);
    assert!(outcome.output_path.is_none());
    assert!(!temp_dir.path().join("a_RECONSTRUCTED.bin").exists());
}

#[test]
fn abandon_handle_outlives_the_job() {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    let running = slow_job(temp_dir.path()).start().expect("start");
    let handle = running.abandon_handle();
    let remote = handle.clone();

    let canceller = std::thread::spawn(move || remote.abandon());
    assert!(canceller.join().expect("join"));
    let outcome = running.wait().expect("outcome");
    assert_eq!(outcome.reason, FinishReason::Abandoned);
    assert!(!handle.abandon());
}

#[test]
fn dropping_running_job_joins_threads() {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    let running = slow_job(temp_dir.path()).start().expect("start");
    assert_eq!(running.total_sectors(), 16);
    assert!(running.active_inspections().is_empty());

    let started = Instant::now();
    drop(running);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn abandon_after_completion_is_a_no_op() {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    let source = distinct_source(4, 0x44);
    let mut image = blank_image(64 * SECTOR);
    common::plant(&mut image, &source, 0..4, 0);
    let store = SectorStore::from_bytes("b.bin", &source).expect("store");
    let options = common::options(temp_dir.path().join("b_RECONSTRUCTED.bin"), 0, fast_settings());
    let running = Job::new(
        store,
        Arc::new(MemorySource::new(image)),
        options,
        Arc::new(NullObserver),
    )
    .start()
    .expect("start");
    let handle = running.abandon_handle();
    let outcome = running.wait().expect("outcome");
    assert!(outcome.success);
    assert!(!handle.abandon());
}
