//! # Performance Estimation
//!
//! Rolling throughput estimate for one reader. Each reader counts the sectors
//! it reads; every `sample_size` sectors the elapsed wall time of the window
//! is folded into a damped average and a fresh ETA is produced.

use std::time::Instant;

use serde::Serialize;

use crate::constants::SECTOR_BYTES;
use crate::device::SectorReader;

/// Result of one window recalculation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerfSample {
    /// Damped average wall time of one sample window, in seconds.
    pub average_seconds: f64,
    pub remaining_seconds: f64,
    pub progress: f64,
}

#[derive(Debug, Clone)]
pub struct PerformanceEstimator {
    sample_size: u64,
    total_to_read: u64,
    sectors_read: u64,
    next_reset: u64,
    avg: f64,
    anchor: Instant,
}

impl PerformanceEstimator {
    pub fn new(total_to_read: u64, sample_size: u64) -> Self {
        let sample_size = sample_size.max(1);
        Self {
            sample_size,
            total_to_read,
            sectors_read: 0,
            next_reset: sample_size,
            avg: 0.0,
            anchor: Instant::now(),
        }
    }

    /// Seed the average, e.g. from a calibration run.
    pub fn with_initial_average(mut self, average_seconds: f64) -> Self {
        if average_seconds.is_finite() && average_seconds > 0.0 {
            self.avg = average_seconds;
        }
        self
    }

    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    fn start_at(&mut self, now: Instant) {
        self.next_reset = self.sectors_read + self.sample_size;
        self.anchor = now;
    }

    /// Count one sector. Returns a sample when this read closed a window.
    pub fn increment(&mut self) -> Option<PerfSample> {
        self.increment_at(Instant::now())
    }

    fn increment_at(&mut self, now: Instant) -> Option<PerfSample> {
        self.sectors_read += 1;
        if self.sectors_read < self.next_reset {
            return None;
        }
        let window = now.saturating_duration_since(self.anchor).as_secs_f64();
        self.avg = if self.avg > 0.0 {
            (self.avg + window) / 2.0
        } else {
            window
        };
        self.start_at(now);
        Some(self.sample())
    }

    pub fn sample(&self) -> PerfSample {
        PerfSample {
            average_seconds: self.avg,
            remaining_seconds: self.remaining_seconds(),
            progress: self.progress(),
        }
    }

    pub fn average(&self) -> f64 {
        self.avg
    }

    pub fn sectors_read(&self) -> u64 {
        self.sectors_read
    }

    /// Zero until the first window has been measured.
    pub fn remaining_seconds(&self) -> f64 {
        if self.avg <= 0.0 {
            return 0.0;
        }
        let left = self.total_to_read.saturating_sub(self.sectors_read);
        (self.avg / self.sample_size as f64) * left as f64
    }

    pub fn progress(&self) -> f64 {
        if self.total_to_read == 0 {
            return 1.0;
        }
        (self.sectors_read as f64 / self.total_to_read as f64).min(1.0)
    }
}

/// Number of sectors a skim of `device_len` bytes reads when it skips `stride`
/// bytes after every sector.
pub fn skim_reads(device_len: u64, stride: u64) -> u64 {
    device_len.div_ceil(SECTOR_BYTES + stride)
}

/// Time up to `samples` strided reads from the start of the device and scale
/// the result to one estimator window of `sample_size` sectors.
pub fn calibrate(
    reader: &mut SectorReader,
    stride: u64,
    samples: u64,
    sample_size: u64,
) -> Option<f64> {
    if samples == 0 {
        return None;
    }
    reader.seek(0);
    let started = Instant::now();
    let mut read = 0u64;
    while read < samples {
        if reader.read_sector().is_none() {
            break;
        }
        read += 1;
        reader.skip(stride);
    }
    if read == 0 {
        return None;
    }
    let per_sector = started.elapsed().as_secs_f64() / read as f64;
    Some(per_sector * sample_size.max(1) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn no_estimate_before_first_window() {
        let mut perf = PerformanceEstimator::new(100, 10);
        perf.start();
        for _ in 0..9 {
            assert!(perf.increment().is_none());
        }
        assert_eq!(perf.remaining_seconds(), 0.0);
    }

    #[test]
    fn damps_window_average() {
        let mut perf = PerformanceEstimator::new(100, 4);
        let t0 = Instant::now();
        perf.start_at(t0);
        for _ in 0..3 {
            assert!(perf.increment_at(t0).is_none());
        }
        let first = perf.increment_at(t0 + Duration::from_secs(2)).expect("window");
        assert!((first.average_seconds - 2.0).abs() < 1e-9);

        let t1 = t0 + Duration::from_secs(2);
        for _ in 0..3 {
            perf.increment_at(t1);
        }
        let second = perf.increment_at(t1 + Duration::from_secs(4)).expect("window");
        assert!((second.average_seconds - 3.0).abs() < 1e-9);
        // 3s per 4 sectors with 92 sectors left.
        assert!((second.remaining_seconds - 69.0).abs() < 1e-9);
        assert!((second.progress - 0.08).abs() < 1e-9);
    }

    #[test]
    fn initial_average_seeds_estimate() {
        let perf = PerformanceEstimator::new(50, 10).with_initial_average(1.0);
        assert!((perf.remaining_seconds() - 5.0).abs() < 1e-9);
        let ignored = PerformanceEstimator::new(50, 10).with_initial_average(f64::NAN);
        assert_eq!(ignored.average(), 0.0);
    }

    #[test]
    fn counts_strided_reads() {
        assert_eq!(skim_reads(512 * 10, 512), 5);
        assert_eq!(skim_reads(512 * 11, 512), 6);
        assert_eq!(skim_reads(512 * 3, 0), 3);
    }

    #[test]
    fn calibration_reads_at_stride() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![1u8; 512 * 8]).expect("write");
        let source = crate::device::open_device(&path).expect("open");
        let mut reader = SectorReader::new(source);
        let avg = calibrate(&mut reader, 512, 100, 10).expect("estimate");
        assert!(avg >= 0.0);
        // Four reads fit in eight sectors with a one-sector stride.
        assert_eq!(reader.position(), 512 * 8);
        assert!(calibrate(&mut reader, 512, 0, 10).is_none());
    }
}
