//! # Performance Metrics
//!
//! Rate tracking for the copy engines: bytes and rows are sampled at 1 Hz,
//! rows/sec and MB/sec are smoothed with a 5-sample EMA, and the ETA is
//! `remaining_rows / max(ema_rows_per_sec, 1)`.

use std::time::{Duration, Instant};

use crate::bus::ProgressUpdate;

/// Exponential moving average over the last ~5 samples (α = 2/(N+1)).
#[derive(Debug, Clone, Copy, Default)]
pub struct Ema {
    value: Option<f64>,
}

const EMA_ALPHA: f64 = 2.0 / 6.0;

impl Ema {
    pub fn push(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            Some(current) => current + EMA_ALPHA * (sample - current),
            None => sample,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

/// Accumulates run-wide and per-partition counters and renders progress
/// snapshots. One instance lives for the whole run.
pub struct ProgressTracker {
    started: Instant,
    total_rows: u64,
    total_bytes: u64,
    total_partitions: usize,
    completed_partitions: usize,

    partition: String,
    partition_index: usize,
    partition_rows: u64,
    partition_total_rows: u64,

    ema_rows: Ema,
    ema_mb: Ema,
    last_sample: Instant,
    sample_rows: u64,
    sample_bytes: u64,
}

/// Sampling interval for the EMA inputs.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

impl ProgressTracker {
    pub fn new(total_partitions: usize) -> ProgressTracker {
        let now = Instant::now();
        ProgressTracker {
            started: now,
            total_rows: 0,
            total_bytes: 0,
            total_partitions,
            completed_partitions: 0,
            partition: String::new(),
            partition_index: 0,
            partition_rows: 0,
            partition_total_rows: 0,
            ema_rows: Ema::default(),
            ema_mb: Ema::default(),
            last_sample: now,
            sample_rows: 0,
            sample_bytes: 0,
        }
    }

    pub fn begin_partition(&mut self, index: usize, name: &str, total_rows: u64) {
        self.partition_index = index;
        self.partition = name.to_string();
        self.partition_rows = 0;
        self.partition_total_rows = total_rows;
    }

    /// For resumed partitions: rows already copied in an earlier process.
    pub fn resume_partition_at(&mut self, rows: u64) {
        self.partition_rows = rows;
    }

    pub fn complete_partition(&mut self) {
        self.completed_partitions += 1;
    }

    pub fn completed_partitions(&self) -> usize {
        self.completed_partitions
    }

    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    /// Records copied rows/bytes and folds a new rate sample into the EMAs
    /// once per sampling interval.
    pub fn add(&mut self, rows: u64, bytes: u64) {
        self.total_rows += rows;
        self.total_bytes += bytes;
        self.partition_rows += rows;
        self.sample_rows += rows;
        self.sample_bytes += bytes;

        let elapsed = self.last_sample.elapsed();
        if elapsed >= SAMPLE_INTERVAL {
            let secs = elapsed.as_secs_f64();
            self.ema_rows.push(self.sample_rows as f64 / secs);
            self.ema_mb
                .push(self.sample_bytes as f64 / (1024.0 * 1024.0) / secs);
            self.sample_rows = 0;
            self.sample_bytes = 0;
            self.last_sample = Instant::now();
        }
    }

    /// Rows still expected in the current partition.
    fn remaining_in_partition(&self) -> u64 {
        self.partition_total_rows.saturating_sub(self.partition_rows)
    }

    pub fn snapshot(&self) -> ProgressUpdate {
        let rows_per_sec = self.ema_rows.value();
        let eta_seconds = self.remaining_in_partition() as f64 / rows_per_sec.max(1.0);
        ProgressUpdate {
            partition_index: self.partition_index,
            total_partitions: self.total_partitions,
            partition: self.partition.clone(),
            partition_rows: self.partition_rows,
            partition_total_rows: self.partition_total_rows,
            total_rows: self.total_rows,
            total_bytes: self.total_bytes,
            rows_per_sec,
            mb_per_sec: self.ema_mb.value(),
            eta_seconds,
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_starts_at_first_sample() {
        let mut ema = Ema::default();
        assert_eq!(ema.push(1200.0), 1200.0);
    }

    #[test]
    fn test_ema_converges_toward_constant_input() {
        let mut ema = Ema::default();
        ema.push(0.0);
        for _ in 0..40 {
            ema.push(900.0);
        }
        assert!((ema.value() - 900.0).abs() < 1.0);
    }

    #[test]
    fn test_ema_smooths_spikes() {
        let mut ema = Ema::default();
        ema.push(1000.0);
        let after_spike = ema.push(10_000.0);
        assert!(after_spike < 10_000.0);
        assert!(after_spike > 1000.0);
    }

    #[test]
    fn test_totals_are_monotone() {
        let mut tracker = ProgressTracker::new(3);
        tracker.begin_partition(0, "point_history_240921", 86_400);

        let mut previous = 0;
        for _ in 0..5 {
            tracker.add(10_000, 400_000);
            let snapshot = tracker.snapshot();
            assert!(snapshot.total_rows >= previous);
            previous = snapshot.total_rows;
        }
        assert_eq!(previous, 50_000);
    }

    #[test]
    fn test_partition_counters_reset_between_partitions() {
        let mut tracker = ProgressTracker::new(2);
        tracker.begin_partition(0, "a", 100);
        tracker.add(100, 1000);
        tracker.complete_partition();
        tracker.begin_partition(1, "b", 200);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.partition_rows, 0);
        assert_eq!(snapshot.partition_total_rows, 200);
        assert_eq!(snapshot.total_rows, 100);
        assert_eq!(tracker.completed_partitions(), 1);
    }

    #[test]
    fn test_eta_uses_floor_rate_of_one() {
        let mut tracker = ProgressTracker::new(1);
        tracker.begin_partition(0, "a", 500);
        // No samples yet: rate is 0, so the divisor floors at 1 row/sec.
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.eta_seconds, 500.0);
    }

    #[test]
    fn test_resume_offsets_partition_rows() {
        let mut tracker = ProgressTracker::new(1);
        tracker.begin_partition(0, "a", 86_400);
        tracker.resume_partition_at(40_000);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.partition_rows, 40_000);
        // Resumed rows do not count toward this activation's totals.
        assert_eq!(snapshot.total_rows, 0);
    }
}
