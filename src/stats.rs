//! Rolling frame statistics.
//!
//! `StatsAggregator` keeps the last N frame intervals and per-frame samples in
//! two bounded ring buffers behind a single mutex. The frame path writes, the
//! status path reads; every push of a sample and its interval happens under
//! one lock acquisition so readers never see half of a frame.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Default rolling window capacity.
pub const DEFAULT_WINDOW_SIZE: usize = 100;

/// Number of most recent samples averaged for the "recent" counts.
pub const RECENT_SAMPLES: usize = 10;

/// Counts for one processed frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrameSample {
    pub timestamp: DateTime<Utc>,
    pub person_count: u32,
    pub vehicle_count: u32,
    pub total_in_roi: u32,
    /// Wall-clock time since the previous frame, not inference latency.
    pub frame_interval_ms: f64,
    pub roi_name: String,
}

/// Statistics derived from the current window. Never cached.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AggregatedStats {
    #[serde(rename = "avg_processing_time_ms")]
    pub avg_frame_interval_ms: f64,
    pub fps: f64,
    #[serde(rename = "total_frames")]
    pub total_frames_observed: usize,
    #[serde(rename = "recent_person_count")]
    pub recent_avg_person_count: f64,
    #[serde(rename = "recent_vehicle_count")]
    pub recent_avg_vehicle_count: f64,
}

#[derive(Debug)]
struct Window {
    capacity: usize,
    frame_intervals: VecDeque<f64>,
    samples: VecDeque<FrameSample>,
}

impl Window {
    fn push_interval(&mut self, interval_ms: f64) {
        while self.frame_intervals.len() >= self.capacity {
            self.frame_intervals.pop_front();
        }
        self.frame_intervals.push_back(interval_ms);
    }

    fn push_sample(&mut self, sample: FrameSample) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }
}

/// Thread-safe rolling window of frame timings and counts.
#[derive(Debug)]
pub struct StatsAggregator {
    window: Mutex<Window>,
}

impl StatsAggregator {
    /// Create an aggregator holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: Mutex::new(Window {
                capacity,
                frame_intervals: VecDeque::with_capacity(capacity),
                samples: VecDeque::with_capacity(capacity),
            }),
        }
    }

    // A panic while holding the lock cannot leave a half-written entry
    // behind, so a poisoned window is still consistent.
    fn lock(&self) -> MutexGuard<'_, Window> {
        self.window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Append a raw frame interval.
    pub fn record_frame(&self, interval_ms: f64) {
        self.lock().push_interval(interval_ms);
    }

    /// Append a frame sample.
    pub fn record_sample(&self, sample: FrameSample) {
        self.lock().push_sample(sample);
    }

    /// Append a sample together with its interval under one lock.
    pub fn record(&self, sample: FrameSample) {
        let mut window = self.lock();
        window.push_interval(sample.frame_interval_ms);
        window.push_sample(sample);
    }

    /// Number of samples currently in the window.
    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().samples.is_empty()
    }

    /// Copy of the window contents, oldest first.
    pub fn samples(&self) -> Vec<FrameSample> {
        self.lock().samples.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<FrameSample> {
        self.lock().samples.back().cloned()
    }

    /// Compute statistics from the live window.
    ///
    /// An empty window yields all-zero statistics.
    pub fn snapshot(&self) -> AggregatedStats {
        let (interval_sum, frames, recent) = {
            let window = self.lock();
            let interval_sum: f64 = window.frame_intervals.iter().sum();
            let skip = window.samples.len().saturating_sub(RECENT_SAMPLES);
            let recent: Vec<(u32, u32)> = window
                .samples
                .iter()
                .skip(skip)
                .map(|s| (s.person_count, s.vehicle_count))
                .collect();
            (interval_sum, window.frame_intervals.len(), recent)
        };

        if frames == 0 {
            return AggregatedStats::default();
        }

        let avg = interval_sum / frames as f64;
        let fps = if avg > 0.0 { 1000.0 / avg } else { 0.0 };
        let (recent_persons, recent_vehicles) = if recent.is_empty() {
            (0.0, 0.0)
        } else {
            let n = recent.len() as f64;
            let persons: u64 = recent.iter().map(|(p, _)| u64::from(*p)).sum();
            let vehicles: u64 = recent.iter().map(|(_, v)| u64::from(*v)).sum();
            (persons as f64 / n, vehicles as f64 / n)
        };

        AggregatedStats {
            avg_frame_interval_ms: round2(avg),
            fps: round2(fps),
            total_frames_observed: frames,
            recent_avg_person_count: recent_persons,
            recent_avg_vehicle_count: recent_vehicles,
        }
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn sample(persons: u32, vehicles: u32, interval_ms: f64) -> FrameSample {
        FrameSample {
            timestamp: Utc::now(),
            person_count: persons,
            vehicle_count: vehicles,
            total_in_roi: persons + vehicles,
            frame_interval_ms: interval_ms,
            roi_name: "entrance".to_string(),
        }
    }

    #[test]
    fn empty_window_snapshot_is_zero() {
        let stats = StatsAggregator::default();
        assert_eq!(stats.snapshot(), AggregatedStats::default());
        assert!(stats.is_empty());
    }

    #[test]
    fn window_keeps_only_most_recent_samples() {
        let capacity = 20;
        let stats = StatsAggregator::new(capacity);
        for i in 0..(capacity + 5) {
            stats.record(sample(i as u32, 0, 40.0));
        }

        assert_eq!(stats.len(), capacity);
        assert_eq!(stats.snapshot().total_frames_observed, capacity);
        let kept = stats.samples();
        assert_eq!(kept.first().map(|s| s.person_count), Some(5));
        assert_eq!(kept.last().map(|s| s.person_count), Some(24));
    }

    #[test]
    fn snapshot_averages_intervals_and_recent_counts() {
        let stats = StatsAggregator::new(100);
        for _ in 0..5 {
            stats.record(sample(0, 0, 50.0));
        }
        for _ in 0..10 {
            stats.record(sample(2, 1, 25.0));
        }

        let snap = stats.snapshot();
        assert_eq!(snap.total_frames_observed, 15);
        assert_eq!(snap.avg_frame_interval_ms, 33.33);
        assert_eq!(snap.fps, 30.0);
        assert_eq!(snap.recent_avg_person_count, 2.0);
        assert_eq!(snap.recent_avg_vehicle_count, 1.0);
    }

    #[test]
    fn recent_counts_use_partial_window() {
        let stats = StatsAggregator::new(100);
        stats.record(sample(1, 0, 100.0));
        stats.record(sample(2, 3, 100.0));

        let snap = stats.snapshot();
        assert_eq!(snap.recent_avg_person_count, 1.5);
        assert_eq!(snap.recent_avg_vehicle_count, 1.5);
        assert_eq!(snap.fps, 10.0);
    }

    #[test]
    fn frame_intervals_and_samples_can_be_recorded_separately() {
        let stats = StatsAggregator::new(3);
        for _ in 0..5 {
            stats.record_frame(10.0);
        }
        assert_eq!(stats.snapshot().total_frames_observed, 3);
        assert!(stats.is_empty());

        stats.record_sample(sample(4, 0, 10.0));
        assert_eq!(stats.snapshot().recent_avg_person_count, 4.0);
    }

    #[test]
    fn concurrent_snapshots_never_observe_torn_samples() {
        let stats = Arc::new(StatsAggregator::new(50));
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let stats = stats.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                for i in 0..5_000u32 {
                    // Every sample satisfies persons == vehicles and total == 2 * persons.
                    stats.record(sample(i % 7, i % 7, 20.0));
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let stats = stats.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        let snap = stats.snapshot();
                        assert_eq!(snap.recent_avg_person_count, snap.recent_avg_vehicle_count);
                        assert!(snap.total_frames_observed <= 50);
                        if let Some(latest) = stats.latest() {
                            assert_eq!(latest.total_in_roi, latest.person_count * 2);
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(stats.snapshot().total_frames_observed, 50);
    }
}
