//! Per-frame evaluation.
//!
//! - `FrameBatch`: one frame's worth of engine output (dimensions + detections).
//! - `FrameEvaluator`: classifies each detection, tests it against the region,
//!   and records a `FrameSample` into the shared `StatsAggregator`.
//!
//! Frames must be evaluated in arrival order: the recorded interval is the
//! wall-clock gap to the previous frame. The very first frame has nothing to
//! measure against and produces no sample.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;

use crate::detect::{classify, ClassCategory, Detection, RawDetection};
use crate::region::Region;
use crate::stats::{FrameSample, StatsAggregator};

/// Frames for which detection-level diagnostics are logged.
const DIAGNOSTIC_FRAMES: u64 = 3;

/// Failing frames reported at error level before going quiet.
const MAX_REPORTED_FRAME_ERRORS: u64 = 5;

/// Detections for one decoded frame.
#[derive(Debug)]
pub struct FrameBatch {
    /// When the engine produced the frame, not when it was dequeued.
    pub captured_at: Instant,
    /// Frame dimensions when the engine knows them (e.g. from caps).
    pub dimensions: Option<(u32, u32)>,
    /// `Err` when the engine could not read the frame's detection metadata.
    pub detections: Result<Vec<RawDetection>>,
}

impl FrameBatch {
    /// A batch captured now.
    pub fn new(detections: Vec<RawDetection>) -> Self {
        Self {
            captured_at: Instant::now(),
            dimensions: None,
            detections: Ok(detections),
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.dimensions = Some((width, height));
        self
    }

    pub fn with_captured_at(mut self, captured_at: Instant) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn failed(err: anyhow::Error) -> Self {
        Self {
            captured_at: Instant::now(),
            dimensions: None,
            detections: Err(err),
        }
    }
}

/// In-region counts for one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoiCounts {
    pub persons: u32,
    pub vehicles: u32,
    pub total: u32,
}

/// Result of evaluating one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameOutcome {
    /// Zero-based index of the frame in arrival order.
    pub frame_index: u64,
    pub counts: RoiCounts,
    /// `None` for the first frame (or a zero interval).
    pub sample: Option<FrameSample>,
    /// Detections dropped because they could not be classified or were malformed.
    pub skipped: u32,
}

/// Scores frames against a region and feeds the aggregator.
pub struct FrameEvaluator {
    region: Arc<Region>,
    stats: Arc<StatsAggregator>,
    frame_width: u32,
    frame_height: u32,
    dimensions_reported: bool,
    previous_at: Option<Instant>,
    frames_seen: u64,
    frame_errors: u64,
    skipped_detections: u64,
}

impl FrameEvaluator {
    /// `default_width`/`default_height` apply until the engine reports the
    /// real frame dimensions.
    pub fn new(
        region: Arc<Region>,
        stats: Arc<StatsAggregator>,
        default_width: u32,
        default_height: u32,
    ) -> Self {
        Self {
            region,
            stats,
            frame_width: default_width,
            frame_height: default_height,
            dimensions_reported: false,
            previous_at: None,
            frames_seen: 0,
            frame_errors: 0,
            skipped_detections: 0,
        }
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn frame_dimensions(&self) -> (u32, u32) {
        (self.frame_width, self.frame_height)
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn frame_errors(&self) -> u64 {
        self.frame_errors
    }

    pub fn skipped_detections(&self) -> u64 {
        self.skipped_detections
    }

    /// Evaluate a frame at its own capture time.
    pub fn evaluate(&mut self, batch: FrameBatch) -> FrameOutcome {
        let captured_at = batch.captured_at;
        self.evaluate_at(batch, captured_at)
    }

    /// Evaluate a frame as if it was captured at `now`.
    pub fn evaluate_at(&mut self, batch: FrameBatch, now: Instant) -> FrameOutcome {
        let frame_index = self.frames_seen;
        let interval_ms = self
            .previous_at
            .map(|prev| now.saturating_duration_since(prev).as_secs_f64() * 1000.0);
        self.previous_at = Some(now);

        self.adopt_dimensions(batch.dimensions);

        let (counts, skipped) = match batch.detections {
            Ok(detections) => self.count_in_region(frame_index, &detections),
            Err(err) => {
                self.frame_errors += 1;
                if self.frame_errors <= MAX_REPORTED_FRAME_ERRORS {
                    log::error!("frame {}: error parsing detections: {:#}", frame_index, err);
                }
                (RoiCounts::default(), 0)
            }
        };
        self.skipped_detections += u64::from(skipped);

        let sample = match interval_ms {
            Some(interval_ms) if interval_ms > 0.0 => {
                let sample = FrameSample {
                    timestamp: wall_clock_at(now),
                    person_count: counts.persons,
                    vehicle_count: counts.vehicles,
                    total_in_roi: counts.total,
                    frame_interval_ms: interval_ms,
                    roi_name: self.region.name().to_string(),
                };
                self.stats.record(sample.clone());
                Some(sample)
            }
            _ => None,
        };

        self.frames_seen += 1;
        FrameOutcome {
            frame_index,
            counts,
            sample,
            skipped,
        }
    }

    fn adopt_dimensions(&mut self, dimensions: Option<(u32, u32)>) {
        let Some((width, height)) = dimensions else {
            return;
        };
        if self.dimensions_reported {
            if (width, height) != (self.frame_width, self.frame_height) {
                log::debug!(
                    "frame dimensions changed to {}x{}; keeping {}x{}",
                    width,
                    height,
                    self.frame_width,
                    self.frame_height
                );
            }
            return;
        }
        if width == 0 || height == 0 {
            return;
        }
        self.frame_width = width;
        self.frame_height = height;
        self.dimensions_reported = true;
        log::info!("frame dimensions from engine: {}x{}", width, height);
    }

    fn count_in_region(&self, frame_index: u64, detections: &[RawDetection]) -> (RoiCounts, u32) {
        let diagnostics = frame_index < DIAGNOSTIC_FRAMES;
        if diagnostics {
            log::info!("frame {}: found {} detections", frame_index, detections.len());
        }

        let width = f64::from(self.frame_width);
        let height = f64::from(self.frame_height);
        let mut counts = RoiCounts::default();
        let mut skipped = 0u32;

        for raw in detections {
            let Some(detection) = self.resolve(raw) else {
                skipped += 1;
                log::debug!("frame {}: skipping unusable detection {:?}", frame_index, raw.key);
                continue;
            };

            let pixels = detection.bbox.to_pixels(width, height);
            if diagnostics {
                log::debug!(
                    "  detection: {:?} (conf={:.2}) norm=({:.3},{:.3},{:.3},{:.3}) abs=({:.0},{:.0},{:.0},{:.0})",
                    detection.category,
                    detection.confidence,
                    detection.bbox.xmin,
                    detection.bbox.ymin,
                    detection.bbox.xmax,
                    detection.bbox.ymax,
                    pixels.xmin,
                    pixels.ymin,
                    pixels.xmax,
                    pixels.ymax
                );
            }

            if !self.region.overlaps(&pixels, width, height) {
                continue;
            }
            match detection.category {
                ClassCategory::Person => {
                    counts.persons += 1;
                    counts.total += 1;
                    if diagnostics {
                        log::info!("  -> person in roi '{}'", self.region.name());
                    }
                }
                ClassCategory::Vehicle => {
                    counts.vehicles += 1;
                    counts.total += 1;
                    if diagnostics {
                        log::info!("  -> vehicle in roi '{}'", self.region.name());
                    }
                }
                ClassCategory::Other => {}
            }
        }

        (counts, skipped)
    }

    fn resolve(&self, raw: &RawDetection) -> Option<Detection> {
        if !raw.bbox.is_finite() {
            return None;
        }
        let category = classify(raw)?;
        Some(Detection {
            category,
            confidence: raw.confidence,
            bbox: raw.bbox,
        })
    }
}

/// Wall-clock time of a monotonic instant in the past.
fn wall_clock_at(at: Instant) -> DateTime<Utc> {
    let age = Instant::now().saturating_duration_since(at);
    Utc::now() - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero())
}
