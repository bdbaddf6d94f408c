//! Synthetic engine for `stub://` sources.
//!
//! Produces a deterministic scene at a fixed frame rate:
//! - a person walking left to right across the frame
//! - a car parked in the bottom-right corner
//! - a label-only truck passing through the centre every fourth frame
//! - an unmapped class (id 16) near the top edge
//!
//! Query parameters shape the run:
//! - `frames=N`: emit N frames, then end-of-stream (default: unbounded)
//! - `fps=F`: frame rate (default 30)
//! - `fail=build|start`: reject that lifecycle command
//! - `error_after=N`: emit a recoverable engine error after N frames
//!
//! Example: `stub://front_door?frames=120&fps=60`

use anyhow::{anyhow, bail, Result};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::{DetectionEngine, EngineEvent, EngineSettings};
use crate::detect::RawDetection;
use crate::frame::FrameBatch;
use crate::region::BoundingBox;

pub const STUB_SCHEME: &str = "stub://";

const DEFAULT_FPS: u32 = 30;
const WALK_FRAMES: u64 = 60;

#[derive(Clone, Debug, Default, PartialEq)]
struct StubOptions {
    frames: Option<u64>,
    fps: Option<u32>,
    fail: Option<String>,
    error_after: Option<u64>,
}

impl StubOptions {
    fn parse(source: &str) -> Result<Self> {
        let rest = source
            .strip_prefix(STUB_SCHEME)
            .ok_or_else(|| anyhow!("not a stub source: {}", source))?;
        let mut options = Self::default();
        let Some(query) = rest.split('?').nth(1) else {
            return Ok(options);
        };
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("stub option '{}' has no value", pair))?;
            match key {
                "frames" => options.frames = Some(parse_number(key, value)?),
                "fps" => {
                    let fps: u32 = parse_number(key, value)?;
                    if fps == 0 {
                        bail!("stub option fps must be >= 1");
                    }
                    options.fps = Some(fps);
                }
                "fail" => options.fail = Some(value.to_string()),
                "error_after" => options.error_after = Some(parse_number(key, value)?),
                _ => bail!("unknown stub option '{}'", key),
            }
        }
        Ok(options)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("stub option {} must be a number, got '{}'", key, value))
}

/// Engine producing scripted detections without any media stack.
pub struct SyntheticEngine {
    options: StubOptions,
    dimensions: (u32, u32),
    built: bool,
    playing: bool,
    frame_count: u64,
    next_frame_at: Option<Instant>,
    pending: VecDeque<EngineEvent>,
    eos_sent: bool,
    error_sent: bool,
}

impl SyntheticEngine {
    pub fn new() -> Self {
        Self {
            options: StubOptions::default(),
            dimensions: (640, 640),
            built: false,
            playing: false,
            frame_count: 0,
            next_frame_at: None,
            pending: VecDeque::new(),
            eos_sent: false,
            error_sent: false,
        }
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frame_count
    }

    fn frame_period(&self) -> Duration {
        Duration::from_secs(1) / self.options.fps.unwrap_or(DEFAULT_FPS)
    }

    fn scene(&self, frame: u64) -> Vec<RawDetection> {
        let step = (frame % WALK_FRAMES) as f64 / WALK_FRAMES as f64;
        let walker_x = step * 0.9;
        let mut detections = vec![
            RawDetection::with_id(0, 0.87, BoundingBox::new(walker_x, 0.4, walker_x + 0.1, 0.7)),
            RawDetection::with_id(2, 0.93, BoundingBox::new(0.85, 0.85, 0.98, 0.98)),
            RawDetection::with_id(16, 0.55, BoundingBox::new(0.45, 0.02, 0.55, 0.1)),
        ];
        if frame % 4 == 0 {
            detections.push(RawDetection::with_label(
                "truck",
                0.76,
                BoundingBox::new(0.4, 0.3, 0.6, 0.5),
            ));
        }
        detections
    }

    fn emit_frame(&mut self, captured_at: Instant) -> EngineEvent {
        let detections = self.scene(self.frame_count);
        self.frame_count += 1;
        let (width, height) = self.dimensions;
        EngineEvent::Frame(
            FrameBatch::new(detections)
                .with_dimensions(width, height)
                .with_captured_at(captured_at),
        )
    }

    fn exhausted(&self) -> bool {
        self.options
            .frames
            .is_some_and(|limit| self.frame_count >= limit)
    }
}

impl Default for SyntheticEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionEngine for SyntheticEngine {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn build(&mut self, settings: &EngineSettings) -> Result<()> {
        self.options = StubOptions::parse(&settings.stream_source)?;
        if self.options.fail.as_deref() == Some("build") {
            bail!("synthetic engine refused to build pipeline");
        }
        self.dimensions = (settings.inference_width, settings.inference_height);
        self.built = true;
        log::info!(
            "synthetic engine built for {} ({}x{})",
            settings.stream_source,
            settings.inference_width,
            settings.inference_height
        );
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if !self.built {
            bail!("synthetic engine started before build");
        }
        if self.options.fail.as_deref() == Some("start") {
            bail!("synthetic engine rejected state change to playing");
        }
        self.playing = true;
        self.next_frame_at = Some(Instant::now());
        self.pending.push_back(EngineEvent::StateChanged {
            from: "null".to_string(),
            to: "playing".to_string(),
        });
        Ok(())
    }

    fn next_event(&mut self, timeout: Duration) -> Option<EngineEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        if !self.playing {
            std::thread::sleep(timeout);
            return None;
        }
        if let Some(after) = self.options.error_after {
            if !self.error_sent && self.frame_count >= after {
                self.error_sent = true;
                return Some(EngineEvent::Error {
                    message: format!("synthetic stream error after {} frames", after),
                    fatal: false,
                });
            }
        }
        if self.exhausted() {
            if self.eos_sent {
                std::thread::sleep(timeout);
                return None;
            }
            self.eos_sent = true;
            return Some(EngineEvent::EndOfStream);
        }

        let due = self.next_frame_at.unwrap_or_else(Instant::now);
        let wait = due.saturating_duration_since(Instant::now());
        if wait > timeout {
            std::thread::sleep(timeout);
            return None;
        }
        std::thread::sleep(wait);
        self.next_frame_at = Some(due + self.frame_period());
        Some(self.emit_frame(due))
    }

    fn stop(&mut self) -> Result<()> {
        if self.playing {
            self.pending.push_back(EngineEvent::StateChanged {
                from: "playing".to_string(),
                to: "null".to_string(),
            });
        }
        self.playing = false;
        log::info!("synthetic engine stopped after {} frames", self.frame_count);
        Ok(())
    }
}
