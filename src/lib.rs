//! ROI Counter
//!
//! Counts persons and vehicles whose detection boxes overlap a configured
//! rectangular region of interest, frame by frame, on a live video stream.
//!
//! # Architecture
//!
//! An external detection engine delivers per-frame detection batches. The
//! counting core scores each batch independently:
//!
//! 1. **Classify**: class ids (COCO) or labels map to person / vehicle / other.
//! 2. **Overlap**: boxes are scaled to pixels and tested against the region
//!    with an inclusive edge test.
//! 3. **Record**: per-frame counts and frame intervals land in a bounded
//!    rolling window shared with the status endpoint.
//!
//! A lifecycle controller drives the engine through build, start, run and
//! teardown, and maps the outcome to a process exit code.
//!
//! # Module Structure
//!
//! - `region`: region of interest and the overlap predicate
//! - `detect`: raw detections and the class mapping
//! - `stats`: rolling statistics window
//! - `frame`: per-frame evaluation
//! - `lifecycle`: pipeline state machine and run loop
//! - `engine`: detection engine boundary (`stub://` synthetic, GStreamer)
//! - `status`, `api`: status snapshots and the HTTP endpoint
//! - `config`, `logging`: process setup

pub mod api;
pub mod config;
pub mod detect;
pub mod engine;
pub mod frame;
pub mod lifecycle;
pub mod logging;
pub mod region;
pub mod stats;
pub mod status;

pub use api::{StatusHandle, StatusServer, StatusServerConfig};
pub use config::CounterConfig;
pub use detect::{ClassCategory, ClassKey, Detection, RawDetection};
pub use engine::{engine_for_source, DetectionEngine, EngineCounters, EngineEvent, EngineSettings};
pub use frame::{FrameBatch, FrameEvaluator, FrameOutcome, RoiCounts};
pub use lifecycle::{LifecycleController, LifecycleEvent, PipelineState, StopSignal};
pub use region::{BoundingBox, PixelRect, Region, RegionSpec};
pub use stats::{AggregatedStats, FrameSample, StatsAggregator};
pub use status::{StatusProvider, StatusReport};
