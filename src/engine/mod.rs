//! Inference engine boundary.
//!
//! The engine owns stream acquisition, decoding, inference and NMS. The
//! counter only sees what crosses this boundary:
//! - lifecycle commands (`build`, `start`, `stop`)
//! - per-frame detection batches
//! - asynchronous notifications (EOS, errors, warnings, state changes)
//!
//! Engines:
//! - `stub://` sources: deterministic synthetic detections (testing, demos)
//! - everything else: GStreamer pipeline (feature: engine-gstreamer)

pub mod description;
#[cfg(feature = "engine-gstreamer")]
mod gstreamer_engine;
pub mod metadata;
pub mod synthetic;

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::CounterConfig;
use crate::frame::FrameBatch;

#[cfg(feature = "engine-gstreamer")]
pub use gstreamer_engine::GstreamerEngine;
pub use description::{find_postprocess_library, pipeline_description, POSTPROCESS_SEARCH_PATHS};
pub use metadata::{MetadataWatch, METADATA_CHECK_FRAMES};
pub use synthetic::SyntheticEngine;

/// Everything an engine needs to construct its pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    pub stream_source: String,
    pub model_path: PathBuf,
    pub postprocess_library_path: PathBuf,
    pub inference_width: u32,
    pub inference_height: u32,
    pub batch_size: u32,
    pub nms_score_threshold: f64,
    pub nms_iou_threshold: f64,
    pub source_latency_ms: u32,
}

impl EngineSettings {
    pub fn from_config(config: &CounterConfig) -> Self {
        Self {
            stream_source: config.stream_source.clone(),
            model_path: config.model_path.clone(),
            postprocess_library_path: config.postprocess_library_path.clone(),
            inference_width: config.inference_width,
            inference_height: config.inference_height,
            batch_size: config.batch_size,
            nms_score_threshold: config.nms_score_threshold,
            nms_iou_threshold: config.nms_iou_threshold,
            source_latency_ms: config.source_latency_ms,
        }
    }
}

/// Output of the engine, in arrival order.
#[derive(Debug)]
pub enum EngineEvent {
    Frame(FrameBatch),
    EndOfStream,
    /// `fatal` errors skip the orderly drain.
    Error {
        message: String,
        fatal: bool,
    },
    Warning(String),
    StateChanged {
        from: String,
        to: String,
    },
}

/// Engine-side health counters, reported when the run ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineCounters {
    /// Frames discarded because the frame queue was full.
    pub dropped_frames: u64,
    /// Frames that carried no detection metadata at all.
    pub frames_without_metadata: u64,
    /// None of the first frames carried detection metadata, and none since.
    pub metadata_unreadable: bool,
}

/// External detection pipeline driven by the lifecycle controller.
pub trait DetectionEngine: Send {
    /// Engine identifier.
    fn name(&self) -> &'static str;

    /// Construct the processing pipeline. Must not start streaming.
    fn build(&mut self, settings: &EngineSettings) -> Result<()>;

    /// Begin streaming. Errors mean the engine rejected the start.
    fn start(&mut self) -> Result<()>;

    /// Wait up to `timeout` for the next event.
    ///
    /// `None` means nothing arrived in time; the caller polls again.
    fn next_event(&mut self, timeout: Duration) -> Option<EngineEvent>;

    /// Stop streaming and block until the engine reports an idle state.
    fn stop(&mut self) -> Result<()>;

    fn counters(&self) -> EngineCounters {
        EngineCounters::default()
    }
}

/// Pick the engine for a stream source.
pub fn engine_for_source(stream_source: &str) -> Result<Box<dyn DetectionEngine>> {
    if stream_source.starts_with(synthetic::STUB_SCHEME) {
        return Ok(Box::new(SyntheticEngine::new()));
    }
    #[cfg(feature = "engine-gstreamer")]
    {
        Ok(Box::new(GstreamerEngine::new()))
    }
    #[cfg(not(feature = "engine-gstreamer"))]
    {
        anyhow::bail!(
            "stream source '{}' requires the engine-gstreamer feature",
            stream_source
        )
    }
}

impl<E: DetectionEngine + ?Sized> DetectionEngine for Box<E> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn build(&mut self, settings: &EngineSettings) -> Result<()> {
        (**self).build(settings)
    }

    fn start(&mut self) -> Result<()> {
        (**self).start()
    }

    fn next_event(&mut self, timeout: Duration) -> Option<EngineEvent> {
        (**self).next_event(timeout)
    }

    fn stop(&mut self) -> Result<()> {
        (**self).stop()
    }

    fn counters(&self) -> EngineCounters {
        (**self).counters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_sources_get_the_synthetic_engine() -> Result<()> {
        let engine = engine_for_source("stub://front_door")?;
        assert_eq!(engine.name(), "synthetic");
        Ok(())
    }

    #[cfg(not(feature = "engine-gstreamer"))]
    #[test]
    fn real_sources_need_the_gstreamer_feature() {
        let err = engine_for_source("rtsp://camera/stream").err().expect("error");
        assert!(err.to_string().contains("engine-gstreamer"));
    }
}
