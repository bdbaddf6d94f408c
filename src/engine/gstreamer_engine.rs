//! GStreamer detection engine.
//!
//! Builds the RTSP + inference pipeline from its launch description, probes
//! the post-process filter's src pad for detection metadata, and translates
//! bus messages into `EngineEvent`s.
//!
//! Detections are read from `GstVideoRegionOfInterestMeta` entries on each
//! buffer: the ROI type is the class label, the rect is in pixels, and an
//! optional param structure may carry `class_id` and `confidence`.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use gstreamer_video::VideoRegionOfInterestMeta;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::description::{find_postprocess_library, pipeline_description, POSTPROCESS_ELEMENT};
use super::metadata::{MetadataWatch, METADATA_CHECK_FRAMES};
use super::{DetectionEngine, EngineCounters, EngineEvent, EngineSettings};
use crate::detect::{ClassKey, RawDetection};
use crate::frame::FrameBatch;
use crate::region::BoundingBox;

const STOP_TIMEOUT_SECS: u64 = 5;

/// Batches buffered between the streaming thread and the controller.
/// Newer frames are dropped while the queue is full.
const FRAME_QUEUE_DEPTH: usize = 4;

pub struct GstreamerEngine {
    pipeline: Option<gstreamer::Pipeline>,
    frames: Option<Receiver<FrameBatch>>,
    dropped_frames: Arc<AtomicU64>,
    metadata: Arc<Mutex<MetadataWatch>>,
}

impl GstreamerEngine {
    pub fn new() -> Self {
        Self {
            pipeline: None,
            frames: None,
            dropped_frames: Arc::new(AtomicU64::new(0)),
            metadata: Arc::new(Mutex::new(MetadataWatch::new())),
        }
    }

    fn pipeline(&self) -> Result<&gstreamer::Pipeline> {
        self.pipeline
            .as_ref()
            .ok_or_else(|| anyhow!("detection pipeline has not been built"))
    }

    fn poll_bus(&self) -> Option<EngineEvent> {
        let pipeline = self.pipeline.as_ref()?;
        let bus = pipeline.bus()?;
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Eos(..) => return Some(EngineEvent::EndOfStream),
                MessageView::Error(err) => {
                    log::debug!("pipeline error debug info: {:?}", err.debug());
                    return Some(EngineEvent::Error {
                        message: format!(
                            "{} (from {:?})",
                            err.error(),
                            err.src().map(|s| s.path_string())
                        ),
                        fatal: err.error().is::<gstreamer::CoreError>(),
                    });
                }
                MessageView::Warning(warning) => {
                    log::debug!("pipeline warning debug info: {:?}", warning.debug());
                    return Some(EngineEvent::Warning(warning.error().to_string()));
                }
                MessageView::StateChanged(change) => {
                    let from_pipeline = change
                        .src()
                        .is_some_and(|src| src == pipeline.upcast_ref::<gstreamer::Object>());
                    if from_pipeline {
                        return Some(EngineEvent::StateChanged {
                            from: format!("{:?}", change.old()),
                            to: format!("{:?}", change.current()),
                        });
                    }
                }
                _ => {}
            }
        }
        None
    }
}

impl Default for GstreamerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionEngine for GstreamerEngine {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn build(&mut self, settings: &EngineSettings) -> Result<()> {
        gstreamer::init().context("initialize gstreamer")?;

        let library = find_postprocess_library(&settings.postprocess_library_path)?;
        let description = pipeline_description(settings, &library);
        log::debug!("pipeline: {}", description);

        let pipeline = gstreamer::parse::launch(&description)
            .context("create detection pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("detection pipeline is not a Pipeline"))?;

        let (tx, rx) = mpsc::sync_channel(FRAME_QUEUE_DEPTH);
        let dropped_frames = self.dropped_frames.clone();
        let metadata = self.metadata.clone();
        match pipeline
            .by_name(POSTPROCESS_ELEMENT)
            .and_then(|filter| filter.static_pad("src"))
        {
            Some(pad) => {
                pad.add_probe(gstreamer::PadProbeType::BUFFER, move |pad, info| {
                    if let Some(gstreamer::PadProbeData::Buffer(ref buffer)) = info.data {
                        let dimensions = pad.current_caps().and_then(|caps| caps_dimensions(&caps));
                        let (batch, entries) = read_detections(buffer, dimensions);
                        let mut watch = metadata.lock().unwrap_or_else(PoisonError::into_inner);
                        if watch.observe(entries) {
                            log::error!(
                                "no detection metadata on the first {} frames from {}; \
                                 post-process output is unreadable, counts will stay at zero",
                                METADATA_CHECK_FRAMES,
                                POSTPROCESS_ELEMENT
                            );
                        }
                        drop(watch);
                        match tx.try_send(batch) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                dropped_frames.fetch_add(1, Ordering::Relaxed);
                            }
                            // The receiver is gone once the engine is dropped.
                            Err(TrySendError::Disconnected(_)) => {}
                        }
                    }
                    gstreamer::PadProbeReturn::Ok
                });
                log::info!("added buffer probe to {} output", POSTPROCESS_ELEMENT);
            }
            None => log::warn!(
                "could not find {} src pad; detections will not be counted",
                POSTPROCESS_ELEMENT
            ),
        }

        log::info!("pipeline built successfully");
        self.pipeline = Some(pipeline);
        self.frames = Some(rx);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.pipeline()?
            .set_state(gstreamer::State::Playing)
            .context("unable to set pipeline to Playing")?;
        Ok(())
    }

    fn next_event(&mut self, timeout: Duration) -> Option<EngineEvent> {
        if let Some(event) = self.poll_bus() {
            return Some(event);
        }
        let Some(frames) = self.frames.as_ref() else {
            std::thread::sleep(timeout);
            return None;
        };
        match frames.recv_timeout(timeout) {
            Ok(batch) => Some(EngineEvent::Frame(batch)),
            Err(RecvTimeoutError::Timeout) => self.poll_bus(),
            Err(RecvTimeoutError::Disconnected) => Some(EngineEvent::Error {
                message: "detection probe disconnected".to_string(),
                fatal: true,
            }),
        }
    }

    fn stop(&mut self) -> Result<()> {
        let pipeline = self.pipeline()?;
        pipeline
            .set_state(gstreamer::State::Null)
            .context("set pipeline to Null")?;
        let (result, state, _pending) =
            pipeline.state(gstreamer::ClockTime::from_seconds(STOP_TIMEOUT_SECS));
        result.context("wait for pipeline to reach Null")?;
        if state != gstreamer::State::Null {
            return Err(anyhow!("pipeline stuck in {:?} after stop", state));
        }
        log::info!("pipeline stopped");
        Ok(())
    }

    fn counters(&self) -> EngineCounters {
        let watch = *self.metadata.lock().unwrap_or_else(PoisonError::into_inner);
        EngineCounters {
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            frames_without_metadata: watch.frames_without_metadata(),
            metadata_unreadable: watch.is_unreadable(),
        }
    }
}

fn caps_dimensions(caps: &gstreamer::Caps) -> Option<(u32, u32)> {
    let info = gstreamer_video::VideoInfo::from_caps(caps).ok()?;
    Some((info.width(), info.height()))
}

/// Read one buffer's ROI metadata. Also returns the number of entries found.
fn read_detections(
    buffer: &gstreamer::BufferRef,
    dimensions: Option<(u32, u32)>,
) -> (FrameBatch, usize) {
    let entries = buffer.iter_meta::<VideoRegionOfInterestMeta>().count();
    let Some((width, height)) = dimensions.filter(|(w, h)| *w > 0 && *h > 0) else {
        let batch = FrameBatch::failed(anyhow!("buffer caps carry no frame dimensions"));
        return (batch, entries);
    };
    let detections = buffer
        .iter_meta::<VideoRegionOfInterestMeta>()
        .map(|meta| roi_to_detection(&meta, width, height))
        .collect();
    (FrameBatch::new(detections).with_dimensions(width, height), entries)
}

fn roi_to_detection(meta: &VideoRegionOfInterestMeta, width: u32, height: u32) -> RawDetection {
    let (x, y, w, h) = meta.rect();
    let (fw, fh) = (f64::from(width), f64::from(height));
    let (x, y, w, h) = (f64::from(x), f64::from(y), f64::from(w), f64::from(h));
    let bbox = BoundingBox::new(x / fw, y / fh, (x + w) / fw, (y + h) / fh);

    let mut class_id = None;
    let mut confidence = 0.0;
    for param in meta.params() {
        if let Some(id) = structure_int(param, "class_id") {
            class_id = Some(id);
        }
        if let Some(value) = structure_float(param, "confidence") {
            confidence = value;
        }
    }

    let label = meta.roi_type().trim();
    let key = match (class_id, label.is_empty()) {
        (Some(id), false) => ClassKey::IdAndLabel(id, label.to_string()),
        (Some(id), true) => ClassKey::Id(id),
        (None, false) => ClassKey::Label(label.to_string()),
        (None, true) => ClassKey::Missing,
    };
    RawDetection::new(key, confidence, bbox)
}

fn structure_int(structure: &gstreamer::StructureRef, field: &str) -> Option<i64> {
    structure
        .get::<i32>(field)
        .map(i64::from)
        .or_else(|_| structure.get::<u32>(field).map(i64::from))
        .or_else(|_| structure.get::<i64>(field))
        .ok()
}

fn structure_float(structure: &gstreamer::StructureRef, field: &str) -> Option<f64> {
    structure
        .get::<f64>(field)
        .or_else(|_| structure.get::<f32>(field).map(f64::from))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{classify, ClassCategory};

    fn buffer_with_rois(rois: &[(&str, (u32, u32, u32, u32))]) -> Result<gstreamer::Buffer> {
        gstreamer::init()?;
        let mut buffer = gstreamer::Buffer::new();
        {
            let buffer = buffer
                .get_mut()
                .ok_or_else(|| anyhow!("fresh buffer is not writable"))?;
            for (label, rect) in rois {
                let mut meta = VideoRegionOfInterestMeta::add(buffer, label, *rect);
                meta.add_param(
                    gstreamer::Structure::builder("detection")
                        .field("class_id", 0i32)
                        .field("confidence", 0.8f64)
                        .build(),
                );
            }
        }
        Ok(buffer)
    }

    #[test]
    fn buffer_without_metadata_is_an_empty_frame() -> Result<()> {
        let buffer = buffer_with_rois(&[])?;
        let (batch, entries) = read_detections(&buffer, Some((640, 480)));
        assert_eq!(entries, 0);
        assert!(batch.detections?.is_empty());
        Ok(())
    }

    #[test]
    fn metadata_free_stream_is_flagged_unreadable() -> Result<()> {
        let buffer = buffer_with_rois(&[])?;
        let mut watch = MetadataWatch::new();
        let flagged = (0..METADATA_CHECK_FRAMES)
            .map(|_| watch.observe(read_detections(&buffer, Some((640, 480))).1))
            .filter(|flag| *flag)
            .count();
        assert_eq!(flagged, 1);
        assert!(watch.is_unreadable());
        Ok(())
    }

    #[test]
    fn roi_meta_becomes_normalized_detection() -> Result<()> {
        let buffer = buffer_with_rois(&[("person", (64, 48, 128, 96))])?;
        let (batch, entries) = read_detections(&buffer, Some((640, 480)));
        assert_eq!(entries, 1);
        let detections = batch.detections?;
        assert_eq!(detections.len(), 1);
        let bbox = detections[0].bbox;
        assert!((bbox.xmin - 0.1).abs() < 1e-9);
        assert!((bbox.ymin - 0.1).abs() < 1e-9);
        assert!((bbox.xmax - 0.3).abs() < 1e-9);
        assert!((bbox.ymax - 0.3).abs() < 1e-9);
        assert!((detections[0].confidence - 0.8).abs() < 1e-9);
        assert_eq!(classify(&detections[0]), Some(ClassCategory::Person));
        Ok(())
    }

    #[test]
    fn oversized_rect_does_not_overflow() -> Result<()> {
        let buffer = buffer_with_rois(&[("car", (u32::MAX - 5, u32::MAX - 5, 100, 100))])?;
        let (batch, _) = read_detections(&buffer, Some((640, 480)));
        let detections = batch.detections?;
        assert!(detections[0].bbox.is_finite());
        assert!(detections[0].bbox.xmax > detections[0].bbox.xmin);
        Ok(())
    }

    #[test]
    fn missing_caps_fail_the_frame() -> Result<()> {
        let buffer = buffer_with_rois(&[("person", (0, 0, 10, 10))])?;
        let (batch, entries) = read_detections(&buffer, None);
        assert_eq!(entries, 1);
        assert!(batch.detections.is_err());
        Ok(())
    }
}
