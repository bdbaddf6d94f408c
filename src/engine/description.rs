//! GStreamer pipeline description for the RTSP + Hailo inference chain.
//!
//! rtspsrc ! depay ! parse ! decode ! scale ! hailonet ! hailofilter ! hailooverlay ! fakesink
//!
//! The post-process filter is named `hailo_filter`; the GStreamer engine
//! probes its src pad for detection metadata.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

use super::EngineSettings;

/// Element name of the post-process filter.
pub const POSTPROCESS_ELEMENT: &str = "hailo_filter";

/// Install locations tried when the configured library path does not exist.
pub const POSTPROCESS_SEARCH_PATHS: [&str; 2] = [
    "/usr/local/hailo/resources/so/libyolo_hailortpp_postprocess.so",
    "/usr/lib/aarch64-linux-gnu/hailo/tappas/post_processes/libyolo_hailortpp_postprocess.so",
];

/// Resolve the YOLO post-process library.
pub fn find_postprocess_library(configured: &Path) -> Result<PathBuf> {
    let candidates: Vec<&Path> = POSTPROCESS_SEARCH_PATHS.iter().map(Path::new).collect();
    find_postprocess_library_in(configured, &candidates)
}

/// Resolve against an explicit candidate list; the configured path wins.
pub fn find_postprocess_library_in(configured: &Path, candidates: &[&Path]) -> Result<PathBuf> {
    if !configured.as_os_str().is_empty() && configured.exists() {
        return Ok(configured.to_path_buf());
    }
    for candidate in candidates {
        if candidate.exists() {
            log::info!("found post-process library: {}", candidate.display());
            return Ok(candidate.to_path_buf());
        }
    }
    Err(anyhow!(
        "post-process library not found (configured: {})",
        configured.display()
    ))
}

/// Build the launch description for the configured stream.
///
/// `postprocess_library` must already be resolved.
pub fn pipeline_description(settings: &EngineSettings, postprocess_library: &Path) -> String {
    const QUEUE: &str = "queue max-size-buffers=3 max-size-bytes=0 max-size-time=0";

    let source = format!(
        "rtspsrc location=\"{url}\" latency={latency} protocols=tcp ! \
         queue max-size-buffers=3 leaky=downstream ! \
         rtph264depay ! h264parse ! avdec_h264 threads=2 ! videoconvert ! ",
        url = settings.stream_source,
        latency = settings.source_latency_ms,
    );

    let resize = format!(
        "videoscale ! video/x-raw,width={w},height={h},format=RGB,pixel-aspect-ratio=1/1 ! ",
        w = settings.inference_width,
        h = settings.inference_height,
    );

    let inference = format!(
        "{QUEUE} ! hailonet hef-path=\"{hef}\" batch-size={batch} \
         nms-score-threshold={score} nms-iou-threshold={iou} \
         output-format-type=HAILO_FORMAT_TYPE_FLOAT32 ! \
         {QUEUE} ! hailofilter so-path={so} qos=false name={filter} ! \
         {QUEUE} ! hailooverlay ! videoconvert ! ",
        hef = settings.model_path.display(),
        batch = settings.batch_size,
        score = settings.nms_score_threshold,
        iou = settings.nms_iou_threshold,
        so = postprocess_library.display(),
        filter = POSTPROCESS_ELEMENT,
    );

    format!("{source}{resize}{inference}fakesink sync=false")
}
