use anyhow::{anyhow, bail, Context, Result};
use log::LevelFilter;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::region::{Region, RegionSpec};
use crate::stats::DEFAULT_WINDOW_SIZE;

const DEFAULT_INFERENCE_WIDTH: u32 = 640;
const DEFAULT_INFERENCE_HEIGHT: u32 = 640;
const DEFAULT_BATCH_SIZE: u32 = 1;
const DEFAULT_NMS_SCORE_THRESHOLD: f64 = 0.3;
const DEFAULT_NMS_IOU_THRESHOLD: f64 = 0.45;
const DEFAULT_SOURCE_LATENCY_MS: u32 = 200;
const DEFAULT_STATUS_BIND: &str = "0.0.0.0";
const DEFAULT_STATUS_PORT: u16 = 8080;
const DEFAULT_LOG_INTERVAL_SECS: u64 = 10;
const DEFAULT_LOG_LEVEL: &str = "INFO";
pub const DEFAULT_LOG_FILE: &str = "/var/log/roi_counter.log";

#[derive(Debug, Deserialize, Default)]
struct CounterConfigFile {
    #[serde(alias = "stream_source")]
    rtsp_url: Option<String>,
    roi: Option<RegionSpec>,
    #[serde(alias = "model_path")]
    hef_path: Option<PathBuf>,
    #[serde(alias = "postprocess_library_path")]
    postprocess_so: Option<PathBuf>,
    inference_width: Option<u32>,
    inference_height: Option<u32>,
    batch_size: Option<u32>,
    nms_score_threshold: Option<f64>,
    nms_iou_threshold: Option<f64>,
    #[serde(alias = "source_latency_ms")]
    rtsp_latency: Option<u32>,
    #[serde(alias = "enable_status_server")]
    enable_http_status: Option<bool>,
    status_bind: Option<String>,
    status_port: Option<u16>,
    #[serde(alias = "log_interval_seconds")]
    log_interval: Option<u64>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    window_size: Option<usize>,
}

/// Validated process configuration. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct CounterConfig {
    pub stream_source: String,
    pub region: Region,
    pub model_path: PathBuf,
    pub postprocess_library_path: PathBuf,
    pub inference_width: u32,
    pub inference_height: u32,
    pub batch_size: u32,
    pub nms_score_threshold: f64,
    pub nms_iou_threshold: f64,
    pub source_latency_ms: u32,
    pub enable_status_server: bool,
    pub status_bind: String,
    pub status_port: u16,
    pub log_interval: Duration,
    pub log_level: LevelFilter,
    /// `None` logs to stdout only.
    pub log_file: Option<PathBuf>,
    pub window_size: usize,
}

impl CounterConfig {
    /// Load from a JSON (or `.toml`) file, then apply `ROI_COUNTER_*` overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let file_cfg = read_config_file(path)?;
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a JSON document without touching the environment.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let file_cfg: CounterConfigFile =
            serde_json::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))?;
        let cfg = Self::from_file(file_cfg)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CounterConfigFile) -> Result<Self> {
        let stream_source = file.rtsp_url.ok_or_else(|| missing("rtsp_url"))?;
        let region_spec = file.roi.ok_or_else(|| missing("roi"))?;
        let model_path = file.hef_path.ok_or_else(|| missing("hef_path"))?;
        let postprocess_library_path = file
            .postprocess_so
            .ok_or_else(|| missing("postprocess_so"))?;

        let region = Region::try_from(region_spec).context("invalid roi")?;
        let log_level = parse_log_level(file.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL))?;
        let log_file = match file.log_file {
            Some(path) if path.as_os_str().is_empty() => None,
            Some(path) => Some(path),
            None => Some(PathBuf::from(DEFAULT_LOG_FILE)),
        };

        Ok(Self {
            stream_source,
            region,
            model_path,
            postprocess_library_path,
            inference_width: file.inference_width.unwrap_or(DEFAULT_INFERENCE_WIDTH),
            inference_height: file.inference_height.unwrap_or(DEFAULT_INFERENCE_HEIGHT),
            batch_size: file.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            nms_score_threshold: file
                .nms_score_threshold
                .unwrap_or(DEFAULT_NMS_SCORE_THRESHOLD),
            nms_iou_threshold: file.nms_iou_threshold.unwrap_or(DEFAULT_NMS_IOU_THRESHOLD),
            source_latency_ms: file.rtsp_latency.unwrap_or(DEFAULT_SOURCE_LATENCY_MS),
            enable_status_server: file.enable_http_status.unwrap_or(true),
            status_bind: file
                .status_bind
                .unwrap_or_else(|| DEFAULT_STATUS_BIND.to_string()),
            status_port: file.status_port.unwrap_or(DEFAULT_STATUS_PORT),
            log_interval: Duration::from_secs(
                file.log_interval.unwrap_or(DEFAULT_LOG_INTERVAL_SECS),
            ),
            log_level,
            log_file,
            window_size: file.window_size.unwrap_or(DEFAULT_WINDOW_SIZE),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("ROI_COUNTER_RTSP_URL") {
            if !url.trim().is_empty() {
                self.stream_source = url;
            }
        }
        if let Ok(port) = std::env::var("ROI_COUNTER_STATUS_PORT") {
            if !port.trim().is_empty() {
                self.status_port = port
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("ROI_COUNTER_STATUS_PORT must be a port number"))?;
            }
        }
        if let Ok(level) = std::env::var("ROI_COUNTER_LOG_LEVEL") {
            if !level.trim().is_empty() {
                self.log_level = parse_log_level(&level)?;
            }
        }
        if let Ok(path) = std::env::var("ROI_COUNTER_LOG_FILE") {
            if !path.trim().is_empty() {
                self.log_file = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.stream_source.trim().is_empty() {
            bail!("rtsp_url must not be empty");
        }
        if self.inference_width == 0 || self.inference_height == 0 {
            bail!("inference_width and inference_height must be greater than zero");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be greater than zero");
        }
        for (name, value) in [
            ("nms_score_threshold", self.nms_score_threshold),
            ("nms_iou_threshold", self.nms_iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{} must be within [0, 1], got {}", name, value);
            }
        }
        if self.log_interval.is_zero() {
            bail!("log_interval must be greater than zero");
        }
        if self.window_size == 0 {
            bail!("window_size must be greater than zero");
        }
        Ok(())
    }
}

fn missing(field: &str) -> anyhow::Error {
    anyhow!("Missing required config field: {}", field)
}

fn read_config_file(path: &Path) -> Result<CounterConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

/// Accepts the usual level names, case-insensitive.
pub fn parse_log_level(value: &str) -> Result<LevelFilter> {
    match value.trim().to_ascii_uppercase().as_str() {
        "TRACE" => Ok(LevelFilter::Trace),
        "DEBUG" => Ok(LevelFilter::Debug),
        "INFO" => Ok(LevelFilter::Info),
        "WARN" | "WARNING" => Ok(LevelFilter::Warn),
        "ERROR" | "CRITICAL" => Ok(LevelFilter::Error),
        "OFF" => Ok(LevelFilter::Off),
        other => Err(anyhow!("unknown log_level '{}'", other)),
    }
}

/// Example configuration printed by `roi_counter --print-example`.
pub fn example_config() -> serde_json::Value {
    serde_json::json!({
        "rtsp_url": "rtsp://192.168.1.100:8554/stream",
        "hef_path": "/path/to/yolov6n.hef",
        "postprocess_so": "/path/to/libyolo_hailortpp_postprocess.so",
        "roi": {
            "x1": 0.2,
            "y1": 0.2,
            "x2": 0.8,
            "y2": 0.8,
            "name": "entrance"
        },
        "inference_width": DEFAULT_INFERENCE_WIDTH,
        "inference_height": DEFAULT_INFERENCE_HEIGHT,
        "batch_size": DEFAULT_BATCH_SIZE,
        "nms_score_threshold": DEFAULT_NMS_SCORE_THRESHOLD,
        "nms_iou_threshold": DEFAULT_NMS_IOU_THRESHOLD,
        "rtsp_latency": DEFAULT_SOURCE_LATENCY_MS,
        "enable_http_status": true,
        "status_port": DEFAULT_STATUS_PORT,
        "log_file": DEFAULT_LOG_FILE,
        "log_level": DEFAULT_LOG_LEVEL,
        "log_interval": DEFAULT_LOG_INTERVAL_SECS
    })
}
