//! Point-in-time status reports for the status endpoint.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::config::CounterConfig;
use crate::region::RegionSpec;
use crate::stats::{AggregatedStats, StatsAggregator};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfigSummary {
    pub rtsp_url: String,
    pub roi: RegionSpec,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub status: &'static str,
    /// Seconds since the provider was created.
    pub uptime: f64,
    pub config: ConfigSummary,
    pub performance: AggregatedStats,
    pub timestamp: String,
}

/// Read-only view over the aggregator and the startup configuration.
///
/// Cloning is cheap; every clone reads the same aggregator.
#[derive(Clone, Debug)]
pub struct StatusProvider {
    stats: Arc<StatsAggregator>,
    summary: Arc<ConfigSummary>,
    started: Instant,
}

impl StatusProvider {
    pub fn new(config: &CounterConfig, stats: Arc<StatsAggregator>) -> Self {
        Self::with_start(config, stats, Instant::now())
    }

    pub fn with_start(config: &CounterConfig, stats: Arc<StatsAggregator>, started: Instant) -> Self {
        let summary = ConfigSummary {
            rtsp_url: config.stream_source.clone(),
            roi: RegionSpec::from(&config.region),
        };
        Self {
            stats,
            summary: Arc::new(summary),
            started,
        }
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn get_status(&self) -> StatusReport {
        StatusReport {
            status: "running",
            uptime: self.uptime_secs(),
            config: (*self.summary).clone(),
            performance: self.stats.snapshot(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }
}
