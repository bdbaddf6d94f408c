//! Pipeline lifecycle.
//!
//! The lifecycle is a finite-state machine with one transition function,
//! `next_state`. `LifecycleController` drives a `DetectionEngine` through it:
//!
//! ```text
//! Idle -> Building -> Running -> Draining -> Stopped
//!            |           |           |
//!            +-----------+-----------+----> Failed
//! ```
//!
//! `Stopped` exits 0, `Failed` exits 1. Both are terminal.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::CounterConfig;
use crate::engine::{DetectionEngine, EngineEvent, EngineSettings};
use crate::frame::{FrameEvaluator, RoiCounts};
use crate::stats::StatsAggregator;

/// How long one engine poll may block; bounds stop-request latency.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum PipelineState {
    Idle,
    Building,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Failed)
    }

    /// Process exit code for terminal states.
    pub fn exit_code(self) -> Option<i32> {
        match self {
            PipelineState::Stopped => Some(0),
            PipelineState::Failed => Some(1),
            _ => None,
        }
    }
}

/// Inputs to the state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    Start,
    Built,
    BuildFailed(String),
    Started,
    StartFailed(String),
    EndOfStream,
    StopRequested,
    EngineError { message: String, fatal: bool },
    EngineWarning(String),
    /// The engine confirmed it reached its idle/null state.
    EngineIdle,
    StopFailed(String),
}

/// The single transition function. Unlisted pairs leave the state unchanged.
pub fn next_state(state: PipelineState, event: &LifecycleEvent) -> PipelineState {
    use LifecycleEvent as Ev;
    use PipelineState as St;

    if state.is_terminal() {
        return state;
    }
    match (state, event) {
        (_, Ev::BuildFailed(_)) | (_, Ev::StartFailed(_)) | (_, Ev::StopFailed(_)) => St::Failed,
        (_, Ev::EngineError { fatal: true, .. }) => St::Failed,

        (St::Idle, Ev::Start) => St::Building,
        (St::Idle, Ev::StopRequested) => St::Stopped,

        (St::Building, Ev::Built) => St::Building,
        (St::Building, Ev::Started) => St::Running,
        (St::Building, Ev::StopRequested) => St::Draining,

        (St::Running, Ev::EndOfStream) => St::Draining,
        (St::Running, Ev::StopRequested) => St::Draining,
        (St::Running, Ev::EngineError { fatal: false, .. }) => St::Draining,
        (St::Running, Ev::EngineWarning(_)) => St::Running,

        (St::Draining, Ev::EngineIdle) => St::Stopped,

        (state, _) => state,
    }
}

/// Operator stop request, shared with signal handlers.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    requested: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Drives an engine from construction to a terminal state.
pub struct LifecycleController<E: DetectionEngine> {
    engine: E,
    settings: EngineSettings,
    evaluator: FrameEvaluator,
    stats: Arc<StatsAggregator>,
    stop: StopSignal,
    state: PipelineState,
    transitions: Vec<(PipelineState, PipelineState)>,
    failure: Option<String>,
    engine_started: bool,
    log_interval: Duration,
    poll_interval: Duration,
    last_summary: Instant,
    last_counts: RoiCounts,
}

impl<E: DetectionEngine> LifecycleController<E> {
    pub fn new(
        engine: E,
        config: &CounterConfig,
        stats: Arc<StatsAggregator>,
        stop: StopSignal,
    ) -> Self {
        let evaluator = FrameEvaluator::new(
            Arc::new(config.region.clone()),
            stats.clone(),
            config.inference_width,
            config.inference_height,
        );
        Self {
            engine,
            settings: EngineSettings::from_config(config),
            evaluator,
            stats,
            stop,
            state: PipelineState::Idle,
            transitions: Vec::new(),
            failure: None,
            engine_started: false,
            log_interval: config.log_interval,
            poll_interval: DEFAULT_POLL_INTERVAL,
            last_summary: Instant::now(),
            last_counts: RoiCounts::default(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Every `(from, to)` state change so far, in order.
    pub fn transitions(&self) -> &[(PipelineState, PipelineState)] {
        &self.transitions
    }

    /// Cause of the `Failed` state, if any.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn evaluator(&self) -> &FrameEvaluator {
        &self.evaluator
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Feed one event through the state machine.
    pub fn apply(&mut self, event: LifecycleEvent) -> PipelineState {
        let next = next_state(self.state, &event);
        if next == PipelineState::Failed && self.failure.is_none() {
            self.failure = Some(failure_cause(&event));
        }
        if next != self.state {
            log::debug!("lifecycle: {:?} -> {:?} on {:?}", self.state, next, event);
            self.transitions.push((self.state, next));
            self.state = next;
        }
        next
    }

    /// Run until a terminal state and return it.
    pub fn run(&mut self) -> PipelineState {
        log::info!(
            "starting pipeline for {} using the {} engine",
            self.settings.stream_source,
            self.engine.name()
        );
        self.apply(LifecycleEvent::Start);
        self.build();
        self.start();

        while self.state == PipelineState::Running {
            self.step();
        }

        if self.state == PipelineState::Draining {
            self.drain();
        } else if self.state == PipelineState::Failed && self.engine_started {
            // Best-effort release of engine resources; the state stays Failed.
            if let Err(err) = self.engine.stop() {
                log::warn!("engine stop after failure: {:#}", err);
            }
        }

        self.finish();
        self.state
    }

    fn build(&mut self) {
        if self.state != PipelineState::Building {
            return;
        }
        match self.engine.build(&self.settings) {
            Ok(()) => self.apply(LifecycleEvent::Built),
            Err(err) => self.apply(LifecycleEvent::BuildFailed(format!("{:#}", err))),
        };
    }

    fn start(&mut self) {
        if self.state != PipelineState::Building {
            return;
        }
        if self.stop.is_requested() {
            log::info!("stop requested before start");
            self.apply(LifecycleEvent::StopRequested);
            return;
        }
        match self.engine.start() {
            Ok(()) => {
                self.engine_started = true;
                self.last_summary = Instant::now();
                log::info!("pipeline started, processing stream...");
                self.apply(LifecycleEvent::Started);
            }
            Err(err) => {
                self.apply(LifecycleEvent::StartFailed(format!("{:#}", err)));
            }
        }
    }

    /// One cycle of the steady state.
    fn step(&mut self) {
        if self.stop.is_requested() {
            log::info!("interrupted by operator");
            self.apply(LifecycleEvent::StopRequested);
            return;
        }

        match self.engine.next_event(self.poll_interval) {
            Some(EngineEvent::Frame(batch)) => {
                let outcome = self.evaluator.evaluate(batch);
                self.last_counts = outcome.counts;
            }
            Some(EngineEvent::EndOfStream) => {
                log::info!("end of stream");
                self.apply(LifecycleEvent::EndOfStream);
            }
            Some(EngineEvent::Error { message, fatal }) => {
                log::error!("pipeline error: {}", message);
                self.apply(LifecycleEvent::EngineError { message, fatal });
            }
            Some(EngineEvent::Warning(message)) => {
                log::warn!("pipeline warning: {}", message);
                self.apply(LifecycleEvent::EngineWarning(message));
            }
            Some(EngineEvent::StateChanged { from, to }) => {
                log::debug!("engine state changed: {} -> {}", from, to);
            }
            None => {}
        }

        if self.last_summary.elapsed() >= self.log_interval {
            self.log_summary();
            self.last_summary = Instant::now();
        }
    }

    fn drain(&mut self) {
        if !self.engine_started {
            self.apply(LifecycleEvent::EngineIdle);
            return;
        }
        match self.engine.stop() {
            Ok(()) => {
                self.apply(LifecycleEvent::EngineIdle);
            }
            Err(err) => {
                self.apply(LifecycleEvent::StopFailed(format!("{:#}", err)));
            }
        }
    }

    fn log_summary(&self) {
        let stats = self.stats.snapshot();
        log::info!(
            "frame {} | persons: {} | vehicles: {} | in roi: {} | fps: {:.1} | frame interval: {:.1}ms",
            self.evaluator.frames_seen(),
            self.last_counts.persons,
            self.last_counts.vehicles,
            self.last_counts.total,
            stats.fps,
            stats.avg_frame_interval_ms
        );
    }

    fn finish(&self) {
        let stats = self.stats.snapshot();
        match serde_json::to_string_pretty(&stats) {
            Ok(json) => log::info!("final statistics: {}", json),
            Err(err) => log::warn!("final statistics unavailable: {}", err),
        }
        if self.evaluator.skipped_detections() > 0 || self.evaluator.frame_errors() > 0 {
            log::info!(
                "skipped detections: {}, unreadable frames: {}",
                self.evaluator.skipped_detections(),
                self.evaluator.frame_errors()
            );
        }
        let counters = self.engine.counters();
        if counters.dropped_frames > 0 || counters.frames_without_metadata > 0 {
            log::info!(
                "dropped frames: {}, frames without detection metadata: {}",
                counters.dropped_frames,
                counters.frames_without_metadata
            );
        }
        if counters.metadata_unreadable {
            log::error!("detection metadata was never readable; reported counts are not valid");
        }
        match self.state {
            PipelineState::Stopped => log::info!("pipeline stopped cleanly"),
            PipelineState::Failed => log::error!(
                "pipeline failed: {}",
                self.failure.as_deref().unwrap_or("unknown cause")
            ),
            state => log::warn!("controller finished in non-terminal state {:?}", state),
        }
    }
}

fn failure_cause(event: &LifecycleEvent) -> String {
    match event {
        LifecycleEvent::BuildFailed(cause) => format!("failed to create pipeline: {}", cause),
        LifecycleEvent::StartFailed(cause) => format!("failed to start pipeline: {}", cause),
        LifecycleEvent::StopFailed(cause) => format!("failed to stop pipeline: {}", cause),
        LifecycleEvent::EngineError { message, .. } => {
            format!("unrecoverable engine error: {}", message)
        }
        other => format!("{:?}", other),
    }
}
