use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use roi_counter::{
    BoundingBox, CounterConfig, DetectionEngine, EngineCounters, EngineEvent, EngineSettings,
    FrameBatch, LifecycleController, PipelineState, RawDetection, StatsAggregator, StopSignal,
};

const FRAME_SPACING: Duration = Duration::from_millis(40);

/// Engine that replays a fixed event script.
#[derive(Default)]
struct ScriptedEngine {
    script: VecDeque<EngineEvent>,
    fail_build: bool,
    fail_start: bool,
    fail_stop: bool,
    stop_after_frames: Option<(usize, StopSignal)>,
    stall: Option<Duration>,
    counters: EngineCounters,
    frames_sent: usize,
    build_calls: usize,
    start_calls: usize,
    stop_calls: usize,
}

impl ScriptedEngine {
    fn with_script(events: Vec<EngineEvent>) -> Self {
        Self {
            script: events.into(),
            ..Self::default()
        }
    }
}

impl DetectionEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn build(&mut self, _settings: &EngineSettings) -> Result<()> {
        self.build_calls += 1;
        if self.fail_build {
            return Err(anyhow!("no such element hailonet"));
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.start_calls += 1;
        if self.fail_start {
            return Err(anyhow!("state change rejected"));
        }
        Ok(())
    }

    fn next_event(&mut self, timeout: Duration) -> Option<EngineEvent> {
        if let Some((limit, stop)) = &self.stop_after_frames {
            if self.frames_sent >= *limit {
                stop.request();
            }
        }
        if let Some(stall) = self.stall.take() {
            std::thread::sleep(stall);
        }
        match self.script.pop_front() {
            Some(event) => {
                if matches!(event, EngineEvent::Frame(_)) {
                    self.frames_sent += 1;
                }
                Some(event)
            }
            None => {
                std::thread::sleep(timeout);
                None
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.stop_calls += 1;
        if self.fail_stop {
            return Err(anyhow!("pipeline stuck in Paused"));
        }
        Ok(())
    }

    fn counters(&self) -> EngineCounters {
        self.counters
    }
}

fn config() -> Result<CounterConfig> {
    CounterConfig::from_json_str(
        r#"{
            "rtsp_url": "rtsp://camera/stream",
            "hef_path": "/models/yolov6n.hef",
            "postprocess_so": "/opt/libpost.so",
            "roi": {"x1": 0.2, "y1": 0.2, "x2": 0.8, "y2": 0.8, "name": "entrance"},
            "log_file": ""
        }"#,
    )
}

/// Capture times `FRAME_SPACING` apart, the last one now.
fn stamps(count: u32) -> Result<Vec<Instant>> {
    let first = Instant::now()
        .checked_sub(FRAME_SPACING * count)
        .ok_or_else(|| anyhow!("monotonic clock too close to its origin"))?;
    Ok((1..=count).map(|i| first + FRAME_SPACING * i).collect())
}

fn frame(captured_at: Instant) -> EngineEvent {
    EngineEvent::Frame(
        FrameBatch::new(vec![
            RawDetection::with_id(0, 0.9, BoundingBox::new(0.3, 0.3, 0.5, 0.6)),
            RawDetection::with_id(2, 0.8, BoundingBox::new(0.85, 0.85, 0.95, 0.95)),
        ])
        .with_dimensions(640, 640)
        .with_captured_at(captured_at),
    )
}

fn frames(count: u32) -> Result<Vec<EngineEvent>> {
    Ok(stamps(count)?.into_iter().map(frame).collect())
}

fn controller(
    engine: ScriptedEngine,
    stop: StopSignal,
) -> Result<(LifecycleController<ScriptedEngine>, Arc<StatsAggregator>)> {
    let stats = Arc::new(StatsAggregator::new(100));
    let controller = LifecycleController::new(engine, &config()?, stats.clone(), stop)
        .with_poll_interval(Duration::from_millis(5));
    Ok((controller, stats))
}

#[test]
fn build_failure_fails_without_starting() -> Result<()> {
    let engine = ScriptedEngine {
        fail_build: true,
        ..ScriptedEngine::default()
    };
    let (mut controller, stats) = controller(engine, StopSignal::new())?;

    let state = controller.run();
    assert_eq!(state, PipelineState::Failed);
    assert_eq!(state.exit_code(), Some(1));
    assert!(controller
        .failure()
        .is_some_and(|cause| cause.contains("failed to create pipeline")));
    assert_eq!(controller.engine().start_calls, 0);
    assert_eq!(controller.engine().stop_calls, 0);
    assert!(stats.is_empty());
    Ok(())
}

#[test]
fn start_failure_fails() -> Result<()> {
    let engine = ScriptedEngine {
        fail_start: true,
        ..ScriptedEngine::default()
    };
    let (mut controller, _stats) = controller(engine, StopSignal::new())?;

    assert_eq!(controller.run(), PipelineState::Failed);
    assert!(controller
        .failure()
        .is_some_and(|cause| cause.contains("failed to start pipeline")));
    assert_eq!(controller.engine().build_calls, 1);
    assert_eq!(controller.engine().stop_calls, 0);
    Ok(())
}

#[test]
fn end_of_stream_drains_to_stopped() -> Result<()> {
    let mut script = vec![EngineEvent::StateChanged {
        from: "Paused".to_string(),
        to: "Playing".to_string(),
    }];
    script.extend(frames(3)?);
    script.push(EngineEvent::EndOfStream);
    let engine = ScriptedEngine::with_script(script);
    let (mut controller, stats) = controller(engine, StopSignal::new())?;

    let state = controller.run();
    assert_eq!(state, PipelineState::Stopped);
    assert_eq!(state.exit_code(), Some(0));
    assert_eq!(
        controller.transitions(),
        &[
            (PipelineState::Idle, PipelineState::Building),
            (PipelineState::Building, PipelineState::Running),
            (PipelineState::Running, PipelineState::Draining),
            (PipelineState::Draining, PipelineState::Stopped),
        ]
    );
    assert_eq!(controller.engine().stop_calls, 1);

    // The first frame has no predecessor and is not recorded.
    assert_eq!(controller.evaluator().frames_seen(), 3);
    assert_eq!(stats.len(), 2);
    let latest = stats.latest().expect("sample");
    assert_eq!(latest.person_count, 1);
    assert_eq!(latest.vehicle_count, 0);
    assert_eq!(latest.total_in_roi, 1);
    assert_eq!(latest.roi_name, "entrance");
    assert!((latest.frame_interval_ms - 40.0).abs() < 1e-6);
    Ok(())
}

#[test]
fn warnings_do_not_interrupt_the_run() -> Result<()> {
    let t = stamps(2)?;
    let engine = ScriptedEngine::with_script(vec![
        frame(t[0]),
        EngineEvent::Warning("dropped a buffer".to_string()),
        frame(t[1]),
        EngineEvent::EndOfStream,
    ]);
    let (mut controller, stats) = controller(engine, StopSignal::new())?;

    assert_eq!(controller.run(), PipelineState::Stopped);
    assert_eq!(stats.len(), 1);
    Ok(())
}

#[test]
fn recoverable_engine_error_drains_cleanly() -> Result<()> {
    let t = stamps(2)?;
    let engine = ScriptedEngine::with_script(vec![
        frame(t[0]),
        EngineEvent::Error {
            message: "connection reset".to_string(),
            fatal: false,
        },
        frame(t[1]),
    ]);
    let (mut controller, _stats) = controller(engine, StopSignal::new())?;

    assert_eq!(controller.run(), PipelineState::Stopped);
    assert_eq!(controller.engine().stop_calls, 1);
    // The frame after the error is never evaluated.
    assert_eq!(controller.evaluator().frames_seen(), 1);
    Ok(())
}

#[test]
fn fatal_engine_error_fails_and_releases_engine() -> Result<()> {
    let engine = ScriptedEngine::with_script(vec![
        frame(Instant::now()),
        EngineEvent::Error {
            message: "internal data stream error".to_string(),
            fatal: true,
        },
    ]);
    let (mut controller, _stats) = controller(engine, StopSignal::new())?;

    let state = controller.run();
    assert_eq!(state, PipelineState::Failed);
    assert_eq!(state.exit_code(), Some(1));
    assert!(controller
        .failure()
        .is_some_and(|cause| cause.contains("internal data stream error")));
    assert_eq!(controller.engine().stop_calls, 1);
    Ok(())
}

#[test]
fn stop_request_while_running_drains() -> Result<()> {
    let stop = StopSignal::new();
    let mut engine = ScriptedEngine::with_script(frames(50)?);
    engine.stop_after_frames = Some((3, stop.clone()));
    let (mut controller, stats) = controller(engine, stop)?;

    let state = controller.run();
    assert_eq!(state, PipelineState::Stopped);
    // Observed within one cycle of the request.
    assert_eq!(controller.evaluator().frames_seen(), 4);
    assert_eq!(stats.len(), 3);
    assert_eq!(controller.engine().stop_calls, 1);
    Ok(())
}

#[test]
fn stop_request_before_start_never_starts_engine() -> Result<()> {
    let stop = StopSignal::new();
    stop.request();
    let (mut controller, _stats) = controller(ScriptedEngine::default(), stop)?;

    assert_eq!(controller.run(), PipelineState::Stopped);
    assert_eq!(controller.engine().build_calls, 1);
    assert_eq!(controller.engine().start_calls, 0);
    assert_eq!(controller.engine().stop_calls, 0);
    Ok(())
}

#[test]
fn failed_teardown_is_a_failure() -> Result<()> {
    let mut engine =
        ScriptedEngine::with_script(vec![frame(Instant::now()), EngineEvent::EndOfStream]);
    engine.fail_stop = true;
    let (mut controller, _stats) = controller(engine, StopSignal::new())?;

    assert_eq!(controller.run(), PipelineState::Failed);
    assert!(controller
        .failure()
        .is_some_and(|cause| cause.contains("failed to stop pipeline")));
    Ok(())
}

#[test]
fn backlogged_frames_keep_their_capture_rate() -> Result<()> {
    // Ten frames at 25 fps queue up while the controller is held off.
    let mut script = frames(10)?;
    script.push(EngineEvent::EndOfStream);
    let mut engine = ScriptedEngine::with_script(script);
    engine.stall = Some(Duration::from_millis(400));
    let (mut controller, stats) = controller(engine, StopSignal::new())?;

    assert_eq!(controller.run(), PipelineState::Stopped);
    assert_eq!(stats.len(), 9);
    let snapshot = stats.snapshot();
    assert!((snapshot.avg_frame_interval_ms - 40.0).abs() < 1e-6);
    assert!((snapshot.fps - 25.0).abs() < 1e-6);

    let samples = stats.samples();
    for pair in samples.windows(2) {
        let gap = (pair[1].timestamp - pair[0].timestamp).num_milliseconds();
        assert!((39..=41).contains(&gap), "gap {} ms", gap);
    }
    Ok(())
}

#[test]
fn engine_counters_do_not_change_the_outcome() -> Result<()> {
    let mut script = frames(3)?;
    script.push(EngineEvent::EndOfStream);
    let mut engine = ScriptedEngine::with_script(script);
    engine.counters = EngineCounters {
        dropped_frames: 7,
        frames_without_metadata: 3,
        metadata_unreadable: true,
    };
    let (mut controller, stats) = controller(engine, StopSignal::new())?;

    let state = controller.run();
    assert_eq!(state, PipelineState::Stopped);
    assert_eq!(state.exit_code(), Some(0));
    assert_eq!(stats.len(), 2);
    assert_eq!(controller.engine().counters().dropped_frames, 7);
    assert!(controller.engine().counters().metadata_unreadable);
    Ok(())
}
