//! roi_counter - count persons and vehicles inside a region of interest
//!
//! This daemon:
//! 1. Loads and validates the JSON (or TOML) configuration
//! 2. Builds the detection engine for the configured stream
//! 3. Scores every frame's detections against the region
//! 4. Serves running statistics on `GET /status`
//! 5. Exits 0 on a clean stop, 1 on any build, start or runtime failure

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use roi_counter::{
    config::example_config, engine_for_source, logging, CounterConfig, LifecycleController,
    PipelineState, StatsAggregator, StatusProvider, StatusServer, StatusServerConfig, StopSignal,
};

#[derive(Parser, Debug)]
#[command(
    name = "roi_counter",
    version,
    about = "Count persons and vehicles overlapping a region of interest on a live stream"
)]
struct Args {
    /// Path to the JSON configuration (`.toml` is parsed as TOML).
    #[arg(env = "ROI_COUNTER_CONFIG", value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Print an example configuration and exit.
    #[arg(long)]
    print_example: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_example {
        match serde_json::to_string_pretty(&example_config()) {
            Ok(text) => println!("{}", text),
            Err(err) => {
                eprintln!("failed to render example config: {}", err);
                std::process::exit(1);
            }
        }
        return;
    }

    let Some(config_path) = args.config else {
        eprintln!("Usage: roi_counter <config.json>");
        eprintln!();
        eprintln!("Example config.json:");
        if let Ok(text) = serde_json::to_string_pretty(&example_config()) {
            eprintln!("{}", text);
        }
        std::process::exit(1);
    };

    let code = match run(config_path) {
        Ok(state) => state.exit_code().unwrap_or(1),
        Err(err) => {
            // The logger may not be up yet.
            if log::log_enabled!(log::Level::Error) {
                log::error!("{:#}", err);
            } else {
                eprintln!("error: {:#}", err);
            }
            1
        }
    };
    std::process::exit(code);
}

fn run(config_path: PathBuf) -> Result<PipelineState> {
    let config = CounterConfig::load(&config_path)?;
    logging::init(config.log_level, config.log_file.as_deref())?;

    log::info!("configuration loaded from {}", config_path.display());
    log::info!("stream: {}", config.stream_source);
    log::info!(
        "ROI '{}': ({:.2}, {:.2}) to ({:.2}, {:.2})",
        config.region.name(),
        config.region.x1(),
        config.region.y1(),
        config.region.x2(),
        config.region.y2()
    );
    log::info!("model: {}", config.model_path.display());
    log::info!("target classes: person (COCO 0), vehicles (COCO 2, 3, 5, 7)");

    let stats = Arc::new(StatsAggregator::new(config.window_size));

    let status_handle = if config.enable_status_server {
        let provider = StatusProvider::new(&config, stats.clone());
        let spawned = StatusServerConfig::new(&config.status_bind, config.status_port)
            .and_then(|server_cfg| StatusServer::new(server_cfg, provider).spawn());
        match spawned {
            Ok(handle) => {
                log::info!("status available at http://{}/status", handle.addr);
                Some(handle)
            }
            Err(err) => {
                log::warn!("status server disabled: {:#}", err);
                None
            }
        }
    } else {
        None
    };

    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        log::info!("received shutdown signal");
        handler_stop.request();
    })
    .expect("error setting Ctrl-C handler");

    let engine = engine_for_source(&config.stream_source)?;
    let mut controller = LifecycleController::new(engine, &config, stats, stop);
    let state = controller.run();

    if let Some(handle) = status_handle {
        if let Err(err) = handle.stop() {
            log::warn!("status server shutdown: {:#}", err);
        }
    }

    log::info!("shutdown complete ({:?})", state);
    Ok(state)
}
