//! carla_datagen - capture synchronized rig images and camera trajectories
//!
//! Connects to the simulator, then for each configured map drives a vehicle
//! along the road network and writes one image per camera per tick together
//! with each camera's world location. Ctrl-C stops after the current tick.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use carla_datagen::{CaptureConfig, EndpointConnector};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (.toml or JSON). Falls back to CAPTURE_CONFIG.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Output root directory (overrides config and CAPTURE_OUTPUT_DIR).
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,
    /// Stop each map after this many ticks.
    #[arg(long)]
    max_ticks: Option<u64>,
    /// Seed for vehicle choice and the waypoint walk.
    #[arg(long)]
    seed: Option<u64>,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mode = ui::UiMode::parse(&args.ui)
        .ok_or_else(|| anyhow!("--ui must be one of auto, plain, pretty (got {})", args.ui))?;
    let ui = ui::Ui::new(mode, std::io::stderr().is_terminal());

    let cfg = {
        let _stage = ui.stage("Load configuration");
        let mut cfg = CaptureConfig::load(args.config.as_deref())?;
        if let Some(output) = args.output {
            cfg.output.root = output;
        }
        if let Some(max_ticks) = args.max_ticks {
            cfg.max_ticks = Some(max_ticks);
        }
        if let Some(seed) = args.seed {
            cfg.seed = Some(seed);
        }
        cfg.validate()?;
        cfg
    };
    log::info!(
        "simulator {}, vehicle '{}', rig {} ({} camera(s)), {} fps, maps [{}]",
        cfg.simulator.endpoint(),
        cfg.vehicle_name,
        cfg.rig.preset_kind().name(),
        cfg.rig.len(),
        cfg.fps,
        cfg.maps.join(", ")
    );
    log::info!("writing to {}", cfg.output.root.display());

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::SeqCst);
    })
    .context("error setting Ctrl-C handler")?;

    // One log line per tick follows; a spinner would fight with it.
    let stage = ui.logged_stage("Capture");
    let report = match carla_datagen::run(&cfg, &EndpointConnector, stop) {
        Ok(report) => {
            drop(stage);
            report
        }
        Err(e) => {
            stage.fail();
            log::error!("capture aborted: {}", e);
            return Err(e.into());
        }
    };

    for map in &report.maps {
        log::info!(
            "{}: {} tick(s){}",
            map.map,
            map.summary.ticks,
            map.summary
                .last_tick
                .map(|tick| format!(", last frame {}", tick))
                .unwrap_or_default()
        );
    }
    if report.interrupted {
        log::warn!("capture interrupted; {} tick(s) captured", report.total_ticks());
    } else {
        log::info!("capture complete; {} tick(s) captured", report.total_ticks());
    }
    Ok(())
}
