//! Capture driver: connect once, then run one session per configured map.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::CaptureConfig;
use crate::error::{CaptureError, CaptureResult};
use crate::output::OutputTargets;
use crate::session::{
    CollectionControl, CollectionSummary, RandomSuccessor, SessionController, WaypointPolicy,
};
use crate::sim::Connector;

#[derive(Clone, Debug, PartialEq)]
pub struct MapReport {
    pub map: String,
    pub output_dir: PathBuf,
    pub summary: CollectionSummary,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CaptureReport {
    pub maps: Vec<MapReport>,
    /// True when the stop flag ended the run.
    pub interrupted: bool,
}

impl CaptureReport {
    pub fn total_ticks(&self) -> u64 {
        self.maps.iter().map(|m| m.summary.ticks).sum()
    }
}

/// Run the whole capture described by `config`.
///
/// Nothing is spawned and no directory is created until the connection
/// succeeds. Each map's session is closed before the next map loads, also
/// when the loop fails; the loop error is returned after cleanup.
pub fn run(
    config: &CaptureConfig,
    connector: &dyn Connector,
    stop: Arc<AtomicBool>,
) -> CaptureResult<CaptureReport> {
    if let Some(path) = &config.simulator.library_path {
        if !path.exists() {
            return Err(CaptureError::SimulatorLibraryMissing { path: path.clone() });
        }
    }

    let mut sim = connector.connect(&config.simulator)?;
    let control = CollectionControl {
        stop: Arc::clone(&stop),
        max_ticks: config.max_ticks,
    };
    if config.max_ticks.is_none() && config.maps.len() > 1 {
        log::warn!(
            "no tick limit set; only {} will be captured until stopped",
            config.maps[0]
        );
    }

    let mut report = CaptureReport::default();
    for (index, map) in config.maps.iter().enumerate() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        if sim.map_name() != *map {
            log::info!("loading map {}", map);
            sim.load_map(map)?;
        }

        let policy: Box<dyn WaypointPolicy> = match config.seed {
            Some(seed) => Box::new(RandomSuccessor::seeded(seed.wrapping_add(index as u64))),
            None => Box::new(RandomSuccessor::from_entropy()),
        };
        let mut session = SessionController::initialize(sim, config, policy)?;

        let targets = OutputTargets::for_map(
            &config.output.root,
            map,
            &config.output.ground_truth_filename,
            &config.rig,
        );
        let outcome = prepare_outputs(config, &targets)
            .and_then(|_| session.run_collection_loop(&targets, &control));

        match outcome {
            Ok(summary) => {
                log::info!(
                    "{}: {} tick(s) captured into {}",
                    map,
                    summary.ticks,
                    targets.map_dir().display()
                );
                report.maps.push(MapReport {
                    map: map.clone(),
                    output_dir: targets.map_dir().to_path_buf(),
                    summary,
                });
                sim = session.close()?;
            }
            Err(e) => {
                log::error!("{}: capture failed: {}", map, e);
                if let Err(close_err) = session.close() {
                    log::warn!("cleanup after failure also failed: {}", close_err);
                }
                return Err(e);
            }
        }
    }

    report.interrupted = stop.load(Ordering::SeqCst);
    Ok(report)
}

fn prepare_outputs(config: &CaptureConfig, targets: &OutputTargets) -> CaptureResult<()> {
    if !config.output.save_images {
        log::info!("image saving disabled; frames are collected and discarded");
        return Ok(());
    }
    targets.prepare()?;
    let path = targets.write_calibration(&config.rig, &config.camera, config.fps)?;
    log::debug!("calibration written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SyntheticConfig, SyntheticConnector};
    use std::time::Duration;
    use tempfile::tempdir;

    fn config_in(root: &std::path::Path) -> CaptureConfig {
        let mut cfg = CaptureConfig::default();
        cfg.output.root = root.to_path_buf();
        cfg.camera.image_width = 8;
        cfg.camera.image_height = 6;
        cfg.frame_timeout = Duration::from_millis(500);
        cfg.seed = Some(3);
        cfg.max_ticks = Some(2);
        cfg
    }

    #[test]
    fn missing_library_path_is_fatal_before_connecting() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut cfg = config_in(dir.path());
        cfg.simulator.library_path = Some(dir.path().join("no-such-client.so"));
        let connector = SyntheticConnector::default();
        let err = run(&cfg, &connector, Arc::default()).unwrap_err();
        assert!(matches!(err, CaptureError::SimulatorLibraryMissing { .. }));
        Ok(())
    }

    #[test]
    fn stop_flag_set_up_front_captures_nothing() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let cfg = config_in(dir.path());
        let stop = Arc::new(AtomicBool::new(true));
        let report = run(&cfg, &SyntheticConnector::default(), stop)?;
        assert!(report.interrupted);
        assert_eq!(report.total_ticks(), 0);
        Ok(())
    }

    #[test]
    fn disabled_saving_still_ticks_but_writes_nothing() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut cfg = config_in(dir.path());
        cfg.output.save_images = false;
        let connector = SyntheticConnector::new(SyntheticConfig::default());
        let report = run(&cfg, &connector, Arc::default())?;
        assert_eq!(report.total_ticks(), 2);
        assert!(!dir.path().join("Town01").exists());
        Ok(())
    }
}
