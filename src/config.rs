use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::geometry::{Location, Rotation, Transform};
use crate::rig::{validate_output_name, CameraMount, Rig, RigPreset};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 2000;
const DEFAULT_CONNECT_TIMEOUT_SECS: f64 = 5.0;
const DEFAULT_VEHICLE_NAME: &str = "model3";
const DEFAULT_FPS: f64 = 1.0;
const DEFAULT_MAP: &str = "Town01";
const DEFAULT_RIG_PRESET: &str = "mono_forward";
const DEFAULT_IMAGE_WIDTH: u32 = 800;
const DEFAULT_IMAGE_HEIGHT: u32 = 600;
const DEFAULT_FOV: f64 = 90.0;
const DEFAULT_OUTPUT_ROOT: &str = "Data";
const DEFAULT_GROUND_TRUTH_FILENAME: &str = "gt";
const DEFAULT_FRAME_TIMEOUT_SECS: f64 = 1.0;
const DEFAULT_WAYPOINT_DISTANCE: f64 = 1.0;

const DEFAULT_START_POSE: Transform = Transform::new(
    Location::new(229.973785, 67.599396, 0.45),
    Rotation::new(0.167927, 91.393204, 0.0),
);

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    simulator: Option<SimulatorConfigFile>,
    vehicle_name: Option<String>,
    fps: Option<f64>,
    maps: Option<Vec<String>>,
    start_pose: Option<Transform>,
    rig: Option<RigConfigFile>,
    camera: Option<CameraConfigFile>,
    output: Option<OutputConfigFile>,
    frame_timeout_secs: Option<f64>,
    waypoint_distance: Option<f64>,
    seed: Option<u64>,
    max_ticks: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SimulatorConfigFile {
    host: Option<String>,
    port: Option<u16>,
    connect_timeout_secs: Option<f64>,
    library_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct RigConfigFile {
    preset: Option<String>,
    num_cams: Option<usize>,
    cameras: Option<Vec<CameraMount>>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    image_width: Option<u32>,
    image_height: Option<u32>,
    fov: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    root: Option<PathBuf>,
    ground_truth_filename: Option<String>,
    save_images: Option<bool>,
}

/// Immutable run configuration handed to the capture driver and session.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub simulator: SimulatorSettings,
    pub vehicle_name: String,
    pub fps: f64,
    pub maps: Vec<String>,
    pub start_pose: Transform,
    pub rig: Rig,
    pub camera: CameraSettings,
    pub output: OutputSettings,
    /// Per-frame wait while collecting a tick.
    pub frame_timeout: Duration,
    /// Lookahead for the waypoint random walk, in metres.
    pub waypoint_distance: f64,
    pub seed: Option<u64>,
    /// Stop each map after this many ticks. `None` runs until interrupted.
    pub max_ticks: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SimulatorSettings {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Simulator client library location. When set it must exist.
    pub library_path: Option<PathBuf>,
}

impl SimulatorSettings {
    pub fn endpoint(&self) -> String {
        if self.host.contains("://") {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs_f64(DEFAULT_CONNECT_TIMEOUT_SECS),
            library_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraSettings {
    pub image_width: u32,
    pub image_height: u32,
    /// Horizontal field of view, degrees.
    pub fov: f64,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub root: PathBuf,
    pub ground_truth_filename: String,
    pub save_images: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        // The built-in preset is always valid.
        Self::from_file(CaptureConfigFile::default())
            .expect("built-in capture defaults are valid")
    }
}

impl CaptureConfig {
    /// Defaults, then the file named by `path` (or `CAPTURE_CONFIG`), then env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("CAPTURE_CONFIG").ok().map(PathBuf::from);
        let file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Some(read_config_file(&path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CaptureConfigFile) -> Result<Self> {
        let simulator = file.simulator.unwrap_or_default();
        let simulator = SimulatorSettings {
            host: simulator.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: simulator.port.unwrap_or(DEFAULT_PORT),
            connect_timeout: secs(
                "simulator.connect_timeout_secs",
                simulator
                    .connect_timeout_secs
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            )?,
            library_path: simulator.library_path,
        };

        let rig = build_rig(file.rig.unwrap_or_default())?;

        let camera = file.camera.unwrap_or_default();
        let camera = CameraSettings {
            image_width: camera.image_width.unwrap_or(DEFAULT_IMAGE_WIDTH),
            image_height: camera.image_height.unwrap_or(DEFAULT_IMAGE_HEIGHT),
            fov: camera.fov.unwrap_or(DEFAULT_FOV),
        };

        let output = file.output.unwrap_or_default();
        let output = OutputSettings {
            root: output
                .root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_ROOT)),
            ground_truth_filename: output
                .ground_truth_filename
                .unwrap_or_else(|| DEFAULT_GROUND_TRUTH_FILENAME.to_string()),
            save_images: output.save_images.unwrap_or(true),
        };

        Ok(Self {
            simulator,
            vehicle_name: file
                .vehicle_name
                .unwrap_or_else(|| DEFAULT_VEHICLE_NAME.to_string()),
            fps: file.fps.unwrap_or(DEFAULT_FPS),
            maps: file
                .maps
                .unwrap_or_else(|| vec![DEFAULT_MAP.to_string()]),
            start_pose: file.start_pose.unwrap_or(DEFAULT_START_POSE),
            rig,
            camera,
            output,
            frame_timeout: secs(
                "frame_timeout_secs",
                file.frame_timeout_secs.unwrap_or(DEFAULT_FRAME_TIMEOUT_SECS),
            )?,
            waypoint_distance: file.waypoint_distance.unwrap_or(DEFAULT_WAYPOINT_DISTANCE),
            seed: file.seed,
            max_ticks: file.max_ticks,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("CAPTURE_HOST") {
            if !host.trim().is_empty() {
                self.simulator.host = host;
            }
        }
        if let Ok(port) = std::env::var("CAPTURE_PORT") {
            self.simulator.port = port
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAPTURE_PORT must be a port number"))?;
        }
        if let Ok(dir) = std::env::var("CAPTURE_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.output.root = PathBuf::from(dir);
            }
        }
        if let Ok(fps) = std::env::var("CAPTURE_FPS") {
            self.fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAPTURE_FPS must be a number"))?;
        }
        if let Ok(maps) = std::env::var("CAPTURE_MAPS") {
            let parsed = split_csv(&maps);
            if !parsed.is_empty() {
                self.maps = parsed;
            }
        }
        if let Ok(preset) = std::env::var("CAPTURE_RIG") {
            if !preset.trim().is_empty() {
                self.rig = Rig::preset(RigPreset::parse(&preset)?)?;
            }
        }
        if let Ok(seed) = std::env::var("CAPTURE_SEED") {
            self.seed = Some(
                seed.trim()
                    .parse()
                    .map_err(|_| anyhow!("CAPTURE_SEED must be an unsigned integer"))?,
            );
        }
        if let Ok(ticks) = std::env::var("CAPTURE_MAX_TICKS") {
            self.max_ticks = Some(
                ticks
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("CAPTURE_MAX_TICKS must be an unsigned integer"))?,
            );
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(anyhow!("fps must be a positive number (got {})", self.fps));
        }
        if self.maps.is_empty() {
            return Err(anyhow!("at least one map is required"));
        }
        for map in &self.maps {
            validate_output_name(map)?;
        }
        if self.simulator.host.trim().is_empty() {
            return Err(anyhow!("simulator host must not be empty"));
        }
        if self.simulator.port == 0 {
            return Err(anyhow!("simulator port must be non-zero"));
        }
        if self.simulator.connect_timeout.is_zero() {
            return Err(anyhow!("simulator connect timeout must be greater than zero"));
        }
        if self.frame_timeout.is_zero() {
            return Err(anyhow!("frame timeout must be greater than zero"));
        }
        if !(self.waypoint_distance.is_finite() && self.waypoint_distance > 0.0) {
            return Err(anyhow!("waypoint distance must be a positive number"));
        }
        if self.camera.image_width == 0 || self.camera.image_height == 0 {
            return Err(anyhow!("camera image size must be non-zero"));
        }
        if !(self.camera.fov > 0.0 && self.camera.fov < 180.0) {
            return Err(anyhow!("camera fov must be in (0, 180) degrees"));
        }
        // Becomes part of each trajectory log's file name.
        validate_output_name(&self.output.ground_truth_filename)?;
        Ok(())
    }

    /// Simulation step length, `1/fps`.
    pub fn delta_seconds(&self) -> f64 {
        1.0 / self.fps
    }
}

fn build_rig(file: RigConfigFile) -> Result<Rig> {
    let preset = RigPreset::parse(file.preset.as_deref().unwrap_or(DEFAULT_RIG_PRESET))?;
    match preset {
        RigPreset::Custom => Rig::custom(file.cameras.unwrap_or_default(), file.num_cams),
        preset => {
            if file.cameras.is_some() {
                log::warn!(
                    "rig preset '{}' ignores the configured camera list",
                    preset.name()
                );
            }
            Rig::preset(preset)
        }
    }
}

fn secs(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| anyhow!("{} must be a non-negative number of seconds", field))
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
