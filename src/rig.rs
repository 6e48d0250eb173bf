//! Camera rig: the fixed set of cameras mounted on the vehicle.

use std::collections::HashSet;
use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::geometry::{Location, Rotation, Transform};

pub const PRESET_NAMES: &[&str] = &["mono_forward", "mono_downward", "stereo", "mvs", "custom"];

/// One camera on the rig. Offsets are relative to the vehicle origin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraMount {
    pub name: String,
    pub translation: Location,
    pub rotation: Rotation,
}

impl CameraMount {
    pub fn new(name: &str, translation: [f64; 3], rotation: [f64; 3]) -> Self {
        Self {
            name: name.to_string(),
            translation: Location::new(translation[0], translation[1], translation[2]),
            rotation: Rotation::new(rotation[0], rotation[1], rotation[2]),
        }
    }

    pub fn offset(&self) -> Transform {
        Transform::new(self.translation, self.rotation)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RigPreset {
    MonoForward,
    MonoDownward,
    Stereo,
    Mvs,
    Custom,
}

impl RigPreset {
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim() {
            "mono_forward" => Ok(Self::MonoForward),
            "mono_downward" => Ok(Self::MonoDownward),
            "stereo" => Ok(Self::Stereo),
            "mvs" => Ok(Self::Mvs),
            "custom" => Ok(Self::Custom),
            other => Err(anyhow!(
                "unknown rig preset '{}' (expected one of: {})",
                other,
                PRESET_NAMES.join(", ")
            )),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::MonoForward => "mono_forward",
            Self::MonoDownward => "mono_downward",
            Self::Stereo => "stereo",
            Self::Mvs => "mvs",
            Self::Custom => "custom",
        }
    }

    /// Mounts for a named preset. `Custom` has none; its cameras come from config.
    pub fn mounts(self) -> Vec<CameraMount> {
        match self {
            Self::MonoForward => vec![CameraMount::new("camera_up", [4.0, 0.0, 1.4], [0.0; 3])],
            Self::MonoDownward => vec![CameraMount::new(
                "camera_down",
                [4.0, 0.0, 1.4],
                [-90.0, 0.0, 0.0],
            )],
            Self::Stereo => vec![
                CameraMount::new("cam1", [4.0, -0.2, 1.4], [0.0; 3]),
                CameraMount::new("cam2", [4.0, 0.2, 1.4], [0.0; 3]),
            ],
            Self::Mvs => vec![
                CameraMount::new("cam1", [4.0, -0.2, 1.4], [0.0; 3]),
                CameraMount::new("cam2", [4.0, 0.2, 1.4], [0.0; 3]),
                CameraMount::new("cam3", [0.0, -1.0, 1.4], [0.0, -90.0, 0.0]),
                CameraMount::new("cam4", [0.0, 1.0, 1.4], [0.0, 90.0, 0.0]),
                CameraMount::new("cam5", [-2.0, 0.0, 1.4], [0.0, 180.0, 0.0]),
            ],
            Self::Custom => Vec::new(),
        }
    }
}

/// Validated, ordered rig. Order fixes trajectory log indices.
#[derive(Clone, Debug, PartialEq)]
pub struct Rig {
    preset: RigPreset,
    cameras: Vec<CameraMount>,
}

impl Rig {
    pub fn preset(preset: RigPreset) -> Result<Self> {
        if preset == RigPreset::Custom {
            return Err(anyhow!("custom rigs need an explicit camera list"));
        }
        Self::build(preset, preset.mounts(), None)
    }

    /// Custom rig. `declared_count`, when given, must match the list length exactly.
    pub fn custom(cameras: Vec<CameraMount>, declared_count: Option<usize>) -> Result<Self> {
        Self::build(RigPreset::Custom, cameras, declared_count)
    }

    fn build(
        preset: RigPreset,
        cameras: Vec<CameraMount>,
        declared_count: Option<usize>,
    ) -> Result<Self> {
        if let Some(count) = declared_count {
            if count != cameras.len() {
                return Err(anyhow!(
                    "rig declares {} cameras but lists {}",
                    count,
                    cameras.len()
                ));
            }
        }
        if cameras.is_empty() {
            return Err(anyhow!("rig must contain at least one camera"));
        }
        let mut seen = HashSet::new();
        for cam in &cameras {
            validate_output_name(&cam.name)?;
            if !seen.insert(cam.name.as_str()) {
                return Err(anyhow!("duplicate camera name '{}'", cam.name));
            }
        }
        Ok(Self { preset, cameras })
    }

    pub fn preset_kind(&self) -> RigPreset {
        self.preset
    }

    pub fn cameras(&self) -> &[CameraMount] {
        &self.cameras
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cameras.iter().map(|cam| cam.name.as_str())
    }
}

/// Camera and map names become directory names, so keep them to a safe charset.
pub fn validate_output_name(name: &str) -> Result<()> {
    static NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").expect("static regex is valid")
    });
    if name == "." || name == ".." || !re.is_match(name) {
        return Err(anyhow!(
            "'{}' is not a valid output name (1-64 chars of A-Z a-z 0-9 _ . -)",
            name
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_expand_to_expected_cameras() -> Result<()> {
        let mono = Rig::preset(RigPreset::MonoForward)?;
        assert_eq!(mono.names().collect::<Vec<_>>(), vec!["camera_up"]);

        let down = Rig::preset(RigPreset::MonoDownward)?;
        assert_eq!(down.cameras()[0].rotation.pitch, -90.0);

        let stereo = Rig::preset(RigPreset::Stereo)?;
        assert_eq!(stereo.len(), 2);
        assert_eq!(stereo.cameras()[0].translation.y, -0.2);
        assert_eq!(stereo.cameras()[1].translation.y, 0.2);

        let mvs = Rig::preset(RigPreset::Mvs)?;
        assert_eq!(mvs.len(), 5);
        assert_eq!(mvs.cameras()[4].rotation.yaw, 180.0);
        Ok(())
    }

    #[test]
    fn unknown_preset_lists_valid_names() {
        let err = RigPreset::parse("fisheye").unwrap_err().to_string();
        assert!(err.contains("mono_forward"));
        assert!(err.contains("custom"));
    }

    #[test]
    fn custom_rig_count_must_match() {
        let cams = vec![CameraMount::new("left", [0.0; 3], [0.0; 3])];
        assert!(Rig::custom(cams.clone(), Some(2)).is_err());
        assert!(Rig::custom(cams, Some(1)).is_ok());
    }

    #[test]
    fn custom_rig_rejects_empty_and_duplicates() {
        assert!(Rig::custom(Vec::new(), None).is_err());
        let cams = vec![
            CameraMount::new("same", [0.0; 3], [0.0; 3]),
            CameraMount::new("same", [1.0, 0.0, 0.0], [0.0; 3]),
        ];
        assert!(Rig::custom(cams, None).is_err());
    }

    #[test]
    fn custom_preset_needs_camera_list() {
        assert!(Rig::preset(RigPreset::Custom).is_err());
    }

    #[test]
    fn output_names_reject_path_components() {
        assert!(validate_output_name("cam_front-1.v2").is_ok());
        assert!(validate_output_name("../escape").is_err());
        assert!(validate_output_name("..").is_err());
        assert!(validate_output_name("").is_err());
        assert!(validate_output_name("has space").is_err());
    }
}
