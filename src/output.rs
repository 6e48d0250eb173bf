//! On-disk output for one map.
//!
//! Layout under the output root:
//!
//! ```text
//! <root>/<map>/<camera_name>/<seq>.png   one image per camera per tick
//! <root>/<map>/<gt>_<index>.csv          one `x,y,z` line per tick, per camera
//! <root>/<map>/calibration.json          rig offsets + pinhole intrinsics
//! ```
//!
//! Sequence numbers restart at zero on every run and nothing is resumed, so
//! `prepare` refuses to reuse a directory that already holds output.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use image::{ColorType, ImageFormat};
use serde::Serialize;

use crate::config::CameraSettings;
use crate::error::{CaptureError, CaptureResult};
use crate::frame::Frame;
use crate::geometry::{Location, Rotation};
use crate::rig::Rig;

pub const CALIBRATION_FILENAME: &str = "calibration.json";

#[derive(Clone, Debug)]
pub struct CameraTarget {
    pub name: String,
    pub image_dir: PathBuf,
    pub trajectory_log: PathBuf,
}

impl CameraTarget {
    pub fn image_path(&self, sequence: u64) -> PathBuf {
        self.image_dir.join(format!("{}.png", sequence))
    }
}

/// Output locations for every camera of a rig on one map, in rig order.
#[derive(Clone, Debug)]
pub struct OutputTargets {
    map_dir: PathBuf,
    cameras: Vec<CameraTarget>,
}

impl OutputTargets {
    pub fn for_map(root: &Path, map: &str, ground_truth_filename: &str, rig: &Rig) -> Self {
        let map_dir = root.join(map);
        let cameras = rig
            .names()
            .enumerate()
            .map(|(index, name)| CameraTarget {
                name: name.to_string(),
                image_dir: map_dir.join(name),
                trajectory_log: map_dir.join(format!("{}_{}.csv", ground_truth_filename, index)),
            })
            .collect();
        Self { map_dir, cameras }
    }

    pub fn map_dir(&self) -> &Path {
        &self.map_dir
    }

    pub fn cameras(&self) -> &[CameraTarget] {
        &self.cameras
    }

    /// Create directories, refusing anything left over from an earlier run.
    pub fn prepare(&self) -> CaptureResult<()> {
        for cam in &self.cameras {
            if cam.trajectory_log.exists() {
                return Err(CaptureError::StaleOutput {
                    path: cam.trajectory_log.clone(),
                });
            }
            if dir_has_entries(&cam.image_dir)? {
                return Err(CaptureError::StaleOutput {
                    path: cam.image_dir.clone(),
                });
            }
        }
        for cam in &self.cameras {
            fs::create_dir_all(&cam.image_dir)
                .map_err(|e| CaptureError::write(&cam.image_dir, e))?;
        }
        Ok(())
    }

    pub fn write_calibration(
        &self,
        rig: &Rig,
        camera: &CameraSettings,
        fps: f64,
    ) -> CaptureResult<PathBuf> {
        let intrinsics = CameraIntrinsics::from_fov(camera.image_width, camera.image_height, camera.fov);
        let calibration = Calibration {
            fps,
            cameras: rig
                .cameras()
                .iter()
                .zip(&self.cameras)
                .map(|(mount, target)| CameraCalibration {
                    name: mount.name.clone(),
                    trajectory_log: target
                        .trajectory_log
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    translation: mount.translation,
                    rotation: mount.rotation,
                    image_width: camera.image_width,
                    image_height: camera.image_height,
                    fov: camera.fov,
                    intrinsics: intrinsics.matrix(),
                })
                .collect(),
        };
        let path = self.map_dir.join(CALIBRATION_FILENAME);
        let json = serde_json::to_vec_pretty(&calibration)
            .map_err(|e| CaptureError::write(&path, e.into()))?;
        write_atomic(&path, &json)?;
        Ok(path)
    }
}

/// Pinhole intrinsics derived from image size and horizontal field of view.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraIntrinsics {
    pub focal: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    pub fn from_fov(width: u32, height: u32, fov_degrees: f64) -> Self {
        let width = width as f64;
        Self {
            focal: width / (2.0 * (fov_degrees * std::f64::consts::PI / 360.0).tan()),
            cx: width / 2.0,
            cy: height as f64 / 2.0,
        }
    }

    /// Row-major K.
    pub fn matrix(&self) -> [[f64; 3]; 3] {
        [
            [self.focal, 0.0, self.cx],
            [0.0, self.focal, self.cy],
            [0.0, 0.0, 1.0],
        ]
    }
}

#[derive(Serialize)]
struct Calibration {
    fps: f64,
    cameras: Vec<CameraCalibration>,
}

#[derive(Serialize)]
struct CameraCalibration {
    name: String,
    trajectory_log: String,
    translation: Location,
    rotation: Rotation,
    image_width: u32,
    image_height: u32,
    fov: f64,
    intrinsics: [[f64; 3]; 3],
}

/// Encode a frame as PNG at `path`. The file appears complete or not at all.
pub fn write_image(path: &Path, frame: &Frame) -> CaptureResult<()> {
    let expected = frame.width as usize * frame.height as usize * 4;
    if frame.byte_len() != expected {
        return Err(CaptureError::write(
            path,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "frame has {} bytes, expected {} for {}x{} BGRA",
                    frame.byte_len(),
                    expected,
                    frame.width,
                    frame.height
                ),
            ),
        ));
    }
    let tmp_path = path.with_extension("png.tmp");
    image::save_buffer_with_format(
        &tmp_path,
        &frame.to_rgba(),
        frame.width,
        frame.height,
        ColorType::Rgba8,
        ImageFormat::Png,
    )
    .map_err(|e| CaptureError::write(path, std::io::Error::other(e)))?;
    fs::rename(&tmp_path, path).map_err(|e| CaptureError::write(path, e))?;
    Ok(())
}

/// Append one `x,y,z` line. Opens and closes the file on every call.
pub fn append_trajectory(path: &Path, location: &Location) -> CaptureResult<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CaptureError::write(path, e))?;
    writeln!(file, "{}", format_sample(location)).map_err(|e| CaptureError::write(path, e))?;
    Ok(())
}

pub fn format_sample(location: &Location) -> String {
    format!("{},{},{}", location.x, location.y, location.z)
}

fn write_atomic(path: &Path, data: &[u8]) -> CaptureResult<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp_path).map_err(|e| CaptureError::write(&tmp_path, e))?;
        file.write_all(data)
            .and_then(|_| file.sync_all())
            .map_err(|e| CaptureError::write(&tmp_path, e))?;
    }
    fs::rename(&tmp_path, path).map_err(|e| CaptureError::write(path, e))?;
    Ok(())
}

fn dir_has_entries(dir: &Path) -> CaptureResult<bool> {
    match fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CaptureError::write(dir, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Transform;
    use crate::rig::RigPreset;
    use tempfile::tempdir;

    fn tiny_frame() -> Frame {
        Frame {
            frame_id: 3,
            timestamp: 1.5,
            width: 2,
            height: 2,
            pixels: vec![255, 0, 0, 255].repeat(4),
            transform: Transform::default(),
        }
    }

    #[test]
    fn layout_follows_map_and_camera_names() -> anyhow::Result<()> {
        let rig = Rig::preset(RigPreset::Stereo)?;
        let targets = OutputTargets::for_map(Path::new("/data"), "Town02", "gt", &rig);
        let cams = targets.cameras();
        assert_eq!(cams[0].image_dir, PathBuf::from("/data/Town02/cam1"));
        assert_eq!(cams[1].trajectory_log, PathBuf::from("/data/Town02/gt_1.csv"));
        assert_eq!(cams[0].image_path(12), PathBuf::from("/data/Town02/cam1/12.png"));
        Ok(())
    }

    #[test]
    fn prepare_refuses_previous_run_output() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let rig = Rig::preset(RigPreset::MonoForward)?;
        let targets = OutputTargets::for_map(dir.path(), "Town01", "gt", &rig);
        targets.prepare()?;
        append_trajectory(&targets.cameras()[0].trajectory_log, &Location::default())?;

        let err = targets.prepare().unwrap_err();
        assert!(matches!(err, CaptureError::StaleOutput { .. }));
        Ok(())
    }

    #[test]
    fn image_is_written_as_rgba_png() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("0.png");
        write_image(&path, &tiny_frame())?;

        let decoded = image::open(&path)?.into_rgba8();
        assert_eq!(decoded.dimensions(), (2, 2));
        // BGRA (255,0,0) is blue.
        assert_eq!(decoded.get_pixel(0, 0).0, [0, 0, 255, 255]);
        assert!(!dir.path().join("0.png.tmp").exists());
        Ok(())
    }

    #[test]
    fn short_pixel_buffer_is_a_write_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut frame = tiny_frame();
        frame.pixels.truncate(3);
        let err = write_image(&dir.path().join("0.png"), &frame).unwrap_err();
        assert!(matches!(err, CaptureError::Write { .. }));
        Ok(())
    }

    #[test]
    fn trajectory_lines_append() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("gt_0.csv");
        append_trajectory(&path, &Location::new(1.5, -2.0, 0.25))?;
        append_trajectory(&path, &Location::new(2.5, -2.0, 0.25))?;
        let contents = std::fs::read_to_string(&path)?;
        assert_eq!(contents, "1.5,-2,0.25\n2.5,-2,0.25\n");
        Ok(())
    }

    #[test]
    fn intrinsics_from_ninety_degree_fov() {
        let k = CameraIntrinsics::from_fov(800, 600, 90.0);
        assert!((k.focal - 400.0).abs() < 1e-9);
        assert_eq!(k.cx, 400.0);
        assert_eq!(k.cy, 300.0);
        assert_eq!(k.matrix()[2], [0.0, 0.0, 1.0]);
    }

    #[test]
    fn calibration_file_lists_every_camera() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let rig = Rig::preset(RigPreset::Mvs)?;
        let targets = OutputTargets::for_map(dir.path(), "Town01", "gt", &rig);
        targets.prepare()?;
        let camera = CameraSettings {
            image_width: 800,
            image_height: 600,
            fov: 90.0,
        };
        let path = targets.write_calibration(&rig, &camera, 10.0)?;
        let value: serde_json::Value = serde_json::from_slice(&std::fs::read(path)?)?;
        assert_eq!(value["cameras"].as_array().map(Vec::len), Some(5));
        assert_eq!(value["cameras"][2]["name"], "cam3");
        assert_eq!(value["cameras"][2]["trajectory_log"], "gt_2.csv");
        Ok(())
    }
}
