//! Poses in the simulator's coordinate convention.
//!
//! Left-handed, Z-up world frame; angles in degrees. `Transform::transform_point`
//! uses the same rotation order as the simulator (yaw, then pitch, then roll),
//! so camera offsets attached to a vehicle land where the simulator puts them.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Location {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance(&self, other: &Location) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Pitch, yaw and roll in degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rotation {
    pub pitch: f64,
    pub yaw: f64,
    pub roll: f64,
}

impl Rotation {
    pub const fn new(pitch: f64, yaw: f64, roll: f64) -> Self {
        Self { pitch, yaw, roll }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub location: Location,
    pub rotation: Rotation,
}

impl Transform {
    pub const fn new(location: Location, rotation: Rotation) -> Self {
        Self { location, rotation }
    }

    /// Map a point expressed in this transform's local frame into the parent frame.
    pub fn transform_point(&self, point: &Location) -> Location {
        let (sp, cp) = self.rotation.pitch.to_radians().sin_cos();
        let (sy, cy) = self.rotation.yaw.to_radians().sin_cos();
        let (sr, cr) = self.rotation.roll.to_radians().sin_cos();

        let x = point.x * (cp * cy)
            + point.y * (cy * sp * sr - sy * cr)
            + point.z * (-cy * sp * cr - sy * sr);
        let y = point.x * (cp * sy)
            + point.y * (sy * sp * sr + cy * cr)
            + point.z * (-sy * sp * cr + cy * sr);
        let z = point.x * sp + point.y * (-cp * sr) + point.z * (cp * cr);

        Location {
            x: x + self.location.x,
            y: y + self.location.y,
            z: z + self.location.z,
        }
    }

    /// World pose of a child attached at `offset` relative to `self`.
    ///
    /// Location is exact. Rotation adds Euler angles component-wise, which is
    /// exact for the yaw-only and pitch-only mounts used by rig presets.
    pub fn compose(&self, offset: &Transform) -> Transform {
        Transform {
            location: self.transform_point(&offset.location),
            rotation: Rotation {
                pitch: self.rotation.pitch + offset.rotation.pitch,
                yaw: normalize_degrees(self.rotation.yaw + offset.rotation.yaw),
                roll: self.rotation.roll + offset.rotation.roll,
            },
        }
    }
}

/// Wrap an angle into (-180, 180].
pub fn normalize_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    if wrapped > 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &Location, b: &Location) -> bool {
        a.distance(b) < 1e-9
    }

    #[test]
    fn identity_transform_translates_only() {
        let t = Transform::new(Location::new(1.0, 2.0, 3.0), Rotation::default());
        let p = t.transform_point(&Location::new(4.0, 0.0, 1.4));
        assert!(close(&p, &Location::new(5.0, 2.0, 4.4)));
    }

    #[test]
    fn yaw_rotates_forward_axis() {
        let t = Transform::new(Location::default(), Rotation::new(0.0, 90.0, 0.0));
        let p = t.transform_point(&Location::new(1.0, 0.0, 0.0));
        assert!(close(&p, &Location::new(0.0, 1.0, 0.0)), "got {p:?}");
    }

    #[test]
    fn pitch_raises_forward_axis() {
        let t = Transform::new(Location::default(), Rotation::new(90.0, 0.0, 0.0));
        let p = t.transform_point(&Location::new(1.0, 0.0, 0.0));
        assert!(close(&p, &Location::new(0.0, 0.0, 1.0)), "got {p:?}");
    }

    #[test]
    fn compose_places_mount_relative_to_parent() {
        let vehicle = Transform::new(Location::new(10.0, 20.0, 0.5), Rotation::new(0.0, 180.0, 0.0));
        let mount = Transform::new(Location::new(4.0, 0.0, 1.4), Rotation::new(0.0, 90.0, 0.0));
        let world = vehicle.compose(&mount);
        assert!(close(&world.location, &Location::new(6.0, 20.0, 1.9)), "got {world:?}");
        assert!((world.rotation.yaw - -90.0).abs() < 1e-9);
    }

    #[test]
    fn normalize_wraps_into_half_open_range() {
        assert_eq!(normalize_degrees(270.0), -90.0);
        assert_eq!(normalize_degrees(-180.0), 180.0);
        assert_eq!(normalize_degrees(45.0), 45.0);
    }
}
