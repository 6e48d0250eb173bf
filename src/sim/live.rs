//! CARLA server backend on the `carla` crate (`real-carla` feature).
//!
//! Poses cross the boundary as `nalgebra::Isometry3<f32>`; angles are
//! converted between degrees (ours) and the roll/pitch/yaw radians the crate
//! uses. Only RGB camera data is forwarded to callbacks.

use std::collections::BTreeMap;
use std::time::Duration;

use ::carla::client::{Actor, ActorBase, ActorBlueprint, Client, Sensor, World};
use ::carla::rpc::AttachmentType;
use ::carla::sensor::data::Image;
use ::carla::sensor::SensorDataBase;
use nalgebra::{Isometry3, Translation3, UnitQuaternion};

use super::{
    ActorId, Blueprint, Connector, SensorCallback, Simulator, Waypoint, WorldSettings,
};
use crate::config::SimulatorSettings;
use crate::error::{CaptureError, CaptureResult};
use crate::frame::Frame;
use crate::geometry::{Location, Rotation, Transform};

/// How long `apply_settings` waits for the server to acknowledge.
const SETTINGS_TIMEOUT: Duration = Duration::from_secs(10);

/// Client worker threads; the crate picks a default when `None`.
const WORKER_THREADS: Option<usize> = None;

#[derive(Clone, Copy, Debug, Default)]
pub struct LiveConnector;

impl Connector for LiveConnector {
    fn connect(&self, settings: &SimulatorSettings) -> CaptureResult<Box<dyn Simulator>> {
        let mut client = Client::connect(&settings.host, settings.port, WORKER_THREADS);
        client.set_timeout(settings.connect_timeout);
        let world = client.world();
        log::info!(
            "connected to {} (map {})",
            settings.endpoint(),
            world.map().name()
        );
        Ok(Box::new(CarlaSimulator {
            client,
            world,
            actors: BTreeMap::new(),
            sensors: BTreeMap::new(),
        }))
    }
}

pub struct CarlaSimulator {
    client: Client,
    world: World,
    actors: BTreeMap<ActorId, Actor>,
    sensors: BTreeMap<ActorId, Sensor>,
}

impl CarlaSimulator {
    fn actor(&self, id: ActorId) -> CaptureResult<&Actor> {
        self.actors.get(&id).ok_or(CaptureError::UnknownActor(id))
    }

    fn library_blueprint(&self, id: &str) -> CaptureResult<ActorBlueprint> {
        self.world
            .blueprint_library()
            .find(id)
            .ok_or_else(|| CaptureError::BlueprintNotFound {
                pattern: id.to_string(),
            })
    }

    fn road_waypoint(&self, location: &Location) -> Option<::carla::client::Waypoint> {
        self.world.map().waypoint(&Translation3::new(
            location.x as f32,
            location.y as f32,
            location.z as f32,
        ))
    }
}

impl Simulator for CarlaSimulator {
    fn map_name(&self) -> String {
        self.world.map().name()
    }

    fn load_map(&mut self, name: &str) -> CaptureResult<()> {
        if !self.actors.is_empty() {
            return Err(CaptureError::simulator(format!(
                "cannot load {} while {} actor(s) are alive",
                name,
                self.actors.len()
            )));
        }
        self.world = self.client.load_world(name);
        log::info!("loaded map {}", self.world.map().name());
        Ok(())
    }

    fn settings(&self) -> WorldSettings {
        let settings = self.world.settings();
        WorldSettings {
            synchronous_mode: settings.synchronous_mode,
            no_rendering_mode: settings.no_rendering_mode,
            fixed_delta_seconds: settings.fixed_delta_seconds,
        }
    }

    fn apply_settings(&mut self, settings: &WorldSettings) -> CaptureResult<()> {
        let mut episode = self.world.settings();
        episode.synchronous_mode = settings.synchronous_mode;
        episode.no_rendering_mode = settings.no_rendering_mode;
        episode.fixed_delta_seconds = settings.fixed_delta_seconds;
        self.world.apply_settings(&episode, SETTINGS_TIMEOUT);
        Ok(())
    }

    fn blueprints(&self, pattern: &str) -> Vec<Blueprint> {
        self.world
            .blueprint_library()
            .filter(pattern)
            .iter()
            .map(|bp| Blueprint::new(&bp.id(), &[]))
            .collect()
    }

    fn find_blueprint(&self, id: &str) -> Option<Blueprint> {
        self.world
            .blueprint_library()
            .find(id)
            .map(|bp| Blueprint::new(&bp.id(), &[]))
    }

    fn spawn_actor(
        &mut self,
        blueprint: &Blueprint,
        transform: &Transform,
        parent: Option<ActorId>,
    ) -> CaptureResult<ActorId> {
        let mut bp = self.library_blueprint(&blueprint.id)?;
        for (key, value) in &blueprint.attributes {
            if !bp.set_attribute(key, value) {
                log::debug!("{}: attribute {} not modifiable", blueprint.id, key);
            }
        }
        let pose = to_isometry(transform);
        let spawned = match parent {
            Some(parent) => {
                let parent = self.actor(parent)?.clone();
                self.world
                    .spawn_actor_opt(&bp, &pose, Some(&parent), AttachmentType::Rigid)
            }
            None => self.world.spawn_actor(&bp, &pose),
        }
        .map_err(|e| CaptureError::simulator(format!("spawn {} failed: {}", blueprint.id, e)))?;
        let id = ActorId(spawned.id());
        self.actors.insert(id, spawned);
        Ok(id)
    }

    fn set_simulate_physics(&mut self, actor: ActorId, enabled: bool) -> CaptureResult<()> {
        self.actor(actor)?.set_simulate_physics(enabled);
        Ok(())
    }

    fn listen(&mut self, sensor: ActorId, callback: SensorCallback) -> CaptureResult<()> {
        let actor = self.actor(sensor)?.clone();
        let camera = Sensor::try_from(actor)
            .map_err(|_| CaptureError::simulator(format!("{} is not a sensor", sensor)))?;
        camera.listen(move |data| match Image::try_from(data) {
            Ok(image) => callback(frame_from_image(&image)),
            Err(_) => log::warn!("non-image data from {}; ignored", sensor),
        });
        self.sensors.insert(sensor, camera);
        Ok(())
    }

    fn stop_listening(&mut self, sensor: ActorId) -> CaptureResult<()> {
        self.actor(sensor)?;
        if let Some(camera) = self.sensors.remove(&sensor) {
            camera.stop();
        }
        Ok(())
    }

    fn tick(&mut self) -> CaptureResult<u64> {
        Ok(self.world.tick())
    }

    fn waypoint_at(&self, location: &Location) -> CaptureResult<Waypoint> {
        self.road_waypoint(location)
            .map(|wp| to_waypoint(&wp))
            .ok_or_else(|| {
                CaptureError::simulator(format!(
                    "no driving lane near ({:.2}, {:.2}, {:.2})",
                    location.x, location.y, location.z
                ))
            })
    }

    fn next_waypoints(&self, waypoint: &Waypoint, distance: f64) -> Vec<Waypoint> {
        match self.road_waypoint(&waypoint.transform.location) {
            Some(wp) => wp.next(distance).iter().map(|next| to_waypoint(&next)).collect(),
            None => Vec::new(),
        }
    }

    fn set_transform(&mut self, actor: ActorId, transform: &Transform) -> CaptureResult<()> {
        self.actor(actor)?.set_transform(&to_isometry(transform));
        Ok(())
    }

    fn actor_location(&self, actor: ActorId) -> CaptureResult<Location> {
        let t = self.actor(actor)?.location();
        Ok(Location::new(t.x as f64, t.y as f64, t.z as f64))
    }

    fn destroy_actor(&mut self, actor: ActorId) -> CaptureResult<()> {
        if let Some(camera) = self.sensors.remove(&actor) {
            camera.stop();
        }
        let handle = self
            .actors
            .remove(&actor)
            .ok_or(CaptureError::UnknownActor(actor))?;
        if !handle.destroy() {
            log::warn!("server refused to destroy {}", actor);
        }
        Ok(())
    }
}

impl Drop for CarlaSimulator {
    fn drop(&mut self) {
        for (_, camera) in std::mem::take(&mut self.sensors) {
            camera.stop();
        }
        for (_, actor) in std::mem::take(&mut self.actors) {
            actor.destroy();
        }
    }
}

fn frame_from_image(image: &Image) -> Frame {
    let colors = image.as_slice();
    let mut pixels = Vec::with_capacity(colors.len() * 4);
    for color in colors {
        pixels.extend_from_slice(&[color.b, color.g, color.r, color.a]);
    }
    Frame {
        frame_id: image.frame() as u64,
        timestamp: image.timestamp(),
        width: image.width() as u32,
        height: image.height() as u32,
        pixels,
        transform: from_isometry(&image.sensor_transform()),
    }
}

fn to_waypoint(wp: &::carla::client::Waypoint) -> Waypoint {
    Waypoint {
        id: wp.id(),
        transform: from_isometry(&wp.transform()),
    }
}

fn to_isometry(transform: &Transform) -> Isometry3<f32> {
    let Location { x, y, z } = transform.location;
    let Rotation { pitch, yaw, roll } = transform.rotation;
    Isometry3::from_parts(
        Translation3::new(x as f32, y as f32, z as f32),
        UnitQuaternion::from_euler_angles(
            roll.to_radians() as f32,
            pitch.to_radians() as f32,
            yaw.to_radians() as f32,
        ),
    )
}

fn from_isometry(pose: &Isometry3<f32>) -> Transform {
    let t = pose.translation;
    let (roll, pitch, yaw) = pose.rotation.euler_angles();
    Transform::new(
        Location::new(t.x as f64, t.y as f64, t.z as f64),
        Rotation::new(
            (pitch as f64).to_degrees(),
            (yaw as f64).to_degrees(),
            (roll as f64).to_degrees(),
        ),
    )
}
