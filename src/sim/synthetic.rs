//! Synthetic in-process simulator (`stub://` endpoints).
//!
//! The world is a square grid of two-way roads (20 m blocks) wrapped on a
//! 400 m torus, so a random walk never runs off the map. Sensor callbacks are
//! delivered from a dedicated thread after `tick()` returns, in shuffled order
//! with a little jitter, the way a networked simulator's client thread would.
//!
//! Fault injection (`CallbackFault`) lets tests drop or duplicate one camera's
//! callback at a given step.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::{
    ActorId, Blueprint, Connector, SensorCallback, Simulator, Waypoint, WorldSettings,
    RGB_CAMERA_BLUEPRINT,
};
use crate::config::SimulatorSettings;
use crate::error::{CaptureError, CaptureResult};
use crate::frame::Frame;
use crate::geometry::{normalize_degrees, Location, Rotation, Transform};

const BLOCK_M: f64 = 20.0;
const EXTENT_M: f64 = 400.0;
const EPS: f64 = 1e-6;
const DEFAULT_IMAGE_WIDTH: u32 = 800;
const DEFAULT_IMAGE_HEIGHT: u32 = 600;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackFault {
    /// Never deliver the `sensor`-th listener's frame for the `step`-th tick.
    Drop { sensor: usize, step: u64 },
    /// Deliver the `sensor`-th listener's frame twice for the `step`-th tick.
    Duplicate { sensor: usize, step: u64 },
}

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub refuse_connection: bool,
    pub initial_map: String,
    /// Maps `load_map` accepts. Empty accepts any name.
    pub available_maps: Vec<String>,
    pub faults: Vec<CallbackFault>,
    /// Upper bound on per-callback delivery delay.
    pub delivery_jitter: Duration,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            refuse_connection: false,
            initial_map: "Town01".to_string(),
            available_maps: Vec::new(),
            faults: Vec::new(),
            delivery_jitter: Duration::from_millis(2),
            seed: 0,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SyntheticConnector {
    pub config: SyntheticConfig,
}

impl SyntheticConnector {
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }
}

impl Connector for SyntheticConnector {
    fn connect(&self, settings: &SimulatorSettings) -> CaptureResult<Box<dyn Simulator>> {
        if self.config.refuse_connection {
            return Err(CaptureError::Connection {
                endpoint: settings.endpoint(),
                reason: format!(
                    "connection refused (timeout {:?})",
                    settings.connect_timeout
                ),
            });
        }
        log::info!("connected to {} (synthetic)", settings.endpoint());
        Ok(Box::new(SyntheticSimulator::new(self.config.clone())))
    }
}

struct ActorState {
    blueprint: Blueprint,
    /// Relative to `parent` when attached, world otherwise.
    transform: Transform,
    parent: Option<ActorId>,
    simulate_physics: bool,
}

struct Delivery {
    callback: SensorCallback,
    frame: Frame,
    delay: Duration,
}

pub struct SyntheticSimulator {
    config: SyntheticConfig,
    map: String,
    settings: WorldSettings,
    library: Vec<Blueprint>,
    actors: BTreeMap<ActorId, ActorState>,
    next_actor: u32,
    listeners: Vec<(ActorId, SensorCallback)>,
    frame: u64,
    steps: u64,
    elapsed: f64,
    rng: StdRng,
    delivery_tx: Option<Sender<Vec<Delivery>>>,
    worker: Option<JoinHandle<()>>,
}

impl SyntheticSimulator {
    pub fn new(config: SyntheticConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Vec<Delivery>>();
        let worker = thread::Builder::new()
            .name("synthetic-sensors".to_string())
            .spawn(move || {
                for batch in rx {
                    for delivery in batch {
                        if !delivery.delay.is_zero() {
                            thread::sleep(delivery.delay);
                        }
                        (delivery.callback)(delivery.frame);
                    }
                }
            })
            .ok();
        if worker.is_none() {
            log::warn!("synthetic sensor thread failed to start; callbacks will not fire");
        }

        Self {
            map: config.initial_map.clone(),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            settings: WorldSettings::default(),
            library: default_library(),
            actors: BTreeMap::new(),
            next_actor: 1,
            listeners: Vec::new(),
            frame: 0,
            steps: 0,
            elapsed: 0.0,
            delivery_tx: Some(tx),
            worker,
        }
    }

    /// Number of live actors (vehicles and sensors).
    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    fn actor(&self, id: ActorId) -> CaptureResult<&ActorState> {
        self.actors.get(&id).ok_or(CaptureError::UnknownActor(id))
    }

    fn world_transform(&self, id: ActorId) -> CaptureResult<Transform> {
        let actor = self.actor(id)?;
        match actor.parent {
            Some(parent) => Ok(self.world_transform(parent)?.compose(&actor.transform)),
            None => Ok(actor.transform),
        }
    }

    fn render(&self, sensor: ActorId, transform: Transform) -> CaptureResult<Frame> {
        let bp = &self.actor(sensor)?.blueprint;
        let width = attr_u32(bp, "image_size_x").unwrap_or(DEFAULT_IMAGE_WIDTH);
        let height = attr_u32(bp, "image_size_y").unwrap_or(DEFAULT_IMAGE_HEIGHT);

        // A cheap pattern that shifts with pose and time, enough to tell frames apart.
        let shade = (transform.location.x.abs() + transform.location.y.abs()) as u64;
        let mut pixels = vec![0u8; width as usize * height as usize * 4];
        for (i, px) in pixels.chunks_exact_mut(4).enumerate() {
            let col = (i as u64) % width as u64;
            let row = (i as u64) / width as u64;
            px[0] = ((col + self.frame) % 256) as u8;
            px[1] = ((row + shade) % 256) as u8;
            px[2] = ((col + row + sensor.0 as u64 * 40) % 256) as u8;
            px[3] = 255;
        }

        Ok(Frame {
            frame_id: self.frame,
            timestamp: self.elapsed,
            width,
            height,
            pixels,
            transform,
        })
    }

    fn jitter(&mut self) -> Duration {
        let max = self.config.delivery_jitter.as_micros() as u64;
        if max == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.rng.gen_range(0..=max))
        }
    }
}

impl Drop for SyntheticSimulator {
    fn drop(&mut self) {
        self.delivery_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Simulator for SyntheticSimulator {
    fn map_name(&self) -> String {
        self.map.clone()
    }

    fn load_map(&mut self, name: &str) -> CaptureResult<()> {
        if !self.config.available_maps.is_empty()
            && !self.config.available_maps.iter().any(|m| m == name)
        {
            return Err(CaptureError::simulator(format!("map '{}' is not available", name)));
        }
        self.listeners.clear();
        self.actors.clear();
        self.map = name.to_string();
        log::info!("synthetic world loaded map {}", name);
        Ok(())
    }

    fn settings(&self) -> WorldSettings {
        self.settings.clone()
    }

    fn apply_settings(&mut self, settings: &WorldSettings) -> CaptureResult<()> {
        if let Some(delta) = settings.fixed_delta_seconds {
            if !(delta.is_finite() && delta > 0.0) {
                return Err(CaptureError::simulator(format!(
                    "invalid fixed_delta_seconds {}",
                    delta
                )));
            }
        }
        self.settings = settings.clone();
        Ok(())
    }

    fn blueprints(&self, pattern: &str) -> Vec<Blueprint> {
        self.library
            .iter()
            .filter(|bp| bp.matches(pattern))
            .cloned()
            .collect()
    }

    fn find_blueprint(&self, id: &str) -> Option<Blueprint> {
        self.library.iter().find(|bp| bp.id == id).cloned()
    }

    fn spawn_actor(
        &mut self,
        blueprint: &Blueprint,
        transform: &Transform,
        parent: Option<ActorId>,
    ) -> CaptureResult<ActorId> {
        if self.find_blueprint(&blueprint.id).is_none() {
            return Err(CaptureError::simulator(format!(
                "cannot spawn unknown blueprint {}",
                blueprint.id
            )));
        }
        if let Some(parent) = parent {
            self.actor(parent)?;
        }
        let id = ActorId(self.next_actor);
        self.next_actor += 1;
        self.actors.insert(
            id,
            ActorState {
                blueprint: blueprint.clone(),
                transform: *transform,
                parent,
                simulate_physics: parent.is_none(),
            },
        );
        Ok(id)
    }

    fn set_simulate_physics(&mut self, actor: ActorId, enabled: bool) -> CaptureResult<()> {
        let state = self
            .actors
            .get_mut(&actor)
            .ok_or(CaptureError::UnknownActor(actor))?;
        state.simulate_physics = enabled;
        Ok(())
    }

    fn listen(&mut self, sensor: ActorId, callback: SensorCallback) -> CaptureResult<()> {
        if !self.actor(sensor)?.blueprint.id.starts_with("sensor.") {
            return Err(CaptureError::simulator(format!("{} is not a sensor", sensor)));
        }
        self.listeners.retain(|(id, _)| *id != sensor);
        self.listeners.push((sensor, callback));
        Ok(())
    }

    fn stop_listening(&mut self, sensor: ActorId) -> CaptureResult<()> {
        self.actor(sensor)?;
        self.listeners.retain(|(id, _)| *id != sensor);
        Ok(())
    }

    fn tick(&mut self) -> CaptureResult<u64> {
        if !self.settings.synchronous_mode {
            return Err(CaptureError::simulator(
                "tick() requires synchronous mode",
            ));
        }
        let step = self.steps;
        self.steps += 1;
        self.frame += 1;
        self.elapsed += self.settings.fixed_delta_seconds.unwrap_or(0.05);

        let mut batch = Vec::new();
        let listeners: Vec<(ActorId, SensorCallback)> = self.listeners.clone();
        for (ordinal, (sensor, callback)) in listeners.into_iter().enumerate() {
            let mut copies = 1;
            for fault in &self.config.faults {
                match *fault {
                    CallbackFault::Drop { sensor: s, step: at } if s == ordinal && at == step => {
                        copies = 0;
                    }
                    CallbackFault::Duplicate { sensor: s, step: at }
                        if s == ordinal && at == step =>
                    {
                        copies = 2;
                    }
                    _ => {}
                }
            }
            if copies == 0 {
                log::debug!("synthetic fault: dropping {} at step {}", sensor, step);
                continue;
            }
            let transform = self.world_transform(sensor)?;
            let frame = self.render(sensor, transform)?;
            for _ in 0..copies {
                let delay = self.jitter();
                batch.push(Delivery {
                    callback: callback.clone(),
                    frame: frame.clone(),
                    delay,
                });
            }
        }
        batch.shuffle(&mut self.rng);

        if let Some(tx) = &self.delivery_tx {
            tx.send(batch)
                .map_err(|_| CaptureError::simulator("sensor delivery thread has stopped"))?;
        }
        Ok(self.frame)
    }

    fn waypoint_at(&self, location: &Location) -> CaptureResult<Waypoint> {
        if !(location.x.is_finite() && location.y.is_finite()) {
            return Err(CaptureError::simulator("location is not finite"));
        }
        Ok(road_waypoint_at(location))
    }

    fn next_waypoints(&self, waypoint: &Waypoint, distance: f64) -> Vec<Waypoint> {
        road_successors(waypoint, distance)
    }

    fn set_transform(&mut self, actor: ActorId, transform: &Transform) -> CaptureResult<()> {
        let state = self
            .actors
            .get_mut(&actor)
            .ok_or(CaptureError::UnknownActor(actor))?;
        state.transform = *transform;
        Ok(())
    }

    fn actor_location(&self, actor: ActorId) -> CaptureResult<Location> {
        Ok(self.world_transform(actor)?.location)
    }

    fn destroy_actor(&mut self, actor: ActorId) -> CaptureResult<()> {
        self.actors
            .remove(&actor)
            .ok_or(CaptureError::UnknownActor(actor))?;
        self.listeners.retain(|(id, _)| *id != actor);
        Ok(())
    }
}

fn default_library() -> Vec<Blueprint> {
    vec![
        Blueprint::new("vehicle.tesla.model3", &["tesla", "model3"]),
        Blueprint::new("vehicle.tesla.cybertruck", &["tesla", "cybertruck"]),
        Blueprint::new("vehicle.ford.mustang", &["ford", "mustang"]),
        Blueprint::new("vehicle.lincoln.mkz_2017", &["lincoln", "mkz_2017"]),
        Blueprint::new("vehicle.audi.etron", &["audi", "etron"]),
        Blueprint::new("vehicle.toyota.prius", &["toyota", "prius"]),
        Blueprint::new(RGB_CAMERA_BLUEPRINT, &["sensor", "camera", "rgb"])
            .with_attribute("image_size_x", DEFAULT_IMAGE_WIDTH)
            .with_attribute("image_size_y", DEFAULT_IMAGE_HEIGHT)
            .with_attribute("fov", 90.0),
        Blueprint::new("sensor.camera.depth", &["sensor", "camera", "depth"]),
    ]
}

fn attr_u32(bp: &Blueprint, key: &str) -> Option<u32> {
    bp.attribute(key).and_then(|v| v.parse().ok())
}

// ----------------------------------------------------------------------------
// Grid road network
// ----------------------------------------------------------------------------

fn wrap(coord: f64) -> f64 {
    coord.rem_euclid(EXTENT_M)
}

fn snap_to_block(coord: f64) -> f64 {
    wrap((coord / BLOCK_M).round() * BLOCK_M)
}

/// Axis-aligned heading: 0, 90, 180 or -90 degrees, as a unit step in x/y.
fn heading(yaw: f64) -> (f64, f64, f64) {
    let quadrant = (normalize_degrees(yaw) / 90.0).round() as i64;
    match quadrant.rem_euclid(4) {
        0 => (0.0, 1.0, 0.0),
        1 => (90.0, 0.0, 1.0),
        2 => (180.0, -1.0, 0.0),
        _ => (-90.0, 0.0, -1.0),
    }
}

fn make_waypoint(x: f64, y: f64, yaw: f64) -> Waypoint {
    let x = wrap(x);
    let y = wrap(y);
    let mut hasher = DefaultHasher::new();
    ((x * 1000.0).round() as i64).hash(&mut hasher);
    ((y * 1000.0).round() as i64).hash(&mut hasher);
    (yaw.round() as i64).hash(&mut hasher);
    Waypoint {
        id: hasher.finish(),
        transform: Transform::new(Location::new(x, y, 0.0), Rotation::new(0.0, yaw, 0.0)),
    }
}

fn road_waypoint_at(location: &Location) -> Waypoint {
    let x = wrap(location.x);
    let y = wrap(location.y);
    let off_x = (x - snap_to_block(x)).abs().min(EXTENT_M - (x - snap_to_block(x)).abs());
    let off_y = (y - snap_to_block(y)).abs().min(EXTENT_M - (y - snap_to_block(y)).abs());
    if off_x <= off_y {
        make_waypoint(snap_to_block(x), y, 90.0)
    } else {
        make_waypoint(x, snap_to_block(y), 0.0)
    }
}

/// Straight-ahead successor, plus left/right turns when an intersection lies
/// within `distance`.
fn road_successors(waypoint: &Waypoint, distance: f64) -> Vec<Waypoint> {
    if !(distance.is_finite() && distance > 0.0) {
        return Vec::new();
    }
    let loc = waypoint.transform.location;
    let (yaw, dx, dy) = heading(waypoint.transform.rotation.yaw);

    let along = if dx != 0.0 { loc.x } else { loc.y };
    let sign = if dx != 0.0 { dx } else { dy };
    let rem = along.rem_euclid(BLOCK_M);
    let mut to_junction = if sign > 0.0 { BLOCK_M - rem } else { rem };
    if to_junction < EPS || BLOCK_M - to_junction < EPS {
        to_junction = BLOCK_M;
    }

    if distance + EPS < to_junction || distance >= BLOCK_M {
        return vec![make_waypoint(loc.x + dx * distance, loc.y + dy * distance, yaw)];
    }

    let jx = loc.x + dx * to_junction;
    let jy = loc.y + dy * to_junction;
    let rest = (distance - to_junction).max(0.0);
    [yaw, yaw - 90.0, yaw + 90.0]
        .into_iter()
        .map(|turn| {
            let (turn_yaw, tx, ty) = heading(turn);
            make_waypoint(jx + tx * rest, jy + ty * rest, turn_yaw)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn synchronous(sim: &mut SyntheticSimulator) {
        sim.apply_settings(&WorldSettings {
            synchronous_mode: true,
            no_rendering_mode: false,
            fixed_delta_seconds: Some(0.5),
        })
        .expect("apply settings");
    }

    #[test]
    fn waypoints_snap_to_nearest_road() {
        let wp = road_waypoint_at(&Location::new(41.0, 7.0, 0.0));
        assert_eq!(wp.transform.location.x, 40.0);
        assert_eq!(wp.transform.location.y, 7.0);
        assert_eq!(wp.transform.rotation.yaw, 90.0);

        let wp = road_waypoint_at(&Location::new(7.0, 59.5, 0.0));
        assert_eq!(wp.transform.location.y, 60.0);
        assert_eq!(wp.transform.rotation.yaw, 0.0);
    }

    #[test]
    fn straight_road_has_single_successor() {
        let wp = make_waypoint(3.0, 40.0, 0.0);
        let next = road_successors(&wp, 1.0);
        assert_eq!(next.len(), 1);
        assert!((next[0].transform.location.x - 4.0).abs() < 1e-9);
    }

    #[test]
    fn junction_branches_three_ways() {
        let wp = make_waypoint(19.5, 40.0, 0.0);
        let next = road_successors(&wp, 1.0);
        assert_eq!(next.len(), 3);
        let yaws: Vec<f64> = next.iter().map(|w| w.transform.rotation.yaw).collect();
        assert!(yaws.contains(&0.0));
        assert!(yaws.contains(&90.0));
        assert!(yaws.contains(&-90.0));
        let turned = next.iter().find(|w| w.transform.rotation.yaw == 90.0).unwrap();
        assert!((turned.transform.location.x - 20.0).abs() < 1e-9);
        assert!((turned.transform.location.y - 40.5).abs() < 1e-9);
    }

    #[test]
    fn roads_wrap_around_the_map_edge() {
        let wp = make_waypoint(399.5, 40.0, 0.0);
        let next = road_successors(&wp, 1.0);
        assert!(next
            .iter()
            .all(|w| w.transform.location.x >= 0.0 && w.transform.location.x < EXTENT_M));
    }

    #[test]
    fn refusing_connector_reports_connection_error() {
        let connector = SyntheticConnector::new(SyntheticConfig {
            refuse_connection: true,
            ..SyntheticConfig::default()
        });
        let settings = SimulatorSettings::default();
        let err = connector.connect(&settings).err().expect("refused");
        assert!(matches!(err, CaptureError::Connection { .. }));
    }

    #[test]
    fn tick_requires_synchronous_mode() {
        let mut sim = SyntheticSimulator::new(SyntheticConfig::default());
        assert!(sim.tick().is_err());
        synchronous(&mut sim);
        assert_eq!(sim.tick().expect("tick"), 1);
    }

    #[test]
    fn attached_sensor_follows_parent_and_delivers_frames() {
        let mut sim = SyntheticSimulator::new(SyntheticConfig::default());
        synchronous(&mut sim);
        let vehicle_bp = sim.blueprints("model3").remove(0);
        let vehicle = sim
            .spawn_actor(&vehicle_bp, &Transform::default(), None)
            .expect("spawn vehicle");
        let camera_bp = sim
            .find_blueprint(RGB_CAMERA_BLUEPRINT)
            .expect("camera blueprint")
            .with_attribute("image_size_x", 4)
            .with_attribute("image_size_y", 2);
        let offset = Transform::new(Location::new(4.0, 0.0, 1.4), Rotation::default());
        let camera = sim
            .spawn_actor(&camera_bp, &offset, Some(vehicle))
            .expect("spawn camera");

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        sim.listen(camera, Arc::new(move |frame: Frame| sink.lock().unwrap().push(frame)))
            .expect("listen");

        sim.set_transform(
            vehicle,
            &Transform::new(Location::new(10.0, 0.0, 0.0), Rotation::default()),
        )
        .expect("teleport");
        let loc = sim.actor_location(camera).expect("location");
        assert!((loc.x - 14.0).abs() < 1e-9);

        let tick = sim.tick().expect("tick");
        drop(sim); // joins the delivery thread

        let frames = received.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_id, tick);
        assert_eq!(frames[0].pixels.len(), 4 * 2 * 4);
    }

    #[test]
    fn unknown_map_is_rejected_when_list_is_fixed() {
        let mut sim = SyntheticSimulator::new(SyntheticConfig {
            available_maps: vec!["Town01".to_string()],
            ..SyntheticConfig::default()
        });
        assert!(sim.load_map("Town99").is_err());
        assert!(sim.load_map("Town01").is_ok());
    }
}
