//! Session controller: vehicle + camera rig + lock-step tick loop.
//!
//! One tick is: step the simulator, teleport the vehicle to the next
//! waypoint, then wait until every camera has delivered its frame for that
//! step. A new step is never requested before the previous set is complete;
//! that ordering is what keeps the collector's FIFO free of cross-tick frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::collector::FrameCollector;
use crate::config::CaptureConfig;
use crate::error::{CaptureError, CaptureResult};
use crate::frame::{Frame, TickFrameSet};
use crate::output::{append_trajectory, write_image, OutputTargets};
use crate::sim::{ActorId, Simulator, Waypoint, WorldSettings, RGB_CAMERA_BLUEPRINT};

/// Picks the next waypoint among the successors of the current one.
pub trait WaypointPolicy: Send {
    fn choose(&mut self, current: &Waypoint, successors: &[Waypoint]) -> Option<Waypoint>;
}

/// Uniform random choice; reproducible when seeded.
pub struct RandomSuccessor {
    rng: StdRng,
}

impl RandomSuccessor {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl WaypointPolicy for RandomSuccessor {
    fn choose(&mut self, _current: &Waypoint, successors: &[Waypoint]) -> Option<Waypoint> {
        successors.choose(&mut self.rng).copied()
    }
}

/// Always the first successor (straight ahead on most road networks).
pub struct FirstSuccessor;

impl WaypointPolicy for FirstSuccessor {
    fn choose(&mut self, _current: &Waypoint, successors: &[Waypoint]) -> Option<Waypoint> {
        successors.first().copied()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    Ticking,
    WaitingForFrames,
    Failed,
}

/// External controls for `run_collection_loop`.
#[derive(Clone, Debug, Default)]
pub struct CollectionControl {
    /// Checked between ticks; set from a signal handler.
    pub stop: Arc<AtomicBool>,
    pub max_ticks: Option<u64>,
}

impl CollectionControl {
    pub fn with_max_ticks(max_ticks: Option<u64>) -> Self {
        Self {
            max_ticks,
            ..Self::default()
        }
    }

    fn should_stop(&self, ticks_done: u64) -> bool {
        self.stop.load(Ordering::SeqCst) || self.max_ticks.is_some_and(|max| ticks_done >= max)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CollectionSummary {
    /// Complete ticks written; also the next unused sequence number.
    pub ticks: u64,
    pub last_tick: Option<u64>,
}

struct Camera {
    name: String,
    actor: ActorId,
}

pub struct SessionController {
    sim: Box<dyn Simulator>,
    collector: FrameCollector,
    policy: Box<dyn WaypointPolicy>,
    vehicle: ActorId,
    vehicle_blueprint: String,
    cameras: Vec<Camera>,
    waypoint: Waypoint,
    original_settings: WorldSettings,
    config: CaptureConfig,
    state: SessionState,
}

impl SessionController {
    /// Enter synchronous mode, spawn the vehicle and the rig, register callbacks.
    ///
    /// On failure every actor spawned so far is destroyed and the original
    /// world settings are restored before the error is returned.
    pub fn initialize(
        mut sim: Box<dyn Simulator>,
        config: &CaptureConfig,
        policy: Box<dyn WaypointPolicy>,
    ) -> CaptureResult<Self> {
        let original_settings = sim.settings();
        sim.apply_settings(&WorldSettings {
            synchronous_mode: true,
            no_rendering_mode: false,
            fixed_delta_seconds: Some(config.delta_seconds()),
        })?;

        let mut spawned = Vec::new();
        match spawn_rig(sim.as_mut(), config, &mut spawned) {
            Ok(rig) => {
                let collector = FrameCollector::new();
                let mut session = Self {
                    sim,
                    collector,
                    policy,
                    vehicle: rig.vehicle,
                    vehicle_blueprint: rig.vehicle_blueprint,
                    cameras: rig.cameras,
                    waypoint: rig.waypoint,
                    original_settings,
                    config: config.clone(),
                    state: SessionState::Ready,
                };
                if let Err(e) = session.register_callbacks() {
                    let _ = session.close();
                    return Err(e);
                }
                log::info!(
                    "session ready on {}: vehicle {} ({}), {} camera(s), {:.3}s step",
                    session.sim.map_name(),
                    session.vehicle,
                    session.vehicle_blueprint,
                    session.cameras.len(),
                    config.delta_seconds()
                );
                Ok(session)
            }
            Err(e) => {
                for actor in spawned.into_iter().rev() {
                    let _ = sim.destroy_actor(actor);
                }
                let _ = sim.apply_settings(&original_settings);
                Err(e)
            }
        }
    }

    fn register_callbacks(&mut self) -> CaptureResult<()> {
        for cam in &self.cameras {
            let sink = self.collector.sink();
            let name = cam.name.clone();
            self.sim.listen(
                cam.actor,
                Arc::new(move |frame: Frame| sink.on_frame_arrival(frame, name.as_str())),
            )?;
        }
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn current_waypoint(&self) -> &Waypoint {
        &self.waypoint
    }

    pub fn vehicle_blueprint(&self) -> &str {
        &self.vehicle_blueprint
    }

    pub fn camera_names(&self) -> impl Iterator<Item = &str> {
        self.cameras.iter().map(|cam| cam.name.as_str())
    }

    /// Step once, move the vehicle, and block until the tick's frame set is complete.
    pub fn advance_tick(&mut self) -> CaptureResult<TickFrameSet> {
        if self.state == SessionState::Failed {
            return Err(CaptureError::SessionFailed);
        }
        let result = self.step();
        self.state = match result {
            Ok(_) => SessionState::Ready,
            Err(_) => SessionState::Failed,
        };
        result
    }

    fn step(&mut self) -> CaptureResult<TickFrameSet> {
        self.set_state(SessionState::Ticking);
        let tick = self.sim.tick()?;

        let successors = self
            .sim
            .next_waypoints(&self.waypoint, self.config.waypoint_distance);
        let next = self
            .policy
            .choose(&self.waypoint, &successors)
            .ok_or(CaptureError::DeadEnd {
                waypoint: self.waypoint.id,
                distance: self.config.waypoint_distance,
            })?;
        log::debug!(
            "tick {}: {} successor(s), moving to waypoint {}",
            tick,
            successors.len(),
            next.id
        );
        self.waypoint = next;
        self.sim.set_transform(self.vehicle, &next.transform)?;

        self.set_state(SessionState::WaitingForFrames);
        let set = self
            .collector
            .collect_one_tick_set(self.cameras.len(), self.config.frame_timeout)?;
        for (camera, frame) in set.iter() {
            if frame.frame_id != tick {
                return Err(CaptureError::TickMismatch {
                    camera: camera.to_string(),
                    tick,
                    frame_id: frame.frame_id,
                });
            }
        }
        Ok(set.with_tick(tick))
    }

    fn set_state(&mut self, next: SessionState) {
        log::trace!("session state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Tick until stopped, writing one image and one trajectory line per camera per tick.
    ///
    /// Any error ends the loop immediately. Ticks already written stay on disk
    /// and stay consistent: image `<n>.png` pairs with line `n` of each log.
    pub fn run_collection_loop(
        &mut self,
        targets: &OutputTargets,
        control: &CollectionControl,
    ) -> CaptureResult<CollectionSummary> {
        let persist = self.config.output.save_images;
        if targets.cameras().len() != self.cameras.len() {
            return Err(CaptureError::simulator(format!(
                "output targets cover {} cameras but the rig has {}",
                targets.cameras().len(),
                self.cameras.len()
            )));
        }

        let mut sequence: u64 = 0;
        let mut last_tick = None;
        while !control.should_stop(sequence) {
            let set = self.advance_tick()?;

            if persist {
                for (cam, target) in self.cameras.iter().zip(targets.cameras()) {
                    let frame = set.get(&cam.name).ok_or_else(|| {
                        CaptureError::simulator(format!("tick set is missing camera {}", cam.name))
                    })?;
                    // The frame carries the sensor pose at render time; the vehicle
                    // has already moved on to the next waypoint.
                    let written = write_image(&target.image_path(sequence), frame).and_then(|_| {
                        append_trajectory(&target.trajectory_log, &frame.transform.location)
                    });
                    if let Err(e) = written {
                        self.state = SessionState::Failed;
                        return Err(e);
                    }
                }
                log::info!(
                    "image(s) {} saved (frame {}, sim time {:.3}s)",
                    sequence,
                    set.tick(),
                    set.sim_time()
                );
            } else {
                log::info!(
                    "tick {} collected (frame {}, sim time {:.3}s, not saved)",
                    sequence,
                    set.tick(),
                    set.sim_time()
                );
            }

            last_tick = Some(set.tick());
            sequence += 1;
        }

        if control.stop.load(Ordering::SeqCst) {
            log::warn!("stop requested; collection ended after {} tick(s)", sequence);
        }
        Ok(CollectionSummary {
            ticks: sequence,
            last_tick,
        })
    }

    /// Destroy the rig and vehicle, restore world settings, and hand the simulator back.
    pub fn close(mut self) -> CaptureResult<Box<dyn Simulator>> {
        let mut first_error = None;
        for cam in self.cameras.iter().rev() {
            let result = self
                .sim
                .stop_listening(cam.actor)
                .and_then(|_| self.sim.destroy_actor(cam.actor));
            if let Err(e) = result {
                log::warn!("failed to destroy camera {}: {}", cam.name, e);
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.sim.destroy_actor(self.vehicle) {
            log::warn!("failed to destroy vehicle {}: {}", self.vehicle, e);
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.sim.apply_settings(&self.original_settings) {
            first_error.get_or_insert(e);
        }
        if self.collector.pending() > 0 {
            log::debug!(
                "discarding {} uncollected frame(s) at session close",
                self.collector.pending()
            );
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(self.sim),
        }
    }
}

struct SpawnedRig {
    vehicle: ActorId,
    vehicle_blueprint: String,
    cameras: Vec<Camera>,
    waypoint: Waypoint,
}

fn spawn_rig(
    sim: &mut dyn Simulator,
    config: &CaptureConfig,
    spawned: &mut Vec<ActorId>,
) -> CaptureResult<SpawnedRig> {
    let candidates = sim.blueprints(&config.vehicle_name);
    let vehicle_bp = {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        candidates
            .choose(&mut rng)
            .cloned()
            .ok_or_else(|| CaptureError::BlueprintNotFound {
                pattern: config.vehicle_name.clone(),
            })?
    };

    let waypoint = sim.waypoint_at(&config.start_pose.location)?;
    let vehicle = sim.spawn_actor(&vehicle_bp, &config.start_pose, None)?;
    spawned.push(vehicle);
    sim.set_simulate_physics(vehicle, false)?;

    let mut camera_bp =
        sim.find_blueprint(RGB_CAMERA_BLUEPRINT)
            .ok_or_else(|| CaptureError::BlueprintNotFound {
                pattern: RGB_CAMERA_BLUEPRINT.to_string(),
            })?;
    camera_bp.set_attribute("image_size_x", config.camera.image_width);
    camera_bp.set_attribute("image_size_y", config.camera.image_height);
    camera_bp.set_attribute("fov", config.camera.fov);

    let mut cameras = Vec::with_capacity(config.rig.len());
    for mount in config.rig.cameras() {
        let actor = sim.spawn_actor(&camera_bp, &mount.offset(), Some(vehicle))?;
        spawned.push(actor);
        cameras.push(Camera {
            name: mount.name.clone(),
            actor,
        });
    }

    Ok(SpawnedRig {
        vehicle,
        vehicle_blueprint: vehicle_bp.id,
        cameras,
        waypoint,
    })
}
