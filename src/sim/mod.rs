//! Simulator boundary.
//!
//! The capture pipeline only needs a narrow slice of a driving simulator:
//! world settings, blueprint lookup, actor spawning, sensor callbacks, a
//! synchronous tick and road-network waypoints. `Simulator` captures that
//! slice; `Connector` produces a connected `Simulator`.
//!
//! Backends:
//! - `stub://` endpoints: in-process synthetic world (`synthetic`), used by
//!   tests and dry runs.
//! - `host:port` endpoints: a CARLA server through the `carla` crate
//!   (`live`, behind the `real-carla` feature). The server is first tried with a
//!   plain TCP connect bounded by `connect_timeout`, so an unreachable
//!   server fails fast with `Connection` in every build.
//!
//! Contract relied on by the session loop: `tick()` returns only after the
//! simulator has finished the step, and every sensor callback for that step is
//! delivered after `tick()` was called.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;

use crate::config::SimulatorSettings;
use crate::error::{CaptureError, CaptureResult};
use crate::frame::Frame;
use crate::geometry::{Location, Transform};

#[cfg(feature = "real-carla")]
pub mod live;
pub mod synthetic;

pub use synthetic::{CallbackFault, SyntheticConfig, SyntheticConnector, SyntheticSimulator};

pub const RGB_CAMERA_BLUEPRINT: &str = "sensor.camera.rgb";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(pub u32);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor#{}", self.0)
    }
}

/// Sensor data callback. Invoked on the simulator's own thread(s).
pub type SensorCallback = Arc<dyn Fn(Frame) + Send + Sync>;

#[derive(Clone, Debug, PartialEq)]
pub struct WorldSettings {
    pub synchronous_mode: bool,
    pub no_rendering_mode: bool,
    /// `None` means variable time-step.
    pub fixed_delta_seconds: Option<f64>,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            synchronous_mode: false,
            no_rendering_mode: false,
            fixed_delta_seconds: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Blueprint {
    pub id: String,
    pub tags: Vec<String>,
    pub attributes: BTreeMap<String, String>,
}

impl Blueprint {
    pub fn new(id: &str, tags: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl ToString) -> Self {
        self.set_attribute(key, value);
        self
    }

    pub fn set_attribute(&mut self, key: &str, value: impl ToString) {
        self.attributes.insert(key.to_string(), value.to_string());
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Blueprint filter semantics: glob on the id, or an exact tag match.
    pub fn matches(&self, pattern: &str) -> bool {
        glob_matches(pattern, &self.id) || self.tags.iter().any(|tag| tag == pattern)
    }
}

/// A point on the road network.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Waypoint {
    pub id: u64,
    pub transform: Transform,
}

pub trait Simulator: Send {
    fn map_name(&self) -> String;

    fn load_map(&mut self, name: &str) -> CaptureResult<()>;

    fn settings(&self) -> WorldSettings;

    fn apply_settings(&mut self, settings: &WorldSettings) -> CaptureResult<()>;

    /// Blueprints whose id glob-matches `pattern` or that carry `pattern` as a tag.
    fn blueprints(&self, pattern: &str) -> Vec<Blueprint>;

    /// Exact id lookup.
    fn find_blueprint(&self, id: &str) -> Option<Blueprint>;

    /// Spawn an actor. With a parent, `transform` is relative to the parent.
    fn spawn_actor(
        &mut self,
        blueprint: &Blueprint,
        transform: &Transform,
        parent: Option<ActorId>,
    ) -> CaptureResult<ActorId>;

    fn set_simulate_physics(&mut self, actor: ActorId, enabled: bool) -> CaptureResult<()>;

    fn listen(&mut self, sensor: ActorId, callback: SensorCallback) -> CaptureResult<()>;

    fn stop_listening(&mut self, sensor: ActorId) -> CaptureResult<()>;

    /// Advance one step in synchronous mode; returns the new frame id.
    fn tick(&mut self) -> CaptureResult<u64>;

    /// Nearest driving waypoint to `location`.
    fn waypoint_at(&self, location: &Location) -> CaptureResult<Waypoint>;

    /// Waypoints `distance` metres ahead of `waypoint`, one per reachable branch.
    fn next_waypoints(&self, waypoint: &Waypoint, distance: f64) -> Vec<Waypoint>;

    fn set_transform(&mut self, actor: ActorId, transform: &Transform) -> CaptureResult<()>;

    /// World location of an actor, including attached sensors.
    fn actor_location(&self, actor: ActorId) -> CaptureResult<Location>;

    fn destroy_actor(&mut self, actor: ActorId) -> CaptureResult<()>;
}

pub trait Connector {
    fn connect(&self, settings: &SimulatorSettings) -> CaptureResult<Box<dyn Simulator>>;
}

/// Picks the backend from the endpoint: `stub://` is the synthetic world,
/// anything else is a `host:port` simulator server.
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointConnector;

impl Connector for EndpointConnector {
    fn connect(&self, settings: &SimulatorSettings) -> CaptureResult<Box<dyn Simulator>> {
        if settings.host.starts_with("stub://") {
            return SyntheticConnector::default().connect(settings);
        }
        check_reachable(settings)?;
        #[cfg(feature = "real-carla")]
        {
            live::LiveConnector.connect(settings)
        }
        #[cfg(not(feature = "real-carla"))]
        {
            Err(CaptureError::Connection {
                endpoint: settings.endpoint(),
                reason: "server is reachable but this build has no live backend \
                         (rebuild with --features real-carla)"
                    .to_string(),
            })
        }
    }
}

/// Connect using the backend implied by the endpoint.
pub fn connect(settings: &SimulatorSettings) -> CaptureResult<Box<dyn Simulator>> {
    EndpointConnector.connect(settings)
}

/// Open and close one TCP connection to the server, bounded by `connect_timeout`.
pub fn check_reachable(settings: &SimulatorSettings) -> CaptureResult<()> {
    let connection_error = |reason: String| CaptureError::Connection {
        endpoint: settings.endpoint(),
        reason,
    };
    let addrs: Vec<SocketAddr> = (settings.host.as_str(), settings.port)
        .to_socket_addrs()
        .map_err(|e| connection_error(format!("cannot resolve host: {}", e)))?
        .collect();
    let mut last_error = None;
    for addr in &addrs {
        match TcpStream::connect_timeout(addr, settings.connect_timeout) {
            Ok(_) => {
                log::debug!("{} is accepting connections", addr);
                return Ok(());
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(connection_error(match last_error {
        Some(e) => format!("{} (timeout {:?})", e, settings.connect_timeout),
        None => "host resolved to no addresses".to_string(),
    }))
}

/// `*` matches any run of characters, `?` exactly one; everything else is literal.
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    let mut re = String::with_capacity(pattern.len() + 2);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    regex::Regex::new(&re)
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}
