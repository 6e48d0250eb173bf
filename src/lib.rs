//! Synchronous camera-rig data collection for driving simulators.
//!
//! A vehicle with physics disabled is teleported along the road network one
//! waypoint per simulation step. A rig of RGB cameras rides on it. Each step
//! produces exactly one image per camera plus that camera's world location,
//! written as `<root>/<map>/<camera>/<seq>.png` and one `x,y,z` line in the
//! camera's trajectory log.
//!
//! # Module Structure
//!
//! - `config`: layered run configuration (defaults, file, environment)
//! - `rig`: camera rig presets and custom rigs
//! - `sim`: simulator boundary traits and the synthetic `stub://` backend
//! - `collector`: callback-to-tick frame grouping
//! - `session`: vehicle, rig and the lock-step tick loop
//! - `output`: on-disk layout, image and trajectory writers, calibration
//! - `capture`: top-level driver over all configured maps

pub mod capture;
pub mod collector;
pub mod config;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod output;
pub mod rig;
pub mod session;
pub mod sim;

pub use capture::{run, CaptureReport, MapReport};
pub use collector::{FrameCollector, FrameSink};
pub use config::{CameraSettings, CaptureConfig, OutputSettings, SimulatorSettings};
pub use error::{CaptureError, CaptureResult};
pub use frame::{Frame, TickFrameSet};
pub use geometry::{Location, Rotation, Transform};
pub use output::{CameraIntrinsics, OutputTargets};
pub use rig::{CameraMount, Rig, RigPreset};
pub use session::{
    CollectionControl, CollectionSummary, FirstSuccessor, RandomSuccessor, SessionController,
    SessionState, WaypointPolicy,
};
pub use sim::{Connector, EndpointConnector, Simulator};
