//! Error taxonomy for a capture run.
//!
//! Every variant is fatal to the collection loop. Nothing here is retried:
//! a retried or skipped tick would leave image sequence numbers out of step
//! with trajectory log line counts.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::sim::ActorId;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// The simulator could not be reached within its connection timeout.
    #[error("cannot connect to simulator at {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    /// A vehicle or sensor blueprint query matched nothing.
    #[error("no blueprint matches '{pattern}'")]
    BlueprintNotFound { pattern: String },

    /// A tick's frame set was not complete before the per-frame timeout.
    #[error("frame timeout: received {received} of {expected} frames (waited {timeout:?} per frame)")]
    FrameTimeout {
        received: usize,
        expected: usize,
        timeout: Duration,
    },

    /// The same camera delivered twice inside one tick's collection.
    #[error("camera '{camera}' delivered more than one frame for a single tick")]
    DuplicateFrame { camera: String },

    /// A collected frame belongs to a different simulator frame than the tick requested.
    #[error("camera '{camera}' delivered frame {frame_id} while collecting tick {tick}")]
    TickMismatch {
        camera: String,
        tick: u64,
        frame_id: u64,
    },

    /// The current waypoint has no successor at the lookahead distance.
    #[error("waypoint {waypoint} has no successor {distance} m ahead")]
    DeadEnd { waypoint: u64, distance: f64 },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Output from an earlier run would collide with this run's sequence numbers.
    #[error("{} already holds output from a previous run; clear or rename it first", path.display())]
    StaleOutput { path: PathBuf },

    #[error("simulator client library not found at {}", path.display())]
    SimulatorLibraryMissing { path: PathBuf },

    #[error("unknown actor {0}")]
    UnknownActor(ActorId),

    #[error("simulator error: {0}")]
    Simulator(String),

    #[error("session already failed; no further ticks are accepted")]
    SessionFailed,
}

impl CaptureError {
    pub fn simulator(msg: impl Into<String>) -> Self {
        Self::Simulator(msg.into())
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }
}

pub type CaptureResult<T> = std::result::Result<T, CaptureError>;
