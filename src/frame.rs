//! Camera frames and per-tick frame sets.

use std::collections::BTreeMap;

use crate::geometry::Transform;

/// One camera capture. Pixels are BGRA8, row-major, as the simulator delivers them.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Simulator frame id of the tick that produced this capture.
    pub frame_id: u64,
    /// Simulation time in seconds.
    pub timestamp: f64,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    /// Sensor world pose at capture time.
    pub transform: Transform,
}

impl Frame {
    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// RGBA copy of the pixel buffer for encoders that expect RGB channel order.
    pub fn to_rgba(&self) -> Vec<u8> {
        let mut out = self.pixels.clone();
        for px in out.chunks_exact_mut(4) {
            px.swap(0, 2);
        }
        out
    }
}

/// Exactly one frame per camera for a single tick.
///
/// Only the collector builds these, and only once every camera has reported,
/// so a set is never partial.
#[derive(Debug)]
pub struct TickFrameSet {
    tick: u64,
    frames: BTreeMap<String, Frame>,
}

impl TickFrameSet {
    pub(crate) fn new(frames: BTreeMap<String, Frame>) -> Self {
        Self { tick: 0, frames }
    }

    pub(crate) fn with_tick(mut self, tick: u64) -> Self {
        self.tick = tick;
        self
    }

    /// Simulator frame id of the tick this set was collected for.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Simulation time of the tick, taken from its frames.
    pub fn sim_time(&self) -> f64 {
        self.frames
            .values()
            .map(|frame| frame.timestamp)
            .fold(0.0, f64::max)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, camera: &str) -> Option<&Frame> {
        self.frames.get(camera)
    }

    pub fn cameras(&self) -> impl Iterator<Item = &str> {
        self.frames.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Frame)> {
        self.frames.iter().map(|(name, frame)| (name.as_str(), frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_rgba_swaps_blue_and_red() {
        let frame = Frame {
            frame_id: 1,
            timestamp: 0.0,
            width: 2,
            height: 1,
            pixels: vec![10, 20, 30, 255, 1, 2, 3, 4],
            transform: Transform::default(),
        };
        assert_eq!(frame.to_rgba(), vec![30, 20, 10, 255, 3, 2, 1, 4]);
        assert_eq!(frame.byte_len(), 8);
    }
}
