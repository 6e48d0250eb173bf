//! Frame collector: turns asynchronous camera callbacks into complete tick sets.
//!
//! Callbacks push `(frame, camera_name)` into an unbounded FIFO from whatever
//! thread the simulator uses. The main loop drains exactly one item per camera
//! per tick, waiting at most `per_item_timeout` for each.
//!
//! The collector does not know which tick an item belongs to. Correctness rests
//! on the caller never stepping the simulator again before the previous tick's
//! set has been collected in full.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CaptureError, CaptureResult};
use crate::frame::{Frame, TickFrameSet};

type Arrival = (Frame, String);

pub struct FrameCollector {
    tx: Sender<Arrival>,
    rx: Receiver<Arrival>,
    queued: Arc<AtomicUsize>,
}

/// Producer handle given to camera callbacks.
#[derive(Clone)]
pub struct FrameSink {
    tx: Sender<Arrival>,
    queued: Arc<AtomicUsize>,
}

impl FrameSink {
    /// Enqueue a frame. Never blocks and never drops while the collector lives.
    pub fn on_frame_arrival(&self, frame: Frame, camera_name: impl Into<String>) {
        // Count before sending so the consumer never decrements below zero.
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send((frame, camera_name.into())).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            log::debug!("frame arrived after collector shut down; discarded");
        }
    }
}

impl Default for FrameCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCollector {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn sink(&self) -> FrameSink {
        FrameSink {
            tx: self.tx.clone(),
            queued: Arc::clone(&self.queued),
        }
    }

    /// Items enqueued but not yet collected.
    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Dequeue exactly `expected_count` frames keyed by camera name.
    ///
    /// Fails with `FrameTimeout` if any single dequeue waits longer than
    /// `per_item_timeout`, and with `DuplicateFrame` if a camera shows up twice.
    pub fn collect_one_tick_set(
        &self,
        expected_count: usize,
        per_item_timeout: Duration,
    ) -> CaptureResult<TickFrameSet> {
        let mut frames = BTreeMap::new();
        for received in 0..expected_count {
            let (frame, camera) = match self.rx.recv_timeout(per_item_timeout) {
                Ok(item) => item,
                // The collector owns a sender, so disconnection cannot happen while
                // `self` is alive; treat it like a lost callback all the same.
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(CaptureError::FrameTimeout {
                        received,
                        expected: expected_count,
                        timeout: per_item_timeout,
                    });
                }
            };
            self.queued.fetch_sub(1, Ordering::SeqCst);
            if frames.contains_key(&camera) {
                return Err(CaptureError::DuplicateFrame { camera });
            }
            frames.insert(camera, frame);
        }
        Ok(TickFrameSet::new(frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Transform;
    use std::thread;

    fn frame(id: u64) -> Frame {
        Frame {
            frame_id: id,
            timestamp: id as f64,
            width: 1,
            height: 1,
            pixels: vec![0, 0, 0, 255],
            transform: Transform::default(),
        }
    }

    #[test]
    fn collects_full_set_from_other_threads() -> CaptureResult<()> {
        let collector = FrameCollector::new();
        let handles: Vec<_> = ["c", "a", "b"]
            .into_iter()
            .map(|name| {
                let sink = collector.sink();
                thread::spawn(move || sink.on_frame_arrival(frame(7), name))
            })
            .collect();
        for handle in handles {
            handle.join().expect("producer thread");
        }

        let set = collector.collect_one_tick_set(3, Duration::from_millis(500))?;
        assert_eq!(set.len(), 3);
        assert_eq!(set.cameras().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(collector.pending(), 0);
        Ok(())
    }

    #[test]
    fn missing_callback_times_out_without_partial_set() {
        let collector = FrameCollector::new();
        let sink = collector.sink();
        sink.on_frame_arrival(frame(1), "a");
        sink.on_frame_arrival(frame(1), "b");

        let err = collector
            .collect_one_tick_set(3, Duration::from_millis(50))
            .unwrap_err();
        match err {
            CaptureError::FrameTimeout {
                received, expected, ..
            } => {
                assert_eq!(received, 2);
                assert_eq!(expected, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_camera_in_one_tick_is_detected() {
        let collector = FrameCollector::new();
        let sink = collector.sink();
        sink.on_frame_arrival(frame(1), "a");
        sink.on_frame_arrival(frame(1), "a");
        sink.on_frame_arrival(frame(1), "b");

        let err = collector
            .collect_one_tick_set(2, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, CaptureError::DuplicateFrame { ref camera } if camera == "a"));
    }

    #[test]
    fn extra_frame_spills_into_next_collection() -> CaptureResult<()> {
        let collector = FrameCollector::new();
        let sink = collector.sink();
        sink.on_frame_arrival(frame(1), "a");
        sink.on_frame_arrival(frame(1), "a");

        let first = collector.collect_one_tick_set(1, Duration::from_millis(50))?;
        assert_eq!(first.get("a").map(|f| f.frame_id), Some(1));
        assert_eq!(collector.pending(), 1);

        // The leftover belongs to the previous tick; only a frame-id check catches it.
        let second = collector.collect_one_tick_set(1, Duration::from_millis(50))?;
        assert_eq!(second.get("a").map(|f| f.frame_id), Some(1));
        Ok(())
    }

    #[test]
    fn zero_expected_returns_empty_set_immediately() -> CaptureResult<()> {
        let collector = FrameCollector::new();
        let set = collector.collect_one_tick_set(0, Duration::from_millis(1))?;
        assert!(set.is_empty());
        Ok(())
    }
}
