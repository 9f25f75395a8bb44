// pulsegate/src/state/trajectory.rs
//
// Bounded pointer history: move samples (default 1000) and clicks (default 500),
// oldest dropped first. Capture is gated by the tracking flag.

use crate::config::PointerConfig;
use crate::events::{ClickSample, PointerSample};
use crate::state::ring::Ring;

#[derive(Debug, Clone)]
pub struct Trajectory {
    pub samples:  Ring<PointerSample>,
    pub clicks:   Ring<ClickSample>,
    tracking:     bool,
    dropped:      u64,
}

impl Trajectory {
    pub fn new(config: &PointerConfig) -> Self {
        Self {
            samples:  Ring::new(config.max_samples),
            clicks:   Ring::new(config.max_clicks),
            tracking: true,
            dropped:  0,
        }
    }

    pub fn set_tracking(&mut self, enabled: bool) { self.tracking = enabled; }
    pub fn is_tracking(&self) -> bool { self.tracking }

    /// Returns false when tracking is off and the sample was ignored.
    pub fn record_move(&mut self, sample: PointerSample) -> bool {
        if !self.tracking || !finite(sample.x, sample.y, sample.timestamp_ms) {
            return false;
        }
        if self.samples.push(sample).is_some() {
            self.dropped += 1;
        }
        true
    }

    pub fn record_click(&mut self, click: ClickSample) -> bool {
        if !self.tracking || !finite(click.x, click.y, click.timestamp_ms) {
            return false;
        }
        if self.clicks.push(click).is_some() {
            self.dropped += 1;
        }
        true
    }

    /// Samples evicted by the caps since the last clear.
    pub fn dropped(&self) -> u64 { self.dropped }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.clicks.clear();
        self.dropped = 0;
    }
}

fn finite(x: f64, y: f64, t: f64) -> bool {
    x.is_finite() && y.is_finite() && t.is_finite()
}
