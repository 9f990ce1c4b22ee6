//! Time-based frame sampling
//!
//! Every frame is decoded; only frames at least `interval_ms` after the last
//! emitted one are passed on.

#[derive(Debug, Clone)]
pub struct FrameSampler {
    interval_ms: u64,
    last_emitted: Option<i64>,
}

impl FrameSampler {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_emitted: None,
        }
    }

    /// Whether a frame at `pts` is due
    pub fn should_emit(&self, pts: i64) -> bool {
        match self.last_emitted {
            None => true,
            Some(last) => {
                let interval = i64::try_from(self.interval_ms).unwrap_or(i64::MAX);
                pts.saturating_sub(last) >= interval
            }
        }
    }

    pub fn mark_emitted(&mut self, pts: i64) {
        self.last_emitted = Some(pts);
    }

    pub fn last_emitted(&self) -> Option<i64> {
        self.last_emitted
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }
}
