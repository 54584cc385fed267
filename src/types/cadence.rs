//! Sampling cadence for inference submissions

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How often frames pulled from the source are handed to the inference engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Submit every Nth frame (1 = every frame)
    EveryNth(u32),

    /// Submit at most this many frames per second, latest frame wins
    Max(u32),
}

impl Default for Cadence {
    fn default() -> Self {
        Cadence::EveryNth(30)
    }
}

impl Cadence {
    /// Whether the frame with this 1-based pull count should be submitted.
    ///
    /// Time-based cadences are gated on elapsed time by the frame pump and
    /// always answer `true` here.
    pub fn selects(self, count: u64) -> bool {
        match self {
            Cadence::EveryNth(n) => n <= 1 || count % u64::from(n) == 0,
            Cadence::Max(_) => true,
        }
    }

    /// Minimum gap between submissions for time-based cadences
    pub fn throttle_interval(self) -> Option<Duration> {
        match self {
            Cadence::EveryNth(_) => None,
            Cadence::Max(hz) => Some(Duration::from_secs_f64(1.0 / f64::from(hz.max(1)))),
        }
    }
}
