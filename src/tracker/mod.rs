pub mod controller;
pub mod state;

use serde::{Deserialize, Serialize};

pub use controller::{CompletionEvent, ViewingTracker};
pub use state::{TrackerState, TrackerStatus};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerConfig {
    pub heartbeat_interval_ms: u64,
    /// When false the host drives heartbeats itself.
    pub internal_ticker: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            internal_ticker: true,
        }
    }
}
