use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TrackerStatus {
    #[default]
    Idle,
    Running,
    Stopped,
}

/// Active-viewing accounting for one session.
///
/// Time only accrues through heartbeats, and only while the surface is visible
/// and not idle. Each heartbeat contributes the time since the previous one,
/// capped at the heartbeat interval so delayed or coalesced ticks cannot
/// inflate the total.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerState {
    pub status: TrackerStatus,
    pub accumulated_active_ms: u64,
    pub threshold_ms: u64,
    pub interval_ms: u64,
    pub completion_fired: bool,
    pub visible: bool,
    pub idle: bool,
    pub heartbeats: u64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Start of the interval the next heartbeat will account for.
    #[serde(skip)]
    pub anchor: Option<Instant>,
}

impl TrackerState {
    pub fn new(threshold_ms: u64, interval_ms: u64) -> Self {
        Self {
            status: TrackerStatus::Idle,
            accumulated_active_ms: 0,
            threshold_ms,
            interval_ms,
            completion_fired: false,
            visible: true,
            idle: false,
            heartbeats: 0,
            last_heartbeat_at: None,
            anchor: None,
        }
    }

    pub fn is_accumulating(&self) -> bool {
        self.status == TrackerStatus::Running && self.visible && !self.idle
    }

    /// Returns `true` if completion fires immediately (zero threshold).
    pub fn start(&mut self, now: Instant) -> bool {
        if self.status != TrackerStatus::Idle {
            return false;
        }
        self.status = TrackerStatus::Running;
        self.anchor = Some(now);
        self.check_threshold()
    }

    /// Adds one heartbeat's worth of time. Returns `true` exactly once: on the
    /// call that first takes the total to the threshold.
    pub fn accumulate(&mut self, elapsed: Duration) -> bool {
        let capped = (elapsed.as_millis() as u64).min(self.interval_ms);
        self.accumulated_active_ms = self.accumulated_active_ms.saturating_add(capped);
        self.heartbeats += 1;
        self.last_heartbeat_at = Some(Utc::now());
        self.check_threshold()
    }

    /// Heartbeat at `now`. Ignored while suspended.
    pub fn heartbeat(&mut self, now: Instant) -> bool {
        if !self.is_accumulating() {
            return false;
        }
        let elapsed = self
            .anchor
            .map(|anchor| now.saturating_duration_since(anchor))
            .unwrap_or_default();
        self.anchor = Some(now);
        self.accumulate(elapsed)
    }

    pub fn set_visible(&mut self, visible: bool, now: Instant) -> bool {
        if self.visible == visible {
            return false;
        }
        self.transition(now, |state| state.visible = visible)
    }

    pub fn set_idle(&mut self, idle: bool, now: Instant) -> bool {
        if self.idle == idle {
            return false;
        }
        self.transition(now, |state| state.idle = idle)
    }

    /// Banks the partial interval when suspending and re-anchors when resuming.
    fn transition(&mut self, now: Instant, apply: impl FnOnce(&mut Self)) -> bool {
        let fired = if self.is_accumulating() {
            self.heartbeat(now)
        } else {
            false
        };
        apply(self);
        self.anchor = if self.is_accumulating() { Some(now) } else { None };
        fired
    }

    pub fn stop(&mut self, now: Instant) -> bool {
        let fired = self.heartbeat(now);
        self.status = TrackerStatus::Stopped;
        self.anchor = None;
        fired
    }

    fn check_threshold(&mut self) -> bool {
        if !self.completion_fired && self.accumulated_active_ms >= self.threshold_ms {
            self.completion_fired = true;
            return true;
        }
        false
    }
}
