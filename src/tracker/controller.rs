use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::session::{SessionEvents, SessionRef};

use super::{TrackerConfig, TrackerState, TrackerStatus};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

/// Emitted once per session when active viewing time reaches the threshold.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    pub session_id: String,
    pub activity_id: i64,
    pub user_id: i64,
    pub study_uid: String,
    pub accumulated_active_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Drives a [`TrackerState`] from a heartbeat ticker and reports progress
/// through the session's event sink.
#[derive(Clone)]
pub struct ViewingTracker {
    session: SessionRef,
    state: Arc<Mutex<TrackerState>>,
    events: Arc<dyn SessionEvents>,
    config: TrackerConfig,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    cancel_token: CancellationToken,
}

impl ViewingTracker {
    pub fn new(
        session: SessionRef,
        threshold_ms: u64,
        config: TrackerConfig,
        events: Arc<dyn SessionEvents>,
    ) -> Self {
        let interval_ms = config.heartbeat_interval_ms.max(1);
        Self {
            session,
            state: Arc::new(Mutex::new(TrackerState::new(threshold_ms, interval_ms))),
            events,
            config,
            ticker: Arc::new(Mutex::new(None)),
            cancel_token: CancellationToken::new(),
        }
    }

    /// No-op unless the tracker is still idle, so a tracker stopped before it
    /// got started stays stopped.
    pub async fn start(&self) {
        let (fired, snapshot) = {
            let mut state = self.state.lock().await;
            if state.status != TrackerStatus::Idle {
                return;
            }
            let fired = state.start(Instant::now());
            (fired, state.clone())
        };
        log_info!(
            "Viewing tracker started for session {} (threshold {} ms)",
            self.session.session_id,
            snapshot.threshold_ms
        );

        if self.config.internal_ticker {
            self.spawn_ticker().await;
        }
        if fired {
            self.emit_completion(&snapshot);
        }
    }

    /// Stops accumulation for good and returns the final state.
    pub async fn stop(&self) -> TrackerState {
        self.cancel_ticker().await;

        let (fired, snapshot) = {
            let mut state = self.state.lock().await;
            let fired = state.stop(Instant::now());
            (fired, state.clone())
        };
        if fired {
            self.emit_completion(&snapshot);
        }
        log_info!(
            "Viewing tracker stopped for session {} after {} ms active",
            self.session.session_id,
            snapshot.accumulated_active_ms
        );
        snapshot
    }

    pub async fn heartbeat(&self) {
        let (counted, fired, snapshot) = {
            let mut state = self.state.lock().await;
            let before = state.heartbeats;
            let fired = state.heartbeat(Instant::now());
            (state.heartbeats != before, fired, state.clone())
        };
        if counted {
            self.events.heartbeat(&self.session, &snapshot);
        }
        if fired {
            self.emit_completion(&snapshot);
        }
    }

    pub async fn set_visibility(&self, visible: bool) {
        let (fired, snapshot) = {
            let mut state = self.state.lock().await;
            let fired = state.set_visible(visible, Instant::now());
            (fired, state.clone())
        };
        log_debug!(
            "Session {} visibility -> {visible}",
            self.session.session_id
        );
        if fired {
            self.emit_completion(&snapshot);
        }
    }

    pub async fn set_idle(&self, idle: bool) {
        let (fired, snapshot) = {
            let mut state = self.state.lock().await;
            let fired = state.set_idle(idle, Instant::now());
            (fired, state.clone())
        };
        log_debug!("Session {} idle -> {idle}", self.session.session_id);
        if fired {
            self.emit_completion(&snapshot);
        }
    }

    pub async fn snapshot(&self) -> TrackerState {
        self.state.lock().await.clone()
    }

    async fn spawn_ticker(&self) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(handle) = ticker_guard.take() {
            handle.abort();
        }

        let tracker = self.clone();
        let token = self.cancel_token.clone();
        let period = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tracker.heartbeat().await,
                }
            }
        });

        *ticker_guard = Some(handle);
    }

    async fn cancel_ticker(&self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }

    fn emit_completion(&self, state: &TrackerState) {
        let event = CompletionEvent {
            session_id: self.session.session_id.clone(),
            activity_id: self.session.activity_id,
            user_id: self.session.user_id,
            study_uid: self.session.study_uid.clone(),
            accumulated_active_ms: state.accumulated_active_ms,
            completed_at: Utc::now(),
        };
        log_info!(
            "Session {} reached viewing threshold ({} ms)",
            event.session_id,
            event.accumulated_active_ms
        );
        self.events.viewing_completed(&event);
    }
}
