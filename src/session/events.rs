//! Outbound notifications to the presentation surface.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::{annotations::SaveStatus, tracker::{CompletionEvent, TrackerState}};

use super::{SessionRef, ViewerSession};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

/// Sink for everything the orchestrator reports while sessions run.
///
/// `state_changed` may run while the session map is locked, so each session's
/// transitions arrive in order. Every other callback runs with no session lock
/// held. Implementations must not block or call back into the orchestrator.
pub trait SessionEvents: Send + Sync {
    fn state_changed(&self, session: &ViewerSession);

    fn heartbeat(&self, _session: &SessionRef, _tracker: &TrackerState) {}

    fn save_status_changed(&self, _session_id: &str, _status: &SaveStatus) {}

    /// Raised at most once per session.
    fn viewing_completed(&self, event: &CompletionEvent);
}

/// Writes events to the log and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEvents;

impl SessionEvents for LogEvents {
    fn state_changed(&self, session: &ViewerSession) {
        log_info!(
            "Session {} ({} {}) is now {}",
            session.id,
            session.modality,
            session.study_uid,
            session.state
        );
    }

    fn save_status_changed(&self, session_id: &str, status: &SaveStatus) {
        log_debug!(
            "Session {session_id} unsaved changes: {}",
            status.unsaved_changes
        );
    }

    fn viewing_completed(&self, event: &CompletionEvent) {
        log_info!(
            "Viewing completed for activity {} user {} ({} ms)",
            event.activity_id,
            event.user_id,
            event.accumulated_active_ms
        );
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum SessionEvent {
    StateChanged(ViewerSession),
    Heartbeat {
        session_id: String,
        active_ms: u64,
        completion_fired: bool,
    },
    SaveStatusChanged {
        session_id: String,
        status: SaveStatus,
    },
    ViewingCompleted(CompletionEvent),
}

/// Forwards events into an unbounded channel, for hosts that poll.
#[derive(Debug, Clone)]
pub struct ChannelEvents {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelEvents {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SessionEvent) {
        // Receiver gone means the host stopped listening.
        let _ = self.tx.send(event);
    }
}

impl SessionEvents for ChannelEvents {
    fn state_changed(&self, session: &ViewerSession) {
        self.send(SessionEvent::StateChanged(session.clone()));
    }

    fn heartbeat(&self, session: &SessionRef, tracker: &TrackerState) {
        self.send(SessionEvent::Heartbeat {
            session_id: session.session_id.clone(),
            active_ms: tracker.accumulated_active_ms,
            completion_fired: tracker.completion_fired,
        });
    }

    fn save_status_changed(&self, session_id: &str, status: &SaveStatus) {
        self.send(SessionEvent::SaveStatusChanged {
            session_id: session_id.to_string(),
            status: status.clone(),
        });
    }

    fn viewing_completed(&self, event: &CompletionEvent) {
        self.send(SessionEvent::ViewingCompleted(event.clone()));
    }
}
