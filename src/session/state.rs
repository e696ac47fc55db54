use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ImagingError, Result},
    modality::Modality,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    #[default]
    Idle,
    Loading,
    Active,
    Failed,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Loading => "loading",
            SessionState::Active => "active",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        }
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Loading)
                | (Loading, Active)
                | (Loading, Failed)
                | (Failed, Loading)
                | (Idle, Closed)
                | (Loading, Closed)
                | (Active, Closed)
                | (Failed, Closed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity shared with the tracker and the annotation writer. Neither of them
/// owns the session.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: String,
    pub activity_id: i64,
    pub user_id: i64,
    pub study_uid: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ViewerSession {
    pub id: String,
    pub activity_id: i64,
    pub user_id: i64,
    pub study_uid: String,
    pub modality: Modality,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub accumulated_active_ms: u64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl ViewerSession {
    pub fn reference(&self) -> SessionRef {
        SessionRef {
            session_id: self.id.clone(),
            activity_id: self.activity_id,
            user_id: self.user_id,
            study_uid: self.study_uid.clone(),
        }
    }

    pub(crate) fn transition(&mut self, next: SessionState, action: &'static str) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ImagingError::InvalidTransition {
                action,
                state: self.state.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }
}
