use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One closed viewing session, appended to the view log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ViewRecord {
    pub id: Option<i64>,
    pub activity_id: i64,
    pub user_id: i64,
    pub study_uid: String,
    pub session_id: String,
    pub view_duration_ms: u64,
    pub completed: bool,
    pub viewed_at: DateTime<Utc>,
}
