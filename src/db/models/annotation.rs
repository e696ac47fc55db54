//! Annotation and measurement records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Measurements and free-form annotations are versioned independently so a
/// measurement edit never overwrites drawn annotations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum AnnotationKind {
    Annotation,
    Measurement,
}

impl AnnotationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationKind::Annotation => "annotation",
            AnnotationKind::Measurement => "measurement",
        }
    }
}

/// Store key: one versioned document per (activity, user, study, kind).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationKey {
    pub activity_id: i64,
    pub user_id: i64,
    pub study_uid: String,
    pub kind: AnnotationKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    /// Assigned by the store on first persist.
    pub id: Option<i64>,
    pub activity_id: i64,
    pub user_id: i64,
    pub study_uid: String,
    pub kind: AnnotationKind,
    /// Opaque geometry + label blob.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

/// Result of a versioned write as seen by the database layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { id: i64, version: u64 },
    Conflict { current: u64 },
}
