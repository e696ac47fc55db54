use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{parse_datetime, parse_kind, parse_payload, to_i64, to_u64},
    models::{Annotation, AnnotationKey, SaveOutcome},
};

const SELECT_COLUMNS: &str =
    "SELECT id, activity_id, user_id, study_uid, kind, payload, version, created_at, updated_at
     FROM annotations";

fn row_to_annotation(row: &Row) -> Result<Annotation> {
    let kind: String = row.get("kind")?;
    let payload: String = row.get("payload")?;
    let version: i64 = row.get("version")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Annotation {
        id: Some(row.get("id")?),
        activity_id: row.get("activity_id")?,
        user_id: row.get("user_id")?,
        study_uid: row.get("study_uid")?,
        kind: parse_kind(&kind)?,
        payload: parse_payload(&payload)?,
        version: to_u64(version, "version")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

impl Database {
    /// Versioned write. The version check and the write share one transaction on
    /// the DB thread, so two writers presenting the same version cannot both win.
    pub async fn save_annotation(
        &self,
        key: &AnnotationKey,
        payload: &serde_json::Value,
        expected_version: u64,
    ) -> Result<SaveOutcome> {
        let key = key.clone();
        let payload = serde_json::to_string(payload)?;
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let current: Option<(i64, i64)> = tx
                .query_row(
                    "SELECT id, version FROM annotations
                     WHERE activity_id = ?1 AND user_id = ?2 AND study_uid = ?3 AND kind = ?4",
                    params![key.activity_id, key.user_id, key.study_uid, key.kind.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let now = Utc::now().to_rfc3339();
            let outcome = match current {
                None if expected_version == 0 => {
                    tx.execute(
                        "INSERT INTO annotations
                             (activity_id, user_id, study_uid, kind, payload, version, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
                        params![
                            key.activity_id,
                            key.user_id,
                            key.study_uid,
                            key.kind.as_str(),
                            payload,
                            now,
                        ],
                    )?;
                    SaveOutcome::Saved {
                        id: tx.last_insert_rowid(),
                        version: 1,
                    }
                }
                None => SaveOutcome::Conflict { current: 0 },
                Some((id, version)) => {
                    let version = to_u64(version, "version")?;
                    if version != expected_version {
                        SaveOutcome::Conflict { current: version }
                    } else {
                        let next = version + 1;
                        tx.execute(
                            "UPDATE annotations
                             SET payload = ?1, version = ?2, updated_at = ?3
                             WHERE id = ?4 AND version = ?5",
                            params![payload, to_i64(next)?, now, id, to_i64(version)?],
                        )?;
                        SaveOutcome::Saved { id, version: next }
                    }
                }
            };

            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    pub async fn get_annotation(&self, key: &AnnotationKey) -> Result<Option<Annotation>> {
        let key = key.clone();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS}
                 WHERE activity_id = ?1 AND user_id = ?2 AND study_uid = ?3 AND kind = ?4"
            ))?;
            let mut rows = stmt.query(params![
                key.activity_id,
                key.user_id,
                key.study_uid,
                key.kind.as_str()
            ])?;
            let annotation = match rows.next()? {
                Some(row) => Some(row_to_annotation(row)?),
                None => None,
            };
            Ok(annotation)
        })
        .await
    }

    /// Every stored kind for one learner's study, oldest first.
    pub async fn annotations_for_study(
        &self,
        activity_id: i64,
        user_id: i64,
        study_uid: &str,
    ) -> Result<Vec<Annotation>> {
        let study_uid = study_uid.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS}
                 WHERE activity_id = ?1 AND user_id = ?2 AND study_uid = ?3
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let mut rows = stmt.query(params![activity_id, user_id, study_uid])?;
            let mut annotations = Vec::new();
            while let Some(row) = rows.next()? {
                annotations.push(row_to_annotation(row)?);
            }
            Ok(annotations)
        })
        .await
    }
}
