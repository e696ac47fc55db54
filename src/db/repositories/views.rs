use anyhow::Result;
use rusqlite::{params, Row};

use crate::db::{
    connection::Database,
    helpers::{parse_datetime, to_i64, to_u64},
    models::ViewRecord,
};

fn row_to_view(row: &Row) -> Result<ViewRecord> {
    let duration: i64 = row.get("view_duration_ms")?;
    let viewed_at: String = row.get("viewed_at")?;

    Ok(ViewRecord {
        id: Some(row.get("id")?),
        activity_id: row.get("activity_id")?,
        user_id: row.get("user_id")?,
        study_uid: row.get("study_uid")?,
        session_id: row.get("session_id")?,
        view_duration_ms: to_u64(duration, "view_duration_ms")?,
        completed: row.get("completed")?,
        viewed_at: parse_datetime(&viewed_at, "viewed_at")?,
    })
}

impl Database {
    pub async fn insert_view(&self, view: &ViewRecord) -> Result<i64> {
        let record = view.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO views (activity_id, user_id, study_uid, session_id, view_duration_ms, completed, viewed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.activity_id,
                    record.user_id,
                    record.study_uid,
                    record.session_id,
                    to_i64(record.view_duration_ms)?,
                    record.completed,
                    record.viewed_at.to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn views_for_activity(&self, activity_id: i64) -> Result<Vec<ViewRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, activity_id, user_id, study_uid, session_id, view_duration_ms, completed, viewed_at
                 FROM views
                 WHERE activity_id = ?1
                 ORDER BY viewed_at ASC, id ASC",
            )?;
            let mut rows = stmt.query(params![activity_id])?;
            let mut views = Vec::new();
            while let Some(row) = rows.next()? {
                views.push(row_to_view(row)?);
            }
            Ok(views)
        })
        .await
    }
}
