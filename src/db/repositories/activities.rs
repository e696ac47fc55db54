use anyhow::Result;
use log::info;
use rusqlite::params;

use crate::db::connection::Database;

/// Row counts removed by [`Database::purge_activity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PurgeSummary {
    pub views: usize,
    pub annotations: usize,
}

impl Database {
    /// Removes all learner data owned by an activity when the host deletes it.
    pub async fn purge_activity(&self, activity_id: i64) -> Result<PurgeSummary> {
        let summary = self
            .execute(move |conn| {
                let tx = conn.transaction()?;
                let views = tx.execute("DELETE FROM views WHERE activity_id = ?1", params![activity_id])?;
                let annotations = tx.execute(
                    "DELETE FROM annotations WHERE activity_id = ?1",
                    params![activity_id],
                )?;
                tx.commit()?;
                Ok(PurgeSummary { views, annotations })
            })
            .await?;

        info!(
            "Purged activity {activity_id}: {} views, {} annotations",
            summary.views, summary.annotations
        );
        Ok(summary)
    }
}
