use async_trait::async_trait;

use crate::{
    db::{Annotation, AnnotationKey, Database, SaveOutcome},
    error::{ImagingError, Result},
};

/// Durable, optimistically versioned storage for annotation payloads.
#[async_trait]
pub trait AnnotationStore: Send + Sync {
    /// Persists `payload` if the stored version equals `expected_version`
    /// (0 when nothing is stored yet) and returns the new version.
    async fn save(
        &self,
        key: &AnnotationKey,
        payload: &serde_json::Value,
        expected_version: u64,
    ) -> Result<u64>;

    async fn load(&self, key: &AnnotationKey) -> Result<Option<Annotation>>;
}

fn unavailable(err: anyhow::Error) -> ImagingError {
    ImagingError::PersistenceUnavailable(format!("{err:#}"))
}

#[async_trait]
impl AnnotationStore for Database {
    async fn save(
        &self,
        key: &AnnotationKey,
        payload: &serde_json::Value,
        expected_version: u64,
    ) -> Result<u64> {
        match self
            .save_annotation(key, payload, expected_version)
            .await
            .map_err(unavailable)?
        {
            SaveOutcome::Saved { version, .. } => Ok(version),
            SaveOutcome::Conflict { current } => Err(ImagingError::VersionConflict {
                expected: expected_version,
                current,
            }),
        }
    }

    async fn load(&self, key: &AnnotationKey) -> Result<Option<Annotation>> {
        self.get_annotation(key).await.map_err(unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AnnotationKind;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_saves_with_same_version_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn AnnotationStore> =
            Arc::new(Database::new(dir.path().join("imaging.sqlite3")).unwrap());
        let key = AnnotationKey {
            activity_id: 1,
            user_id: 2,
            study_uid: "WSI_9".into(),
            kind: AnnotationKind::Annotation,
        };
        store.save(&key, &json!("base"), 0).await.unwrap();

        let tab_a = {
            let (store, key) = (store.clone(), key.clone());
            tokio::spawn(async move { store.save(&key, &json!("tab a"), 1).await })
        };
        let tab_b = {
            let (store, key) = (store.clone(), key.clone());
            tokio::spawn(async move { store.save(&key, &json!("tab b"), 1).await })
        };
        let results = [tab_a.await.unwrap(), tab_b.await.unwrap()];

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners, vec![&2]);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(ImagingError::VersionConflict { expected: 1, current: 2 })
        )));
    }
}
