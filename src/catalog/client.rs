use std::{collections::HashMap, time::Duration};

use futures::{stream, StreamExt};

use crate::{
    error::{ImagingError, Result},
    settings::ArchiveConfig,
};

use super::{
    archive::{ArchiveApi, OrthancArchive},
    models::StudyRecord,
};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Resolves the archive's flat identifier list into normalized study records.
///
/// One list request, then one detail request per identifier with at most
/// `max_concurrent` in flight. Detail failures are logged and skipped; only a
/// failed list request fails the call. Nothing is cached here.
pub struct CatalogClient<A = OrthancArchive> {
    archive: Option<A>,
    max_concurrent: usize,
    request_timeout: Duration,
}

impl CatalogClient<OrthancArchive> {
    /// A config without an endpoint yields a client that lists nothing.
    pub fn from_config(config: &ArchiveConfig) -> Result<Self> {
        config.validate()?;
        let archive = match config.endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => Some(OrthancArchive::new(endpoint, config)?),
            _ => None,
        };

        Ok(Self {
            archive,
            max_concurrent: config.max_concurrent_requests,
            request_timeout: config.request_timeout(),
        })
    }
}

impl<A: ArchiveApi> CatalogClient<A> {
    pub fn with_archive(archive: A, max_concurrent: usize, request_timeout: Duration) -> Self {
        Self {
            archive: Some(archive),
            max_concurrent: max_concurrent.max(1),
            request_timeout,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.archive.is_some()
    }

    pub async fn list_studies(&self) -> Result<Vec<StudyRecord>> {
        let Some(archive) = &self.archive else {
            return Ok(Vec::new());
        };

        let ids = self
            .with_timeout("study list", archive.list_study_ids())
            .await?;
        let requested = ids.len();

        // `buffered` keeps listing order so the dedup below is last-write-wins by position.
        let resolved: Vec<(String, Result<StudyRecord>)> = stream::iter(ids)
            .map(|id| async move {
                let outcome = self.resolve(archive, &id).await;
                (id, outcome)
            })
            .buffered(self.max_concurrent)
            .collect()
            .await;

        let mut records: Vec<StudyRecord> = Vec::with_capacity(resolved.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut skipped = 0usize;

        for (id, outcome) in resolved {
            match outcome {
                Ok(record) => match positions.get(&record.uid) {
                    Some(&index) => records[index] = record,
                    None => {
                        positions.insert(record.uid.clone(), records.len());
                        records.push(record);
                    }
                },
                Err(err) => {
                    skipped += 1;
                    log_warn!("skipping study {id}: {err}");
                }
            }
        }

        log_info!(
            "catalog resolved {} of {} studies ({} skipped)",
            records.len(),
            requested,
            skipped
        );
        Ok(records)
    }

    async fn resolve(&self, archive: &A, id: &str) -> Result<StudyRecord> {
        let detail = self
            .with_timeout("study detail", archive.fetch_study(id))
            .await?;
        StudyRecord::from_detail(id, detail).ok_or_else(|| {
            ImagingError::ArchiveProtocolError(format!("study {id} has no StudyInstanceUID"))
        })
    }

    async fn with_timeout<T>(
        &self,
        what: &str,
        request: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| {
                ImagingError::ArchiveUnreachable(format!(
                    "{what} timed out after {:?}",
                    self.request_timeout
                ))
            })?
    }
}
