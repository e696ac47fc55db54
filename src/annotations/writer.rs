//! Debounced, retrying writer for one session's annotation documents.
//!
//! Edits replace the pending payload of their kind and (re)arm a debounce
//! timer; when it expires the latest payload of each kind is saved against the
//! last version this writer saw. Transient store failures are retried with
//! exponential backoff. Anything that still cannot be saved stays pending in
//! memory and is reported through [`SaveStatus`].

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    db::{Annotation, AnnotationKey, AnnotationKind},
    error::{ImagingError, Result},
};

use super::store::AnnotationStore;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const ALL_KINDS: [AnnotationKind; 2] = [AnnotationKind::Annotation, AnnotationKind::Measurement];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WritePolicy {
    pub debounce_ms: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            debounce_ms: 750,
            max_attempts: 4,
            initial_backoff_ms: 250,
            max_backoff_ms: 4_000,
        }
    }
}

impl WritePolicy {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Delay before retry number `attempt` (1-based): doubles each time, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// A local edit that has not been persisted yet.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingEdit {
    pub kind: AnnotationKind,
    pub payload: serde_json::Value,
    pub edited_at: DateTime<Utc>,
    #[serde(skip)]
    revision: u64,
}

/// "Not yet saved" indicator exposed to the presentation layer.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SaveStatus {
    pub unsaved_changes: bool,
    pub pending: Vec<AnnotationKind>,
    /// Kinds whose last save hit a version conflict, with the store's version.
    pub conflicts: Vec<(AnnotationKind, u64)>,
    pub last_error: Option<String>,
}

pub type StatusListener = Arc<dyn Fn(&SaveStatus) + Send + Sync>;

#[derive(Default)]
struct WriterState {
    pending: HashMap<AnnotationKind, PendingEdit>,
    versions: HashMap<AnnotationKind, u64>,
    conflicts: HashMap<AnnotationKind, u64>,
    last_error: Option<ImagingError>,
    edit_seq: u64,
    closed: bool,
}

impl WriterState {
    fn status(&self) -> SaveStatus {
        let mut pending: Vec<_> = self.pending.keys().copied().collect();
        pending.sort_by_key(|kind| kind.as_str());
        let mut conflicts: Vec<_> = self.conflicts.iter().map(|(k, v)| (*k, *v)).collect();
        conflicts.sort_by_key(|(kind, _)| kind.as_str());

        SaveStatus {
            unsaved_changes: !self.pending.is_empty(),
            pending,
            conflicts,
            last_error: self.last_error.as_ref().map(ToString::to_string),
        }
    }
}

struct WriterShared {
    activity_id: i64,
    user_id: i64,
    study_uid: String,
    store: Arc<dyn AnnotationStore>,
    policy: WritePolicy,
    state: Mutex<WriterState>,
    flush_lock: Mutex<()>,
    listener: Option<StatusListener>,
}

#[derive(Clone)]
pub struct AnnotationWriter {
    shared: Arc<WriterShared>,
}

impl AnnotationWriter {
    pub fn new(
        activity_id: i64,
        user_id: i64,
        study_uid: impl Into<String>,
        store: Arc<dyn AnnotationStore>,
        policy: WritePolicy,
        listener: Option<StatusListener>,
    ) -> Self {
        Self {
            shared: Arc::new(WriterShared {
                activity_id,
                user_id,
                study_uid: study_uid.into(),
                store,
                policy,
                state: Mutex::new(WriterState::default()),
                flush_lock: Mutex::new(()),
                listener,
            }),
        }
    }

    fn key(&self, kind: AnnotationKind) -> AnnotationKey {
        AnnotationKey {
            activity_id: self.shared.activity_id,
            user_id: self.shared.user_id,
            study_uid: self.shared.study_uid.clone(),
            kind,
        }
    }

    /// Queues `payload` as the latest state of `kind` and arms the debounce timer.
    pub async fn submit(&self, kind: AnnotationKind, payload: serde_json::Value) -> Result<()> {
        let (seq, status) = {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return Err(ImagingError::InvalidTransition {
                    action: "record annotations",
                    state: "closed".into(),
                });
            }
            state.edit_seq += 1;
            let revision = state.edit_seq;
            state.pending.insert(
                kind,
                PendingEdit {
                    kind,
                    payload,
                    edited_at: Utc::now(),
                    revision,
                },
            );
            (revision, state.status())
        };

        self.notify(&status);
        self.schedule_flush(seq);
        Ok(())
    }

    fn schedule_flush(&self, seq: u64) {
        let writer = self.clone();
        let delay = self.shared.policy.debounce();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if writer.shared.state.lock().await.edit_seq != seq {
                // A newer edit re-armed the timer, or the writer shut down.
                return;
            }
            if let Err(err) = writer.flush().await {
                log_warn!("debounced annotation save failed: {err}");
            }
        });
    }

    /// Saves every pending, non-conflicted kind now.
    ///
    /// Returns the first failure; failed payloads stay pending.
    pub async fn flush(&self) -> Result<()> {
        let _flush = self.shared.flush_lock.lock().await;

        let state = self.shared.state.lock().await;
        let batch: Vec<(PendingEdit, u64)> = state
            .pending
            .values()
            .filter(|edit| !state.conflicts.contains_key(&edit.kind))
            .map(|edit| {
                let version = state.versions.get(&edit.kind).copied().unwrap_or(0);
                (edit.clone(), version)
            })
            .collect();
        drop(state);
        if batch.is_empty() {
            return Ok(());
        }

        let mut first_error = None;
        for (edit, expected) in batch {
            let outcome = self.save_with_retry(edit.kind, &edit.payload, expected).await;

            let mut state = self.shared.state.lock().await;
            match outcome {
                Ok(version) => {
                    state.versions.insert(edit.kind, version);
                    let superseded = state
                        .pending
                        .get(&edit.kind)
                        .map(|current| current.revision != edit.revision)
                        .unwrap_or(false);
                    if !superseded {
                        state.pending.remove(&edit.kind);
                    }
                    state.last_error = None;
                    log_debug!(
                        "saved {} for study {} at version {version}",
                        edit.kind.as_str(),
                        self.shared.study_uid
                    );
                }
                Err(err) => {
                    if let ImagingError::VersionConflict { current, .. } = &err {
                        log_warn!(
                            "{} for study {} conflicts with stored version {current}",
                            edit.kind.as_str(),
                            self.shared.study_uid
                        );
                        state.conflicts.insert(edit.kind, *current);
                    } else {
                        log_error!(
                            "giving up on saving {} for study {}: {err}",
                            edit.kind.as_str(),
                            self.shared.study_uid
                        );
                    }
                    state.last_error = Some(err.clone());
                    first_error.get_or_insert(err);
                }
            }
        }

        let status = self.shared.state.lock().await.status();
        self.notify(&status);

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn save_with_retry(
        &self,
        kind: AnnotationKind,
        payload: &serde_json::Value,
        expected_version: u64,
    ) -> Result<u64> {
        let key = self.key(kind);
        let max_attempts = self.shared.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.shared.store.save(&key, payload, expected_version).await {
                Ok(version) => return Ok(version),
                Err(err @ ImagingError::PersistenceUnavailable(_)) if attempt < max_attempts => {
                    let delay = self.shared.policy.backoff(attempt);
                    log_warn!(
                        "annotation save attempt {attempt}/{max_attempts} failed ({err}); retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Re-reads every kind from the store and rebases pending edits onto the
    /// stored versions. Clears recorded conflicts; does not save anything.
    pub async fn reload(&self) -> Result<Vec<Annotation>> {
        let mut stored = Vec::new();
        let mut versions = HashMap::new();
        for kind in ALL_KINDS {
            let annotation = self.shared.store.load(&self.key(kind)).await?;
            versions.insert(kind, annotation.as_ref().map(|a| a.version).unwrap_or(0));
            stored.extend(annotation);
        }

        let status = {
            let mut state = self.shared.state.lock().await;
            state.versions = versions;
            state.conflicts.clear();
            state.last_error = None;
            state.status()
        };
        self.notify(&status);
        log_info!(
            "reloaded {} stored documents for study {}",
            stored.len(),
            self.shared.study_uid
        );
        Ok(stored)
    }

    /// Drops the local edit of `kind`, if any. Returns what was dropped.
    pub async fn discard_pending(&self, kind: AnnotationKind) -> Option<PendingEdit> {
        let (dropped, status) = {
            let mut state = self.shared.state.lock().await;
            let dropped = state.pending.remove(&kind);
            state.conflicts.remove(&kind);
            (dropped, state.status())
        };
        self.notify(&status);
        dropped
    }

    /// Final flush for session close. Whatever could not be saved is handed
    /// back to the caller instead of being dropped.
    pub async fn shutdown(&self) -> Vec<PendingEdit> {
        {
            let mut state = self.shared.state.lock().await;
            state.closed = true;
            // Invalidate any armed debounce timer.
            state.edit_seq += 1;
        }

        if let Err(err) = self.flush().await {
            log_warn!(
                "closing with unsaved annotations for study {}: {err}",
                self.shared.study_uid
            );
        }

        let state = self.shared.state.lock().await;
        let mut remaining: Vec<PendingEdit> = state.pending.values().cloned().collect();
        remaining.sort_by_key(|edit| edit.revision);
        remaining
    }

    pub async fn status(&self) -> SaveStatus {
        self.shared.state.lock().await.status()
    }

    pub async fn has_unsaved(&self) -> bool {
        !self.shared.state.lock().await.pending.is_empty()
    }

    pub async fn known_version(&self, kind: AnnotationKind) -> u64 {
        self.shared
            .state
            .lock()
            .await
            .versions
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    fn notify(&self, status: &SaveStatus) {
        if let Some(listener) = &self.shared.listener {
            listener(status);
        }
    }
}
