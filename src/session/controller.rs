use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    annotations::{AnnotationStore, AnnotationWriter, PendingEdit, SaveStatus, StatusListener, WritePolicy},
    db::{Annotation, AnnotationKind, Database, ViewRecord},
    error::{ImagingError, Result},
    modality::{derive_modality, validate_study_uid},
    settings::{SettingsStore, ViewerSettings},
    tracker::{TrackerConfig, TrackerState, ViewingTracker},
};

use super::{SessionEvents, SessionState, ViewerSession};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// What the presentation layer reports once the viewer finished loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    /// User-presentable cause.
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session: ViewerSession,
    pub failure: Option<String>,
    pub save_status: SaveStatus,
    pub tracker: Option<TrackerState>,
    pub features: ViewerSettings,
}

/// Result of closing a session. `unsaved` is non-empty only when the store
/// could not take the final flush; those payloads are the caller's to keep.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseOutcome {
    pub session: ViewerSession,
    pub unsaved: Vec<PendingEdit>,
    pub view_recorded: bool,
}

struct SessionEntry {
    session: ViewerSession,
    failure: Option<String>,
    tracker: Option<ViewingTracker>,
    writer: AnnotationWriter,
    reached_active: bool,
}

/// Owns every open viewer session and routes presentation calls to the
/// tracker and the annotation writer of that session.
#[derive(Clone)]
pub struct SessionOrchestrator {
    sessions: Arc<Mutex<HashMap<String, SessionEntry>>>,
    store: Arc<dyn AnnotationStore>,
    events: Arc<dyn SessionEvents>,
    viewer: ViewerSettings,
    write_policy: WritePolicy,
    tracker_config: TrackerConfig,
    view_log: Option<Database>,
}

impl SessionOrchestrator {
    pub fn new(
        store: Arc<dyn AnnotationStore>,
        events: Arc<dyn SessionEvents>,
        viewer: ViewerSettings,
    ) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            store,
            events,
            viewer,
            write_policy: WritePolicy::default(),
            tracker_config: TrackerConfig::default(),
            view_log: None,
        }
    }

    /// Orchestrator tuned from the persisted settings.
    pub fn from_settings(
        store: Arc<dyn AnnotationStore>,
        events: Arc<dyn SessionEvents>,
        settings: &SettingsStore,
    ) -> Self {
        Self::new(store, events, settings.viewer())
            .with_write_policy(settings.write_policy())
            .with_tracker_config(settings.tracker())
    }

    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    pub fn with_tracker_config(mut self, config: TrackerConfig) -> Self {
        self.tracker_config = config;
        self
    }

    /// Closed sessions that reached `Active` are appended to this log.
    pub fn with_view_log(mut self, db: Database) -> Self {
        self.view_log = Some(db);
        self
    }

    pub fn features(&self) -> &ViewerSettings {
        &self.viewer
    }

    pub async fn open_session(
        &self,
        activity_id: i64,
        user_id: i64,
        study_uid: &str,
    ) -> Result<ViewerSession> {
        validate_study_uid(study_uid)?;

        let id = Uuid::new_v4().to_string();
        let mut session = ViewerSession {
            id: id.clone(),
            activity_id,
            user_id,
            study_uid: study_uid.to_string(),
            modality: derive_modality(study_uid),
            state: SessionState::Idle,
            started_at: Utc::now(),
            accumulated_active_ms: 0,
            last_heartbeat_at: None,
        };
        session.transition(SessionState::Loading, "open session")?;

        let listener: StatusListener = {
            let events = self.events.clone();
            let session_id = id.clone();
            Arc::new(move |status: &SaveStatus| events.save_status_changed(&session_id, status))
        };
        let writer = AnnotationWriter::new(
            activity_id,
            user_id,
            study_uid,
            self.store.clone(),
            self.write_policy.clone(),
            Some(listener),
        );

        self.sessions.lock().await.insert(
            id.clone(),
            SessionEntry {
                session: session.clone(),
                failure: None,
                tracker: None,
                writer,
                reached_active: false,
            },
        );

        log_info!(
            "Opened {} session {id} for activity {activity_id}, user {user_id}",
            session.modality
        );
        self.events.state_changed(&session);
        Ok(session)
    }

    /// Outcomes for ids that are no longer open are rejected with
    /// [`ImagingError::SessionNotFound`] and otherwise ignored, including a
    /// close that lands while a successful load is still being primed.
    pub async fn report_load_outcome(
        &self,
        session_id: &str,
        outcome: LoadOutcome,
    ) -> Result<ViewerSession> {
        match outcome {
            LoadOutcome::Loaded => self.activate(session_id).await,
            LoadOutcome::Failed(cause) => {
                let mut sessions = self.sessions.lock().await;
                let entry = sessions
                    .get_mut(session_id)
                    .ok_or_else(|| ImagingError::SessionNotFound(session_id.to_string()))?;
                entry.session.transition(SessionState::Failed, "fail")?;
                log_warn!("Session {session_id} failed to load: {cause}");
                entry.failure = Some(cause);
                self.events.state_changed(&entry.session);
                Ok(entry.session.clone())
            }
        }
    }

    async fn activate(&self, session_id: &str) -> Result<ViewerSession> {
        let writer = {
            let sessions = self.sessions.lock().await;
            let entry = sessions
                .get(session_id)
                .ok_or_else(|| ImagingError::SessionNotFound(session_id.to_string()))?;
            if !entry.session.state.can_transition_to(SessionState::Active) {
                return Err(ImagingError::InvalidTransition {
                    action: "activate",
                    state: entry.session.state.to_string(),
                });
            }
            entry.writer.clone()
        };

        // Learn the stored versions before edits are accepted, so the first
        // save presents the right one.
        if let Err(err) = writer.reload().await {
            log_warn!("Could not prime annotation versions for {session_id}: {err}");
        }

        let (session, tracker) = {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(session_id) else {
                log_info!("Discarding load outcome for session {session_id}, closed while loading");
                return Err(ImagingError::SessionNotFound(session_id.to_string()));
            };
            entry.session.transition(SessionState::Active, "activate")?;
            entry.failure = None;
            entry.reached_active = true;
            if self.viewer.track_viewing_time && entry.tracker.is_none() {
                entry.tracker = Some(ViewingTracker::new(
                    entry.session.reference(),
                    self.viewer.threshold_ms(),
                    self.tracker_config.clone(),
                    self.events.clone(),
                ));
            }
            // Emitted under the map lock so a racing close cannot be reported first.
            self.events.state_changed(&entry.session);
            (entry.session.clone(), entry.tracker.clone())
        };

        // A close between here and the start leaves the tracker stopped.
        if let Some(tracker) = tracker {
            tracker.start().await;
        }
        Ok(session)
    }

    /// Explicit retry of a failed load: `Failed -> Loading` on the same session.
    pub async fn retry_session(&self, session_id: &str) -> Result<ViewerSession> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| ImagingError::SessionNotFound(session_id.to_string()))?;
            if entry.session.state != SessionState::Failed {
                return Err(ImagingError::InvalidTransition {
                    action: "retry",
                    state: entry.session.state.to_string(),
                });
            }
            entry.session.transition(SessionState::Loading, "retry")?;
            entry.failure = None;
            self.events.state_changed(&entry.session);
            entry.session.clone()
        };

        log_info!("Retrying load for session {session_id}");
        Ok(session)
    }

    /// Stops tracking, flushes pending annotation writes and retires the id.
    pub async fn close_session(&self, session_id: &str) -> Result<CloseOutcome> {
        let entry = self
            .sessions
            .lock()
            .await
            .remove(session_id)
            .ok_or_else(|| ImagingError::SessionNotFound(session_id.to_string()))?;

        let SessionEntry {
            mut session,
            tracker,
            writer,
            reached_active,
            ..
        } = entry;

        let final_progress = match tracker {
            Some(tracker) => Some(tracker.stop().await),
            None => None,
        };
        if let Some(progress) = &final_progress {
            session.accumulated_active_ms = progress.accumulated_active_ms;
            session.last_heartbeat_at = progress.last_heartbeat_at;
        }

        let unsaved = writer.shutdown().await;
        if !unsaved.is_empty() {
            log_error!(
                "Session {session_id} closed with {} unsaved annotation payload(s)",
                unsaved.len()
            );
        }

        let view_recorded = if reached_active {
            self.record_view(&session, final_progress.as_ref()).await
        } else {
            false
        };

        session.transition(SessionState::Closed, "close")?;
        self.events.state_changed(&session);

        Ok(CloseOutcome {
            session,
            unsaved,
            view_recorded,
        })
    }

    async fn record_view(&self, session: &ViewerSession, progress: Option<&TrackerState>) -> bool {
        let (Some(db), Some(progress)) = (&self.view_log, progress) else {
            return false;
        };
        let record = ViewRecord {
            id: None,
            activity_id: session.activity_id,
            user_id: session.user_id,
            study_uid: session.study_uid.clone(),
            session_id: session.id.clone(),
            view_duration_ms: progress.accumulated_active_ms,
            completed: progress.completion_fired,
            viewed_at: Utc::now(),
        };
        match db.insert_view(&record).await {
            Ok(_) => true,
            Err(err) => {
                log_error!("Failed to log view for session {}: {err:#}", session.id);
                false
            }
        }
    }

    pub async fn record_annotation(&self, session_id: &str, payload: serde_json::Value) -> Result<()> {
        if !self.viewer.enable_annotations {
            return Err(ImagingError::FeatureDisabled("annotations"));
        }
        self.record(session_id, AnnotationKind::Annotation, payload).await
    }

    pub async fn record_measurement(&self, session_id: &str, payload: serde_json::Value) -> Result<()> {
        if !self.viewer.enable_measurements {
            return Err(ImagingError::FeatureDisabled("measurements"));
        }
        self.record(session_id, AnnotationKind::Measurement, payload).await
    }

    async fn record(
        &self,
        session_id: &str,
        kind: AnnotationKind,
        payload: serde_json::Value,
    ) -> Result<()> {
        let writer = self
            .with_active(session_id, "record annotations", |entry| entry.writer.clone())
            .await?;
        writer.submit(kind, payload).await
    }

    pub async fn heartbeat(&self, session_id: &str) -> Result<()> {
        if let Some(tracker) = self.tracker_for(session_id).await? {
            tracker.heartbeat().await;
        }
        Ok(())
    }

    pub async fn set_visibility(&self, session_id: &str, visible: bool) -> Result<()> {
        if let Some(tracker) = self.tracker_for(session_id).await? {
            tracker.set_visibility(visible).await;
        }
        Ok(())
    }

    pub async fn set_idle(&self, session_id: &str, idle: bool) -> Result<()> {
        if let Some(tracker) = self.tracker_for(session_id).await? {
            tracker.set_idle(idle).await;
        }
        Ok(())
    }

    /// Re-reads stored annotations after a conflict and clears the conflict
    /// markers. Local pending edits are kept and will be saved on top.
    pub async fn reload_annotations(&self, session_id: &str) -> Result<Vec<Annotation>> {
        let writer = self
            .with_active(session_id, "reload annotations", |entry| entry.writer.clone())
            .await?;
        writer.reload().await
    }

    pub async fn discard_pending(
        &self,
        session_id: &str,
        kind: AnnotationKind,
    ) -> Result<Option<PendingEdit>> {
        let writer = self
            .with_active(session_id, "discard annotations", |entry| entry.writer.clone())
            .await?;
        Ok(writer.discard_pending(kind).await)
    }

    pub async fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot> {
        let (mut session, failure, tracker, writer) = {
            let sessions = self.sessions.lock().await;
            let entry = sessions
                .get(session_id)
                .ok_or_else(|| ImagingError::SessionNotFound(session_id.to_string()))?;
            (
                entry.session.clone(),
                entry.failure.clone(),
                entry.tracker.clone(),
                entry.writer.clone(),
            )
        };

        let tracker = match tracker {
            Some(tracker) => Some(tracker.snapshot().await),
            None => None,
        };
        if let Some(progress) = &tracker {
            session.accumulated_active_ms = progress.accumulated_active_ms;
            session.last_heartbeat_at = progress.last_heartbeat_at;
        }

        Ok(SessionSnapshot {
            session,
            failure,
            save_status: writer.status().await,
            tracker,
            features: self.viewer.clone(),
        })
    }

    pub async fn open_session_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    async fn tracker_for(&self, session_id: &str) -> Result<Option<ViewingTracker>> {
        let sessions = self.sessions.lock().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| ImagingError::SessionNotFound(session_id.to_string()))?;
        Ok(entry.tracker.clone())
    }

    async fn with_active<T>(
        &self,
        session_id: &str,
        action: &'static str,
        f: impl FnOnce(&SessionEntry) -> T,
    ) -> Result<T> {
        let sessions = self.sessions.lock().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| ImagingError::SessionNotFound(session_id.to_string()))?;
        if entry.session.state != SessionState::Active {
            return Err(ImagingError::InvalidTransition {
                action,
                state: entry.session.state.to_string(),
            });
        }
        Ok(f(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        modality::Modality,
        session::{ChannelEvents, SessionEvent},
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn fast_policy() -> WritePolicy {
        WritePolicy {
            debounce_ms: 20,
            max_attempts: 2,
            initial_backoff_ms: 5,
            max_backoff_ms: 10,
        }
    }

    fn manual_ticks() -> TrackerConfig {
        TrackerConfig {
            heartbeat_interval_ms: 5_000,
            internal_ticker: false,
        }
    }

    fn setup(
        viewer: ViewerSettings,
    ) -> (
        tempfile::TempDir,
        SessionOrchestrator,
        Database,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("imaging.sqlite3")).unwrap();
        let (events, rx) = ChannelEvents::new();
        let orchestrator = SessionOrchestrator::new(Arc::new(db.clone()), Arc::new(events), viewer)
            .with_write_policy(fast_policy())
            .with_tracker_config(manual_ticks())
            .with_view_log(db.clone());
        (dir, orchestrator, db, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn modality_is_derived_on_open() {
        let (_dir, orchestrator, _db, _rx) = setup(ViewerSettings::default());

        let slide = orchestrator.open_session(1, 1, "WSI_12345").await.unwrap();
        assert_eq!(slide.modality, Modality::Pathology);
        assert_eq!(slide.state, SessionState::Loading);

        let ct = orchestrator
            .open_session(1, 1, "1.2.840.10008.5.1.4.1.1.2")
            .await
            .unwrap();
        assert_eq!(ct.modality, Modality::Dicom);
        assert_ne!(slide.id, ct.id);
    }

    #[tokio::test]
    async fn malformed_uid_is_rejected() {
        let (_dir, orchestrator, _db, _rx) = setup(ViewerSettings::default());
        let err = orchestrator.open_session(1, 1, "not a uid").await.unwrap_err();
        assert_eq!(err, ImagingError::InvalidStudyUid("not a uid".into()));
    }

    #[tokio::test]
    async fn full_lifecycle_saves_annotations_and_logs_view() {
        let (_dir, orchestrator, db, mut rx) = setup(ViewerSettings::default());
        let session = orchestrator.open_session(5, 9, "WSI_777").await.unwrap();

        let active = orchestrator
            .report_load_outcome(&session.id, LoadOutcome::Loaded)
            .await
            .unwrap();
        assert_eq!(active.state, SessionState::Active);

        orchestrator
            .record_annotation(&session.id, json!({"shapes": ["circle"]}))
            .await
            .unwrap();
        orchestrator
            .record_measurement(&session.id, json!([{"length_mm": 4.2}]))
            .await
            .unwrap();
        orchestrator.heartbeat(&session.id).await.unwrap();

        let closed = orchestrator.close_session(&session.id).await.unwrap();
        assert_eq!(closed.session.state, SessionState::Closed);
        assert!(closed.unsaved.is_empty());
        assert!(closed.view_recorded);

        let stored = db.annotations_for_study(5, 9, "WSI_777").await.unwrap();
        assert_eq!(stored.len(), 2);
        let views = db.views_for_activity(5).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].session_id, session.id);
        assert!(!views[0].completed);

        let states: Vec<SessionState> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::StateChanged(s) => Some(s.state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![SessionState::Loading, SessionState::Active, SessionState::Closed]
        );
    }

    #[tokio::test]
    async fn closed_session_ignores_late_load_outcome() {
        let (_dir, orchestrator, db, _rx) = setup(ViewerSettings::default());
        let session = orchestrator.open_session(1, 2, "1.2.3").await.unwrap();

        let closed = orchestrator.close_session(&session.id).await.unwrap();
        assert!(!closed.view_recorded);

        let err = orchestrator
            .report_load_outcome(&session.id, LoadOutcome::Loaded)
            .await
            .unwrap_err();
        assert_eq!(err, ImagingError::SessionNotFound(session.id.clone()));
        assert!(orchestrator.open_session_ids().await.is_empty());
        assert!(db.views_for_activity(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_is_stored_and_retry_reloads() {
        let (_dir, orchestrator, _db, _rx) = setup(ViewerSettings::default());
        let session = orchestrator.open_session(1, 2, "1.2.3").await.unwrap();

        orchestrator
            .report_load_outcome(&session.id, LoadOutcome::Failed("archive offline".into()))
            .await
            .unwrap();
        let snapshot = orchestrator.snapshot(&session.id).await.unwrap();
        assert_eq!(snapshot.session.state, SessionState::Failed);
        assert_eq!(snapshot.failure.as_deref(), Some("archive offline"));
        assert!(snapshot.tracker.is_none());

        let err = orchestrator
            .record_annotation(&session.id, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ImagingError::InvalidTransition { .. }));

        let retried = orchestrator.retry_session(&session.id).await.unwrap();
        assert_eq!(retried.state, SessionState::Loading);
        assert!(orchestrator.snapshot(&session.id).await.unwrap().failure.is_none());

        let active = orchestrator
            .report_load_outcome(&session.id, LoadOutcome::Loaded)
            .await
            .unwrap();
        assert_eq!(active.state, SessionState::Active);
    }

    #[tokio::test]
    async fn retry_requires_failed_state() {
        let (_dir, orchestrator, _db, _rx) = setup(ViewerSettings::default());
        let session = orchestrator.open_session(1, 2, "1.2.3").await.unwrap();
        let err = orchestrator.retry_session(&session.id).await.unwrap_err();
        assert_eq!(
            err,
            ImagingError::InvalidTransition {
                action: "retry",
                state: "loading".into(),
            }
        );
    }

    #[tokio::test]
    async fn disabled_measurements_are_refused() {
        let viewer = ViewerSettings {
            enable_measurements: false,
            ..ViewerSettings::default()
        };
        let (_dir, orchestrator, _db, _rx) = setup(viewer);
        let session = orchestrator.open_session(1, 2, "1.2.3").await.unwrap();
        orchestrator
            .report_load_outcome(&session.id, LoadOutcome::Loaded)
            .await
            .unwrap();

        let err = orchestrator
            .record_measurement(&session.id, json!([]))
            .await
            .unwrap_err();
        assert_eq!(err, ImagingError::FeatureDisabled("measurements"));
        orchestrator.record_annotation(&session.id, json!([])).await.unwrap();
    }

    #[tokio::test]
    async fn zero_threshold_completes_once_on_activation() {
        let viewer = ViewerSettings {
            min_viewing_time_secs: 0,
            ..ViewerSettings::default()
        };
        let (_dir, orchestrator, db, mut rx) = setup(viewer);
        let session = orchestrator.open_session(3, 4, "WSI_1").await.unwrap();
        orchestrator
            .report_load_outcome(&session.id, LoadOutcome::Loaded)
            .await
            .unwrap();
        for _ in 0..3 {
            orchestrator.heartbeat(&session.id).await.unwrap();
        }
        orchestrator.close_session(&session.id).await.unwrap();

        let completions = drain(&mut rx)
            .into_iter()
            .filter(|event| matches!(event, SessionEvent::ViewingCompleted(_)))
            .count();
        assert_eq!(completions, 1);
        assert!(db.views_for_activity(3).await.unwrap()[0].completed);
    }

    #[tokio::test]
    async fn tracking_disabled_means_no_tracker_and_no_view_log() {
        let viewer = ViewerSettings {
            track_viewing_time: false,
            ..ViewerSettings::default()
        };
        let (_dir, orchestrator, db, _rx) = setup(viewer);
        let session = orchestrator.open_session(3, 4, "1.2.3").await.unwrap();
        orchestrator
            .report_load_outcome(&session.id, LoadOutcome::Loaded)
            .await
            .unwrap();
        orchestrator.heartbeat(&session.id).await.unwrap();

        assert!(orchestrator.snapshot(&session.id).await.unwrap().tracker.is_none());
        let closed = orchestrator.close_session(&session.id).await.unwrap();
        assert!(!closed.view_recorded);
        assert!(db.views_for_activity(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn debounced_save_reports_unsaved_then_saved() {
        let (_dir, orchestrator, _db, mut rx) = setup(ViewerSettings::default());
        let session = orchestrator.open_session(1, 2, "1.2.3").await.unwrap();
        orchestrator
            .report_load_outcome(&session.id, LoadOutcome::Loaded)
            .await
            .unwrap();
        drain(&mut rx);

        orchestrator
            .record_annotation(&session.id, json!({"shapes": 1}))
            .await
            .unwrap();
        assert!(
            orchestrator
                .snapshot(&session.id)
                .await
                .unwrap()
                .save_status
                .unsaved_changes
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(
            !orchestrator
                .snapshot(&session.id)
                .await
                .unwrap()
                .save_status
                .unsaved_changes
        );

        let flags: Vec<bool> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::SaveStatusChanged { status, .. } => Some(status.unsaved_changes),
                _ => None,
            })
            .collect();
        assert_eq!(flags, vec![true, false]);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (_dir, orchestrator, _db, _rx) = setup(ViewerSettings::default());
        assert_eq!(
            orchestrator.set_visibility("missing", false).await.unwrap_err(),
            ImagingError::SessionNotFound("missing".into())
        );
        assert!(matches!(
            orchestrator.close_session("missing").await,
            Err(ImagingError::SessionNotFound(_))
        ));
    }

    /// Database store whose reads take a while, so a load can still be
    /// priming when the session is closed.
    struct SlowLoadStore {
        db: Database,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl AnnotationStore for SlowLoadStore {
        async fn save(
            &self,
            key: &crate::db::AnnotationKey,
            payload: &serde_json::Value,
            expected_version: u64,
        ) -> Result<u64> {
            self.db.save(key, payload, expected_version).await
        }

        async fn load(&self, key: &crate::db::AnnotationKey) -> Result<Option<Annotation>> {
            tokio::time::sleep(self.delay).await;
            self.db.load(key).await
        }
    }

    fn states(events: Vec<SessionEvent>) -> Vec<SessionState> {
        events
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::StateChanged(session) => Some(session.state),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn close_during_load_discards_the_outcome() {
        let db = Database::in_memory().unwrap();
        let store = SlowLoadStore {
            db: db.clone(),
            delay: Duration::from_millis(100),
        };
        let (events, mut rx) = ChannelEvents::new();
        let orchestrator =
            SessionOrchestrator::new(Arc::new(store), Arc::new(events), ViewerSettings::default())
                .with_write_policy(fast_policy())
                .with_tracker_config(TrackerConfig {
                    heartbeat_interval_ms: 10,
                    internal_ticker: true,
                })
                .with_view_log(db.clone());

        let session = orchestrator.open_session(3, 4, "WSI_555").await.unwrap();
        let pending = {
            let orchestrator = orchestrator.clone();
            let id = session.id.clone();
            tokio::spawn(async move { orchestrator.report_load_outcome(&id, LoadOutcome::Loaded).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let closed = orchestrator.close_session(&session.id).await.unwrap();
        assert!(!closed.view_recorded);

        let late = pending.await.unwrap();
        assert_eq!(late.unwrap_err(), ImagingError::SessionNotFound(session.id.clone()));
        assert!(orchestrator.open_session_ids().await.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = drain(&mut rx);
        assert!(!events
            .iter()
            .any(|event| matches!(event, SessionEvent::Heartbeat { .. } | SessionEvent::ViewingCompleted(_))));
        assert_eq!(states(events), vec![SessionState::Loading, SessionState::Closed]);
        assert!(db.views_for_activity(3).await.unwrap().is_empty());
    }

    /// Records whether the session map was free when completion was raised.
    #[derive(Default)]
    struct LockWatch {
        sessions: std::sync::OnceLock<Arc<Mutex<HashMap<String, SessionEntry>>>>,
        free_at_completion: std::sync::Mutex<Vec<bool>>,
    }

    impl SessionEvents for LockWatch {
        fn state_changed(&self, _session: &ViewerSession) {}

        fn viewing_completed(&self, _event: &crate::tracker::CompletionEvent) {
            let free = self
                .sessions
                .get()
                .map(|sessions| sessions.try_lock().is_ok())
                .unwrap_or(false);
            self.free_at_completion.lock().unwrap().push(free);
        }
    }

    #[tokio::test]
    async fn completion_is_raised_without_the_session_lock() {
        let watch = Arc::new(LockWatch::default());
        let viewer = ViewerSettings {
            min_viewing_time_secs: 0,
            ..ViewerSettings::default()
        };
        let orchestrator =
            SessionOrchestrator::new(Arc::new(Database::in_memory().unwrap()), watch.clone(), viewer)
                .with_tracker_config(manual_ticks());
        assert!(watch.sessions.set(orchestrator.sessions.clone()).is_ok());

        let session = orchestrator.open_session(1, 2, "WSI_1").await.unwrap();
        let active = orchestrator
            .report_load_outcome(&session.id, LoadOutcome::Loaded)
            .await
            .unwrap();
        assert_eq!(active.state, SessionState::Active);

        assert_eq!(*watch.free_at_completion.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn settings_file_tunes_the_orchestrator() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            json!({
                "viewer": {"enable_measurements": false, "min_viewing_time_secs": 12},
                "tracker": {"heartbeat_interval_ms": 250, "internal_ticker": false},
                "writes": {"debounce_ms": 40, "max_attempts": 7}
            })
            .to_string(),
        )
        .unwrap();
        let settings = SettingsStore::new(path).unwrap();
        let (events, _rx) = ChannelEvents::new();

        let orchestrator = SessionOrchestrator::from_settings(
            Arc::new(Database::in_memory().unwrap()),
            Arc::new(events),
            &settings,
        );

        let features = orchestrator.features();
        assert!(features.enable_annotations);
        assert!(!features.enable_measurements);
        assert_eq!(features.threshold_ms(), 12_000);
        assert_eq!(orchestrator.tracker_config.heartbeat_interval_ms, 250);
        assert!(!orchestrator.tracker_config.internal_ticker);
        assert_eq!(orchestrator.write_policy.debounce_ms, 40);
        assert_eq!(orchestrator.write_policy.max_attempts, 7);

        let session = orchestrator.open_session(1, 1, "WSI_9").await.unwrap();
        orchestrator
            .report_load_outcome(&session.id, LoadOutcome::Loaded)
            .await
            .unwrap();
        assert_eq!(
            orchestrator
                .record_measurement(&session.id, json!({"mm": 3}))
                .await
                .unwrap_err(),
            ImagingError::FeatureDisabled("measurements")
        );
    }
}
