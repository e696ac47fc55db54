pub mod annotations;
pub mod catalog;
pub mod db;
pub mod error;
pub mod modality;
pub mod session;
pub mod settings;
pub mod tracker;
pub mod utils;

use std::path::PathBuf;

use anyhow::Context;
use log::info;

pub use annotations::{AnnotationStore, AnnotationWriter, PendingEdit, SaveStatus, WritePolicy};
pub use catalog::{ArchiveApi, CatalogClient, OrthancArchive, StudyRecord};
pub use db::{Annotation, AnnotationKey, AnnotationKind, Database, PurgeSummary, ViewRecord};
pub use error::{ImagingError, Result};
pub use modality::{derive_modality, validate_study_uid, Modality, ViewerLaunch};
pub use session::{
    ChannelEvents, CloseOutcome, LoadOutcome, LogEvents, SessionEvent, SessionEvents,
    SessionOrchestrator, SessionSnapshot, SessionState, ViewerSession,
};
pub use settings::{ArchiveConfig, SettingsStore, ViewerSettings};
pub use tracker::{CompletionEvent, TrackerConfig, TrackerState, ViewingTracker};

/// Directory holding `settings.json` for the command-line entry point.
pub const DATA_DIR_ENV: &str = "IMAGING_DATA_DIR";

fn data_dir() -> PathBuf {
    std::env::var_os(DATA_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".imaging"))
}

/// Lists the configured archive's studies as JSON on stdout.
pub fn run() -> anyhow::Result<()> {
    utils::logging::init();
    info!("imaging-session starting up...");

    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    let settings = SettingsStore::new(data_dir.join("settings.json"))?;
    let client = CatalogClient::from_config(&settings.archive())?;
    if !client.is_configured() {
        info!("No archive endpoint configured; catalog is empty");
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let studies = runtime.block_on(client.list_studies())?;
    info!("Catalog resolved {} studies", studies.len());

    println!("{}", serde_json::to_string_pretty(&studies)?);
    Ok(())
}
