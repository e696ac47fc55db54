use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use crate::{annotations::WritePolicy, error::ImagingError, tracker::TrackerConfig};

pub const ARCHIVE_URL_ENV: &str = "IMAGING_ARCHIVE_URL";
pub const ARCHIVE_USER_ENV: &str = "IMAGING_ARCHIVE_USER";
pub const ARCHIVE_PASSWORD_ENV: &str = "IMAGING_ARCHIVE_PASSWORD";

/// Connection settings for the Orthanc-compatible archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArchiveConfig {
    /// No endpoint means no catalog, not an error.
    pub endpoint: Option<String>,
    pub username: String,
    pub password: String,
    pub request_timeout_secs: u64,
    pub max_concurrent_requests: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            username: String::new(),
            password: String::new(),
            request_timeout_secs: 10,
            max_concurrent_requests: 4,
        }
    }
}

impl ArchiveConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(ARCHIVE_URL_ENV) {
            self.endpoint = if url.trim().is_empty() { None } else { Some(url) };
        }
        if let Ok(user) = std::env::var(ARCHIVE_USER_ENV) {
            self.username = user;
        }
        if let Ok(password) = std::env::var(ARCHIVE_PASSWORD_ENV) {
            self.password = password;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ImagingError> {
        if self.request_timeout_secs == 0 {
            return Err(ImagingError::Config(
                "request_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(ImagingError::Config(
                "max_concurrent_requests must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Per-activity viewer flags handed to the orchestrator at launch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ViewerSettings {
    pub enable_annotations: bool,
    pub enable_measurements: bool,
    pub track_viewing_time: bool,
    /// Seconds of active viewing required before completion fires.
    pub min_viewing_time_secs: u64,
}

impl Default for ViewerSettings {
    fn default() -> Self {
        Self {
            enable_annotations: true,
            enable_measurements: true,
            track_viewing_time: true,
            min_viewing_time_secs: 300,
        }
    }
}

impl ViewerSettings {
    pub fn threshold_ms(&self) -> u64 {
        self.min_viewing_time_secs.saturating_mul(1000)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct UserSettings {
    archive: ArchiveConfig,
    viewer: ViewerSettings,
    tracker: TrackerConfig,
    writes: WritePolicy,
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<UserSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse settings in {}", path.display()))?
        } else {
            UserSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn archive(&self) -> ArchiveConfig {
        self.read().archive.clone().with_env_overrides()
    }

    pub fn viewer(&self) -> ViewerSettings {
        self.read().viewer.clone()
    }

    pub fn tracker(&self) -> TrackerConfig {
        self.read().tracker.clone()
    }

    pub fn write_policy(&self) -> WritePolicy {
        self.read().writes.clone()
    }

    pub fn update_archive(&self, archive: ArchiveConfig) -> Result<()> {
        archive.validate()?;
        let mut guard = self.write();
        guard.archive = archive;
        self.persist(&guard)
    }

    pub fn update_viewer(&self, viewer: ViewerSettings) -> Result<()> {
        let mut guard = self.write();
        guard.viewer = viewer;
        self.persist(&guard)
    }

    fn read(&self) -> RwLockReadGuard<'_, UserSettings> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, UserSettings> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, data: &UserSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
