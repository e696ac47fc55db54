use thiserror::Error;

/// Errors surfaced by the imaging session core.
///
/// Every variant is scoped to a single operation or session; none of them is
/// fatal to the process.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImagingError {
    /// Transport failure or timeout talking to the archive.
    #[error("imaging archive unreachable: {0}")]
    ArchiveUnreachable(String),

    /// The archive rejected the configured credentials.
    #[error("imaging archive rejected credentials (HTTP {0})")]
    ArchiveAuthError(u16),

    /// Malformed or unexpected catalog response.
    #[error("unexpected imaging archive response: {0}")]
    ArchiveProtocolError(String),

    /// The stored version no longer matches the version the writer based its edit on.
    #[error("annotation version conflict: expected {expected}, store has {current}")]
    VersionConflict { expected: u64, current: u64 },

    /// The annotation store could not be reached or failed to commit.
    #[error("annotation store unavailable: {0}")]
    PersistenceUnavailable(String),

    /// The session id is unknown or the session has been closed.
    #[error("viewer session {0} not found")]
    SessionNotFound(String),

    #[error("cannot {action} while session is {state}")]
    InvalidTransition { action: &'static str, state: String },

    #[error("{0} are disabled for this activity")]
    FeatureDisabled(&'static str),

    #[error("invalid study UID '{0}'")]
    InvalidStudyUid(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ImagingError {
    /// Transient errors are worth retrying; everything else needs a caller decision.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ImagingError::ArchiveUnreachable(_) | ImagingError::PersistenceUnavailable(_)
        )
    }
}

impl From<reqwest::Error> for ImagingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ImagingError::ArchiveProtocolError(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return ImagingError::ArchiveAuthError(status.as_u16());
            }
        }
        ImagingError::ArchiveUnreachable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ImagingError>;
