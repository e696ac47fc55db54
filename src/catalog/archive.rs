//! Orthanc-compatible archive transport.

use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};

use crate::{
    error::{ImagingError, Result},
    settings::ArchiveConfig,
};

use super::models::StudyDetail;

const USER_AGENT: &str = concat!("imaging-session/", env!("CARGO_PKG_VERSION"));

const ENABLE_LOGS: bool = true;

use crate::log_debug;

/// The two catalog calls the client needs from an archive.
#[async_trait]
pub trait ArchiveApi: Send + Sync {
    /// `GET /studies`: opaque archive identifiers.
    async fn list_study_ids(&self) -> Result<Vec<String>>;

    /// `GET /studies/{id}`: tag groups for one study.
    async fn fetch_study(&self, study_id: &str) -> Result<StudyDetail>;
}

pub struct OrthancArchive {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
}

impl OrthancArchive {
    pub fn new(endpoint: &str, config: &ArchiveConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| ImagingError::Config(format!("failed to build HTTP client: {err}")))?;

        let base_url = Url::parse(endpoint.trim())
            .map_err(|err| ImagingError::Config(format!("invalid archive endpoint '{endpoint}': {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ImagingError::Config(format!(
                "archive endpoint '{endpoint}' cannot carry a path"
            )));
        }

        Ok(Self {
            http,
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    /// Appends `segments` to the endpoint path, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get(&self, segments: &[&str]) -> Result<Response> {
        let url = self.endpoint(segments);
        log_debug!("GET {url}");

        let response = self
            .http
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        check_status(response.status())?;
        Ok(response)
    }
}

fn check_status(status: StatusCode) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(ImagingError::ArchiveAuthError(status.as_u16()))
        }
        status if status.is_server_error() => Err(ImagingError::ArchiveUnreachable(format!(
            "archive answered HTTP {status}"
        ))),
        status => Err(ImagingError::ArchiveProtocolError(format!(
            "archive answered HTTP {status}"
        ))),
    }
}

/// Undecodable bodies are protocol errors; a body cut off by a timeout is not.
fn body_error(what: &str, err: reqwest::Error) -> ImagingError {
    match ImagingError::from(err) {
        ImagingError::ArchiveProtocolError(detail) => {
            ImagingError::ArchiveProtocolError(format!("{what}: {detail}"))
        }
        other => other,
    }
}

#[async_trait]
impl ArchiveApi for OrthancArchive {
    async fn list_study_ids(&self) -> Result<Vec<String>> {
        self.get(&["studies"])
            .await?
            .json::<Vec<String>>()
            .await
            .map_err(|err| body_error("study list", err))
    }

    async fn fetch_study(&self, study_id: &str) -> Result<StudyDetail> {
        self.get(&["studies", study_id])
            .await?
            .json::<StudyDetail>()
            .await
            .map_err(|err| body_error(&format!("study {study_id}"), err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(check_status(StatusCode::OK).is_ok());
        assert_eq!(
            check_status(StatusCode::UNAUTHORIZED),
            Err(ImagingError::ArchiveAuthError(401))
        );
        assert!(matches!(
            check_status(StatusCode::BAD_GATEWAY),
            Err(ImagingError::ArchiveUnreachable(_))
        ));
        assert!(matches!(
            check_status(StatusCode::NOT_FOUND),
            Err(ImagingError::ArchiveProtocolError(_))
        ));
    }

    #[test]
    fn trailing_slash_does_not_double_up() {
        let config = ArchiveConfig::default();
        for endpoint in ["http://pacs.local:8042", "http://pacs.local:8042/"] {
            let archive = OrthancArchive::new(endpoint, &config).unwrap();
            assert_eq!(
                archive.endpoint(&["studies"]).as_str(),
                "http://pacs.local:8042/studies"
            );
        }
    }

    #[test]
    fn endpoint_prefix_path_is_kept() {
        let archive = OrthancArchive::new("https://gw.example/orthanc/", &ArchiveConfig::default()).unwrap();
        assert_eq!(
            archive.endpoint(&["studies", "abc"]).as_str(),
            "https://gw.example/orthanc/studies/abc"
        );
    }

    #[test]
    fn study_ids_are_percent_encoded() {
        let archive = OrthancArchive::new("http://pacs.local:8042", &ArchiveConfig::default()).unwrap();
        assert_eq!(
            archive.endpoint(&["studies", "a/b?c#d"]).as_str(),
            "http://pacs.local:8042/studies/a%2Fb%3Fc%23d"
        );
    }

    #[test]
    fn unparsable_endpoint_is_a_config_error() {
        assert!(matches!(
            OrthancArchive::new("pacs without scheme", &ArchiveConfig::default()),
            Err(ImagingError::Config(_))
        ));
    }
}
