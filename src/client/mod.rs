//! HTTP clients for the platform services
//!
//! [`PlatformClient`] implements [`crate::services::MetadataService`] and
//! [`crate::services::StorageGateway`]; [`IdentityClient`] implements
//! [`crate::services::IdentityService`].

mod identity;
mod metadata;
mod storage;

pub use identity::IdentityClient;

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::EndpointConfig;
use crate::error::{Error, Result, ServiceError};
use crate::session::Session;

pub(crate) const PRE_REGISTER: &str = "pre-registration";
pub(crate) const RESUME_LOOKUP: &str = "resume lookup";
pub(crate) const CHUNK_LOCATION: &str = "chunk write location";
pub(crate) const CHUNK_UPLOAD: &str = "chunk upload";
pub(crate) const FINALIZE: &str = "finalize";
pub(crate) const ITEM_STATUS: &str = "item status";
pub(crate) const PREPARE_DOWNLOAD: &str = "download preparation";
pub(crate) const DOWNLOAD_STATUS: &str = "download status";
pub(crate) const DOWNLOAD_STREAM: &str = "download";
pub(crate) const TOKEN_REFRESH: &str = "token refresh";

/// Timeout for connecting to a service; transfers themselves are unbounded
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Standard `{"result": ...}` response envelope
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    pub(crate) result: T,
}

/// Client for the BFF, upload and download services
#[derive(Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    endpoints: EndpointConfig,
    session: Arc<Session>,
}

impl std::fmt::Debug for PlatformClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformClient")
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

impl PlatformClient {
    /// Create a client for the given endpoints acting as `session`'s user.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn new(endpoints: EndpointConfig, session: Arc<Session>) -> Result<Self> {
        let http = build_http_client(&endpoints)?;
        Ok(Self {
            http,
            endpoints,
            session,
        })
    }

    /// Session the client acts for
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Validate the session and attach credentials to a protected request.
    ///
    /// The token is read after validation so a refresh is picked up.
    async fn authorize(
        &self,
        request: reqwest::RequestBuilder,
        with_refresh_token: bool,
    ) -> Result<reqwest::RequestBuilder> {
        self.session.ensure_valid().await?;
        let mut request = request
            .bearer_auth(self.session.access_token().await)
            .header("Session-ID", self.session.session_id());
        if with_refresh_token {
            request = request.header("Refresh-token", self.session.refresh_token().await);
        }
        Ok(request)
    }
}

/// reqwest client carrying the `VM-Info` header on every request
pub(crate) fn build_http_client(endpoints: &EndpointConfig) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    if !endpoints.vm_info.is_empty() {
        let value = HeaderValue::from_str(&endpoints.vm_info)
            .map_err(|e| Error::config(format!("invalid VM-Info header: {e}"), "vm_info"))?;
        headers.insert("VM-Info", value);
    }
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .default_headers(headers)
        .build()
        .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))
}

/// Map a rejected call onto the platform's closed error set.
///
/// Two legacy rejections are only distinguishable by their message text; this
/// is the one place that looks at it.
pub(crate) fn classify_rejection(operation: &'static str, status: u16, body: String) -> Error {
    let kind = match (operation, status) {
        (PRE_REGISTER, 401) => Some(ServiceError::ProjectDenied),
        (PRE_REGISTER, 403) => Some(ServiceError::PermissionDenied),
        (PRE_REGISTER, 409) => Some(ServiceError::FileExists),
        (PRE_REGISTER, 400 | 500) if body.contains("Invalid operation, locked") => {
            Some(ServiceError::FileLocked)
        }
        (RESUME_LOOKUP, 404) => Some(ServiceError::UploadIdNotExist),
        (PREPARE_DOWNLOAD, 403) => Some(ServiceError::NoFilePermission),
        (PREPARE_DOWNLOAD, 400) if body.contains("Folder is empty") => {
            Some(ServiceError::FolderEmpty)
        }
        _ => None,
    };
    match kind {
        Some(kind) => kind.into(),
        None => Error::Http {
            operation,
            status,
            body,
        },
    }
}

/// Decode a successful JSON response or classify the rejection.
pub(crate) async fn read_json<T: DeserializeOwned>(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_rejection(operation, status.as_u16(), body));
    }
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| Error::UnexpectedResponse {
        operation,
        reason: e.to_string(),
    })
}
