//! Wiring of the platform clients into uploads and downloads

use std::path::Path;
use std::sync::Arc;

use crate::client::{IdentityClient, PlatformClient};
use crate::config::Config;
use crate::downloader::Downloader;
use crate::error::Result;
use crate::keepalive::TokenKeepAlive;
use crate::session::Session;
use crate::transport::ChunkTransport;
use crate::uploader::Uploader;

/// Uploader and downloader sharing one session and HTTP client
#[derive(Debug)]
pub struct TransferEngine {
    session: Arc<Session>,
    uploader: Uploader,
    downloader: Downloader,
}

impl TransferEngine {
    /// Open the session saved at `session_path` and connect to the platform.
    pub async fn connect(config: Config, session_path: &Path) -> Result<Self> {
        config.validate()?;
        let identity = Arc::new(IdentityClient::new(&config.endpoints)?);
        let session = Arc::new(Session::load(session_path, identity, &config).await?);
        Self::with_session(config, session)
    }

    /// Build an engine around an existing session.
    pub fn with_session(config: Config, session: Arc<Session>) -> Result<Self> {
        let client = Arc::new(PlatformClient::new(config.endpoints.clone(), session.clone())?);
        let transport = ChunkTransport::new(client.clone(), config.retry.clone())
            .with_download_buffer(config.transfer.download_buffer_size);
        let operator = session.username().to_string();

        let uploader = Uploader::new(client.clone(), transport.clone(), operator.clone(), &config)
            .with_keepalive(TokenKeepAlive::new(session.clone(), &config.token));
        let downloader = Downloader::new(client, transport, operator, &config.download);
        tracing::info!(user = %session.username(), "Transfer engine ready");

        Ok(Self {
            session,
            uploader,
            downloader,
        })
    }

    /// The logged-in session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Upload and resume flows
    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    /// Download flow
    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }
}
