//! Login session and access-token lifecycle
//!
//! A [`Session`] is passed explicitly to everything that makes protected
//! calls. The token pair is shared between the keep-alive task and callers
//! that refresh on expiry; writes are serialized and every call reads the
//! current token afresh.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::services::{IdentityService, TokenPair};

/// Outcome of checking the access token
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenState {
    /// Usable as is
    Valid,
    /// Expires within the grace window; refresh before use
    NeedsRefresh,
    /// Expired or issued to another client; a new login is required
    NeedsLogin,
}

#[derive(Debug, Deserialize)]
struct AccessClaims {
    exp: i64,
    #[serde(default)]
    azp: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    username: String,
    access_token: String,
    refresh_token: String,
    session_id: String,
}

/// Decode the payload of a JWT without verifying its signature.
pub(crate) fn decode_jwt_claims<T: DeserializeOwned>(token: &str) -> Result<T> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| SessionError::MalformedToken("missing payload segment".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| SessionError::MalformedToken(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| SessionError::MalformedToken(e.to_string()).into())
}

/// Parameters for [`Session::new`]
#[derive(Clone, Debug)]
pub struct SessionParams {
    /// Logged-in user; sent as the operator of transfers
    pub username: String,
    /// Value of the `Session-ID` header
    pub session_id: String,
    /// Current token pair
    pub tokens: TokenPair,
    /// Client id the tokens must be issued to
    pub client_id: String,
    /// Refresh when the token expires within this window
    pub grace_window: Duration,
}

/// Authenticated user session
pub struct Session {
    username: String,
    session_id: String,
    client_id: String,
    grace_window: Duration,
    tokens: RwLock<TokenPair>,
    refresh_lock: Mutex<()>,
    identity: Arc<dyn IdentityService>,
    persist_path: Option<PathBuf>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("username", &self.username)
            .field("client_id", &self.client_id)
            .field("persist_path", &self.persist_path)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Build an in-memory session.
    pub fn new(params: SessionParams, identity: Arc<dyn IdentityService>) -> Self {
        Self {
            username: params.username,
            session_id: params.session_id,
            client_id: params.client_id,
            grace_window: params.grace_window,
            tokens: RwLock::new(params.tokens),
            refresh_lock: Mutex::new(()),
            identity,
            persist_path: None,
        }
    }

    /// Load a session saved by a previous login.
    ///
    /// Refreshed tokens are written back to the same file.
    pub async fn load(
        path: &Path,
        identity: Arc<dyn IdentityService>,
        config: &Config,
    ) -> Result<Self> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::NotLoggedIn {
                    path: path.to_path_buf(),
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        };
        let file: SessionFile = serde_json::from_slice(&raw)?;
        let mut session = Self::new(
            SessionParams {
                username: file.username,
                session_id: file.session_id,
                tokens: TokenPair {
                    access_token: file.access_token,
                    refresh_token: file.refresh_token,
                },
                client_id: config.endpoints.device_client_id.clone(),
                grace_window: config.token.grace_window,
            },
            identity,
        );
        session.persist_path = Some(path.to_path_buf());
        Ok(session)
    }

    /// Write the session as JSON.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let tokens = self.tokens.read().await.clone();
        let file = SessionFile {
            username: self.username.clone(),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            session_id: self.session_id.clone(),
        };
        tokio::fs::write(path, serde_json::to_vec_pretty(&file)?).await?;
        Ok(())
    }

    /// Logged-in user
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Session id header value
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current access token
    pub async fn access_token(&self) -> String {
        self.tokens.read().await.access_token.clone()
    }

    /// Current refresh token
    pub async fn refresh_token(&self) -> String {
        self.tokens.read().await.refresh_token.clone()
    }

    /// Classify the current access token.
    pub async fn token_state(&self) -> Result<TokenState> {
        let token = self.access_token().await;
        self.classify(&token)
    }

    fn classify(&self, access_token: &str) -> Result<TokenState> {
        let claims: AccessClaims = decode_jwt_claims(access_token)?;
        let now = chrono::Utc::now().timestamp();

        if claims.azp.as_deref() != Some(self.client_id.as_str()) || claims.exp <= now {
            return Ok(TokenState::NeedsLogin);
        }
        if claims.exp - now <= self.grace_window.as_secs() as i64 {
            return Ok(TokenState::NeedsRefresh);
        }
        Ok(TokenState::Valid)
    }

    /// Make sure the access token can be used for a protected call.
    ///
    /// Refreshes inside the grace window and fails with
    /// [`SessionError::LoginRequired`] when only a new login can help.
    pub async fn ensure_valid(&self) -> Result<()> {
        let seen = self.access_token().await;
        match self.classify(&seen)? {
            TokenState::Valid => Ok(()),
            TokenState::NeedsLogin => Err(SessionError::LoginRequired.into()),
            TokenState::NeedsRefresh => {
                let _guard = self.refresh_lock.lock().await;
                // Another caller may have rotated the token while we waited
                if self.access_token().await != seen {
                    return Ok(());
                }
                self.refresh_locked().await
            }
        }
    }

    /// Exchange the refresh token for a new pair.
    pub async fn refresh(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<()> {
        let refresh_token = self.refresh_token().await;
        let pair = self.identity.refresh(&self.client_id, &refresh_token).await?;
        *self.tokens.write().await = pair;
        tracing::info!(username = %self.username, "Access token refreshed");

        if let Some(path) = &self.persist_path
            && let Err(e) = self.save(path).await
        {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to persist refreshed session"
            );
        }
        Ok(())
    }
}
