//! Token refresh against the identity provider

use async_trait::async_trait;
use serde::Deserialize;

use super::{TOKEN_REFRESH, build_http_client};
use crate::config::EndpointConfig;
use crate::error::{Error, Result, SessionError};
use crate::services::{IdentityService, TokenPair};

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
}

/// Client for the identity provider's token endpoint
#[derive(Clone, Debug)]
pub struct IdentityClient {
    http: reqwest::Client,
    token_url: String,
}

impl IdentityClient {
    /// Create a client for `{keycloak_url}/token`.
    pub fn new(endpoints: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            http: build_http_client(endpoints)?,
            token_url: endpoints.token_url(),
        })
    }
}

#[async_trait]
impl IdentityService for IdentityClient {
    async fn refresh(&self, client_id: &str, refresh_token: &str) -> Result<TokenPair> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", client_id),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SessionError::RefreshFailed {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let bytes = response.bytes().await?;
        let tokens: TokenResponse =
            serde_json::from_slice(&bytes).map_err(|e| Error::UnexpectedResponse {
                operation: TOKEN_REFRESH,
                reason: e.to_string(),
            })?;
        Ok(TokenPair {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
        })
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoints(uri: &str) -> EndpointConfig {
        EndpointConfig {
            keycloak_url: format!("{uri}/realms/pilot"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn refresh_posts_form_and_returns_pair() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/realms/pilot/token"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=old"))
            .and(body_string_contains("client_id=cli"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "refresh_token": "new-refresh",
                "expires_in": 300
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = IdentityClient::new(&endpoints(&server.uri())).unwrap();
        let pair = client.refresh("cli", "old").await.unwrap();
        assert_eq!(pair.access_token, "new-access");
        assert_eq!(pair.refresh_token, "new-refresh");
    }

    #[tokio::test]
    async fn rejected_refresh_is_a_session_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/realms/pilot/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let client = IdentityClient::new(&endpoints(&server.uri())).unwrap();
        let err = client.refresh("cli", "stale").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Session(SessionError::RefreshFailed { status: 400, .. })
        ));
    }
}
