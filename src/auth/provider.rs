//! Identity provider clients
//!
//! Two narrow interfaces are used by the rest of the crate:
//!
//! - [`TokenVerifier`] resolves a stored refresh token to the email it belongs
//!   to. The authenticator uses it for every request and for validity checks.
//! - [`OAuthProvider`] drives the browser consent flow: consent URL, code
//!   exchange and token revocation.
//!
//! [`GoogleProvider`] implements both against Google's OAuth endpoints.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::OAuthConfig;

/// OAuth error code returned when a grant was revoked or its user removed
pub const INVALID_GRANT: &str = "invalid_grant";

/// Refresh token accepted by [`IntegrationTestProvider`]
pub const INTEGRATION_TEST_TOKEN: &str = "the-integration-access-token";

/// Email returned by [`IntegrationTestProvider`]
pub const INTEGRATION_TEST_EMAIL: &str = "integration-test@gocardless.com";

/// Identity provider errors
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The grant was revoked, or the user suspended or deleted
    #[error("invalid_grant: {reason}")]
    InvalidGrant {
        /// Description supplied by the provider
        reason: String,
    },

    /// The provider answered with an unexpected status
    #[error("identity provider returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// The request never completed
    #[error("identity provider request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The provider answered with something we could not use
    #[error("unexpected identity provider response: {0}")]
    Response(String),

    /// A revocation request was not accepted
    #[error("existing access token was not revoked (HTTP {status})")]
    NotRevoked {
        /// HTTP status code
        status: u16,
    },
}

impl ProviderError {
    /// Whether this is the definitive "grant revoked / user removed" signal
    #[must_use]
    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, Self::InvalidGrant { .. })
    }
}

/// Token issued by the provider.
///
/// This is also the body returned to API clients once the OAuth handshake
/// completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    /// Short-lived access token
    pub access_token: String,
    /// Token type, normally `Bearer`
    #[serde(default)]
    pub token_type: String,
    /// Long-lived refresh token. Empty when the provider did not issue one.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
    /// Access token expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl OAuthToken {
    /// Whether the token carries a refresh component
    #[must_use]
    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }
}

/// Resolves refresh tokens to user identities
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Obtain an access token with `refresh_token` and return the email it
    /// was issued to
    async fn lookup_email(&self, refresh_token: &str) -> Result<String, ProviderError>;
}

/// Browser-facing OAuth operations
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Consent URL for `state`, requesting offline access
    fn auth_code_url(&self, state: &str) -> String;

    /// Exchange an authorization code for a token
    async fn exchange_code(&self, code: &str) -> Result<OAuthToken, ProviderError>;

    /// Revoke an access token (and the grant behind it)
    async fn revoke_token(&self, access_token: &str) -> Result<(), ProviderError>;
}

/// OAuth token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

impl From<TokenResponse> for OAuthToken {
    fn from(response: TokenResponse) -> Self {
        Self {
            access_token: response.access_token,
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            refresh_token: response.refresh_token.unwrap_or_default(),
            expiry: response
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        }
    }
}

/// Token info endpoint response
#[derive(Debug, Deserialize)]
struct TokenInfoResponse {
    email: Option<String>,
}

/// OAuth error body (RFC 6749 §5.2)
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    error_description: Option<String>,
}

/// Google OAuth client
pub struct GoogleProvider {
    http_client: Client,
    client_id: String,
    client_secret: String,
    redirect_url: String,
    scopes: Vec<String>,
    auth_url: String,
    token_url: String,
    tokeninfo_url: String,
    revoke_url: String,
}

impl GoogleProvider {
    /// Scope needed to read the user's email
    pub const EMAIL_SCOPE: &'static str = "https://www.googleapis.com/auth/userinfo.email";

    /// Create a provider from configuration
    #[must_use]
    pub fn new(config: &OAuthConfig) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self::with_client(http_client, config)
    }

    /// Create a provider using an existing HTTP client
    #[must_use]
    pub fn with_client(http_client: Client, config: &OAuthConfig) -> Self {
        Self {
            http_client,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_url: config.redirect_url.clone(),
            scopes: vec![Self::EMAIL_SCOPE.to_string()],
            auth_url: config.auth_url.clone(),
            token_url: config.token_url.clone(),
            tokeninfo_url: config.tokeninfo_url.clone(),
            revoke_url: config.revoke_url.clone(),
        }
    }

    async fn request_token(&self, params: &[(&str, &str)]) -> Result<OAuthToken, ProviderError> {
        let response = self
            .http_client
            .post(&self.token_url)
            .form(params)
            .send()
            .await?;

        let response = check_status(response).await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Response(format!("failed to parse token response: {e}")))?;

        Ok(token.into())
    }
}

#[async_trait]
impl TokenVerifier for GoogleProvider {
    async fn lookup_email(&self, refresh_token: &str) -> Result<String, ProviderError> {
        let token = self
            .request_token(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .await?;

        let response = self
            .http_client
            .get(&self.tokeninfo_url)
            .query(&[("access_token", token.access_token.as_str())])
            .send()
            .await?;

        let info: TokenInfoResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Response(format!("failed to parse token info: {e}")))?;

        info.email
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ProviderError::Response("token info has no email".to_string()))
    }
}

#[async_trait]
impl OAuthProvider for GoogleProvider {
    fn auth_code_url(&self, state: &str) -> String {
        let Ok(mut url) = Url::parse(&self.auth_url) else {
            return self.auth_url.clone();
        };

        url.query_pairs_mut()
            .append_pair("access_type", "offline")
            .append_pair("client_id", self.client_id.as_str())
            .append_pair("redirect_uri", &self.redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("state", state);

        url.to_string()
    }

    async fn exchange_code(&self, code: &str) -> Result<OAuthToken, ProviderError> {
        self.request_token(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_url.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ])
        .await
    }

    async fn revoke_token(&self, access_token: &str) -> Result<(), ProviderError> {
        let response = self
            .http_client
            .post(&self.revoke_url)
            .form(&[("token", access_token)])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!("Revoked access token");
            Ok(())
        } else {
            Err(ProviderError::NotRevoked {
                status: status.as_u16(),
            })
        }
    }
}

/// Turn a non-success response into a classified error
async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_error_body(status.as_u16(), body))
}

/// Map an OAuth error body to [`ProviderError`], singling out `invalid_grant`
fn classify_error_body(status: u16, body: String) -> ProviderError {
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) if parsed.error == INVALID_GRANT => ProviderError::InvalidGrant {
            reason: parsed.error_description.unwrap_or(parsed.error),
        },
        _ => ProviderError::Status { status, body },
    }
}

/// Verifier used by the integration test environment.
///
/// Accepts exactly [`INTEGRATION_TEST_TOKEN`].
#[derive(Debug, Default, Clone, Copy)]
pub struct IntegrationTestProvider;

#[async_trait]
impl TokenVerifier for IntegrationTestProvider {
    async fn lookup_email(&self, refresh_token: &str) -> Result<String, ProviderError> {
        if refresh_token == INTEGRATION_TEST_TOKEN {
            Ok(INTEGRATION_TEST_EMAIL.to_string())
        } else {
            Err(ProviderError::Response("invalid access token".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GoogleProvider {
        GoogleProvider::new(&OAuthConfig {
            client_id: "the-client-id".to_string(),
            client_secret: "the-client-secret".to_string(),
            redirect_url: "https://draupnir.org/oauth_callback".to_string(),
            ..OAuthConfig::default()
        })
    }

    #[test]
    fn auth_code_url_requests_offline_access() {
        let url = Url::parse(&provider().auth_code_url("xyz789")).unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(url.host_str(), Some("accounts.google.com"));
        assert_eq!(pairs["access_type"], "offline");
        assert_eq!(pairs["state"], "xyz789");
        assert_eq!(pairs["client_id"], "the-client-id");
        assert_eq!(pairs["redirect_uri"], "https://draupnir.org/oauth_callback");
        assert_eq!(pairs["scope"], GoogleProvider::EMAIL_SCOPE);
    }

    #[test]
    fn invalid_grant_body_is_classified() {
        let err = classify_error_body(
            400,
            r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#
                .to_string(),
        );
        assert!(err.is_invalid_grant());
        assert_eq!(err.to_string(), "invalid_grant: Token has been expired or revoked.");
    }

    #[test]
    fn other_oauth_errors_are_not_invalid_grant() {
        let err = classify_error_body(401, r#"{"error":"invalid_client"}"#.to_string());
        assert!(!err.is_invalid_grant());

        let err = classify_error_body(503, "upstream unavailable".to_string());
        assert!(matches!(err, ProviderError::Status { status: 503, .. }));
    }

    #[test]
    fn token_response_without_refresh_token() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"ya29.abc","expires_in":3599}"#).unwrap();
        let token = OAuthToken::from(response);

        assert_eq!(token.access_token, "ya29.abc");
        assert_eq!(token.token_type, "Bearer");
        assert!(!token.has_refresh_token());
        assert!(token.expiry.is_some());
    }

    #[test]
    fn oauth_token_omits_empty_refresh_token() {
        let token = OAuthToken {
            access_token: "a".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: String::new(),
            expiry: None,
        };
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, r#"{"access_token":"a","token_type":"Bearer"}"#);
    }

    #[tokio::test]
    async fn integration_provider_accepts_only_its_token() {
        let provider = IntegrationTestProvider;
        assert_eq!(
            provider.lookup_email(INTEGRATION_TEST_TOKEN).await.unwrap(),
            INTEGRATION_TEST_EMAIL
        );
        assert!(provider.lookup_email("anything-else").await.is_err());
    }
}
