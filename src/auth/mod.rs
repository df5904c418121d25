//! Request authentication
//!
//! Every API request carries `Authorization: Bearer <token>`. The token is
//! either the operator's shared upload secret, which maps to the fixed
//! [`UPLOAD_USER_EMAIL`] identity, or a user's refresh token, which is
//! resolved to an email through the identity provider and checked against the
//! trusted domain.

mod provider;

pub use provider::{
    GoogleProvider, INTEGRATION_TEST_EMAIL, INTEGRATION_TEST_TOKEN, INVALID_GRANT, IntegrationTestProvider,
    OAuthProvider, OAuthToken, ProviderError, TokenVerifier,
};

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;

/// Identity assigned to requests bearing the shared upload secret
pub const UPLOAD_USER_EMAIL: &str = "upload";

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    /// No bearer credential, or one that could not be parsed
    #[error("missing or malformed credential")]
    MissingCredential,

    /// The identity provider rejected the credential or could not be reached
    #[error("failed to look up credential owner: {0}")]
    Provider(#[from] ProviderError),

    /// The credential belongs to a user outside the trusted domain
    #[error("user {0} is not in the trusted domain")]
    UntrustedDomain(String),
}

/// Identity established for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// User email, or [`UPLOAD_USER_EMAIL`]
    pub email: String,
    /// Refresh token the request was authenticated with. Empty for uploads.
    pub refresh_token: String,
}

impl AuthenticatedUser {
    /// Whether this is the upload identity
    #[must_use]
    pub fn is_upload(&self) -> bool {
        self.email == UPLOAD_USER_EMAIL
    }
}

/// Outcome of checking a stored refresh token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialValidity {
    /// The provider still honours the credential
    Valid,
    /// The grant is revoked, or its user suspended or deleted
    Revoked {
        /// Provider-supplied reason
        reason: String,
    },
}

/// Resolves requests and stored credentials to identities
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate an API request from its headers
    async fn authenticate_request(&self, headers: &HeaderMap) -> Result<AuthenticatedUser, AuthError>;

    /// Check whether `refresh_token` is still honoured.
    ///
    /// Only an `invalid_grant` answer yields [`CredentialValidity::Revoked`].
    /// Any other failure is an error: the caller cannot tell whether the
    /// credential is still good.
    async fn is_credential_valid(&self, refresh_token: &str) -> Result<CredentialValidity, AuthError>;
}

/// Authenticator backed by an OAuth token verifier
pub struct GoogleAuthenticator {
    verifier: Arc<dyn TokenVerifier>,
    shared_secret: String,
    trusted_domain: String,
}

impl GoogleAuthenticator {
    /// Create an authenticator
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        shared_secret: impl Into<String>,
        trusted_domain: impl Into<String>,
    ) -> Self {
        Self {
            verifier,
            shared_secret: shared_secret.into(),
            trusted_domain: trusted_domain.into(),
        }
    }

    fn is_shared_secret(&self, token: &str) -> bool {
        !self.shared_secret.is_empty() && bool::from(token.as_bytes().ct_eq(self.shared_secret.as_bytes()))
    }
}

#[async_trait]
impl Authenticator for GoogleAuthenticator {
    async fn authenticate_request(&self, headers: &HeaderMap) -> Result<AuthenticatedUser, AuthError> {
        let token = bearer_token(headers).ok_or(AuthError::MissingCredential)?;

        if self.is_shared_secret(token) {
            return Ok(AuthenticatedUser {
                email: UPLOAD_USER_EMAIL.to_string(),
                refresh_token: String::new(),
            });
        }

        let email = self.verifier.lookup_email(token).await?;

        if !email_in_domain(&email, &self.trusted_domain) {
            debug!(email = %email, domain = %self.trusted_domain, "Rejected user outside trusted domain");
            return Err(AuthError::UntrustedDomain(email));
        }

        Ok(AuthenticatedUser {
            email,
            refresh_token: token.to_string(),
        })
    }

    async fn is_credential_valid(&self, refresh_token: &str) -> Result<CredentialValidity, AuthError> {
        match self.verifier.lookup_email(refresh_token).await {
            Ok(_) => Ok(CredentialValidity::Valid),
            Err(ProviderError::InvalidGrant { reason }) => Ok(CredentialValidity::Revoked { reason }),
            Err(e) => Err(e.into()),
        }
    }
}

/// Extract the bearer token from the `Authorization` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();

    if token.is_empty() || token.contains(char::is_whitespace) {
        None
    } else {
        Some(token)
    }
}

/// Whether the domain part of `email` is `domain` or one of its subdomains
fn email_in_domain(email: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches('@').to_ascii_lowercase();
    if domain.is_empty() {
        return false;
    }

    email.rsplit_once('@').is_some_and(|(local, host)| {
        let host = host.to_ascii_lowercase();
        !local.is_empty() && (host == domain || host.ends_with(&format!(".{domain}")))
    })
}
