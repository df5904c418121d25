//! Rendezvous between the waiting API client and the browser callback

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::OAuthError;
use crate::auth::{OAuthProvider, OAuthToken};
use crate::config::OAuthConfig;

type Outcome = Result<OAuthToken, OAuthError>;

/// A client blocked on one `state`
struct Pending {
    id: u64,
    sender: oneshot::Sender<Outcome>,
}

/// Query parameters of the provider's redirect back to us
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct CallbackParams {
    /// State the flow was started with
    #[serde(default)]
    pub state: String,
    /// Authorization code, on success
    pub code: Option<String>,
    /// Error code, on failure
    pub error: Option<String>,
}

/// Result of handling a callback, for rendering the browser response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The token was handed to the waiting client
    Completed,
    /// The flow failed; the same error went to the waiting client, or the
    /// client left ([`OAuthError::Abandoned`]) and the token was revoked
    Failed(OAuthError),
    /// Nobody is waiting for this state
    NotPending,
}

/// Joins `POST /access_tokens` waiters with `/oauth_callback` redirects.
///
/// Each pending `state` maps to a one-shot channel. Whoever removes the entry
/// decides the outcome: the callback removes it before exchanging the code,
/// and the waiter only times out if it removes the entry itself first. A
/// waiter whose entry was claimed keeps waiting for the exchange, which has
/// its own timeout, so the browser and the client always see the same result.
pub struct OAuthCoordinator {
    provider: Arc<dyn OAuthProvider>,
    pending: DashMap<String, Pending>,
    next_id: AtomicU64,
    callback_timeout: Duration,
    exchange_timeout: Duration,
}

impl OAuthCoordinator {
    /// Create a coordinator
    pub fn new(provider: Arc<dyn OAuthProvider>, callback_timeout: Duration, exchange_timeout: Duration) -> Self {
        Self {
            provider,
            pending: DashMap::new(),
            next_id: AtomicU64::new(0),
            callback_timeout,
            exchange_timeout,
        }
    }

    /// Create a coordinator with the configured timeouts
    pub fn from_config(provider: Arc<dyn OAuthProvider>, config: &OAuthConfig) -> Self {
        Self::new(provider, config.callback_timeout, config.exchange_timeout)
    }

    /// Consent URL for `state`
    pub fn auth_code_url(&self, state: &str) -> String {
        self.provider.auth_code_url(state)
    }

    /// Number of clients currently waiting
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether a client is waiting on `state`
    pub fn is_pending(&self, state: &str) -> bool {
        self.pending.contains_key(state)
    }

    /// Register a waiter for `state` and block until the callback delivers an
    /// outcome or the callback timeout elapses.
    ///
    /// # Errors
    ///
    /// Returns the error delivered by the callback,
    /// [`OAuthError::CallbackTimeout`], or [`OAuthError::StateInUse`] when
    /// another client is already waiting on the same state.
    pub async fn wait_for_token(&self, state: &str) -> Outcome {
        if state.is_empty() {
            return Err(OAuthError::MissingState);
        }

        let (sender, receiver) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        match self.pending.entry(state.to_string()) {
            Entry::Occupied(_) => return Err(OAuthError::StateInUse),
            Entry::Vacant(slot) => {
                slot.insert(Pending { id, sender });
            }
        }

        let _registration = Registration {
            pending: &self.pending,
            state,
            id,
        };
        debug!(state = state, "Waiting for OAuth callback");

        let mut receiver = receiver;
        match tokio::time::timeout(self.callback_timeout, &mut receiver).await {
            Ok(delivered) => delivered.unwrap_or(Err(OAuthError::Abandoned)),
            Err(_) => {
                // Only time out if no callback has claimed the entry yet
                if self.pending.remove_if(state, |_, p| p.id == id).is_some() {
                    info!(state = state, timeout_secs = self.callback_timeout.as_secs(), "OAuth callback timed out");
                    return Err(OAuthError::CallbackTimeout);
                }

                debug!(state = state, "OAuth callback in progress, waiting for the exchange");
                receiver.await.unwrap_or(Err(OAuthError::Abandoned))
            }
        }
    }

    /// Handle the provider's redirect back to us
    pub async fn handle_callback(&self, params: &CallbackParams) -> CallbackOutcome {
        let state = params.state.as_str();

        let Some((_, pending)) = self.pending.remove(state) else {
            info!(state = state, "Cannot find OAuth callback for state");
            return CallbackOutcome::NotPending;
        };

        let outcome = self.complete(params).await;

        let result = match &outcome {
            Ok(_) => CallbackOutcome::Completed,
            Err(e) => {
                warn!(state = state, error = %e, "OAuth callback failed");
                CallbackOutcome::Failed(e.clone())
            }
        };

        match pending.sender.send(outcome) {
            Ok(()) => result,
            Err(undelivered) => {
                info!(state = state, "OAuth waiter left before the callback completed");
                if let Ok(token) = undelivered {
                    self.revoke_orphaned(state, &token).await;
                }
                CallbackOutcome::Failed(OAuthError::Abandoned)
            }
        }
    }

    /// Revoke a token nobody is left to receive
    async fn revoke_orphaned(&self, state: &str, token: &OAuthToken) {
        match self.provider.revoke_token(&token.access_token).await {
            Ok(()) => info!(state = state, "Revoked token issued to an abandoned OAuth flow"),
            Err(e) => warn!(state = state, error = %e, "Failed to revoke token issued to an abandoned OAuth flow"),
        }
    }

    async fn complete(&self, params: &CallbackParams) -> Outcome {
        if let Some(error) = params.error.as_deref().filter(|e| !e.is_empty()) {
            return Err(OAuthError::ProviderDenied(error.to_string()));
        }

        let code = params
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or(OAuthError::MissingCode)?;

        let token = tokio::time::timeout(self.exchange_timeout, self.provider.exchange_code(code))
            .await
            .map_err(|_| OAuthError::ExchangeTimeout(self.exchange_timeout))?
            .map_err(|e| OAuthError::Exchange(e.to_string()))?;

        if token.has_refresh_token() {
            return Ok(token);
        }

        // No refresh token means the user already holds a grant. Revoking the
        // new access token revokes that grant, so the next attempt gets a
        // fresh refresh token.
        self.provider
            .revoke_token(&token.access_token)
            .await
            .map_err(|e| OAuthError::NotRevoked(e.to_string()))?;

        Err(OAuthError::ReauthenticationRequired)
    }
}

/// Removes a waiter's entry when it stops waiting, unless the entry has
/// already been taken or replaced
struct Registration<'a> {
    pending: &'a DashMap<String, Pending>,
    state: &'a str,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.pending.remove_if(self.state, |_, p| p.id == self.id);
    }
}
