//! OAuth handshake coordination
//!
//! A CLI starts a login by picking a random `state`, opening the browser at
//! `/authenticate?state=...` and calling `POST /access_tokens` with the same
//! state. That call blocks in [`OAuthCoordinator::wait_for_token`] until the
//! provider redirects the browser to `/oauth_callback`, whose handler
//! exchanges the code and hands the token over.

mod coordinator;
pub mod pages;

pub use coordinator::{CallbackOutcome, CallbackParams, OAuthCoordinator};

use std::time::Duration;

use thiserror::Error;

/// Handshake errors. Cloneable because the same error is shown to the browser
/// and delivered to the waiting client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OAuthError {
    /// No state supplied
    #[error("state parameter is required")]
    MissingState,

    /// Another client is already waiting on this state
    #[error("an authorization is already pending for this state")]
    StateInUse,

    /// The browser never came back
    #[error("callback timed out")]
    CallbackTimeout,

    /// The callback's handler went away without an outcome
    #[error("authorization was abandoned")]
    Abandoned,

    /// The provider redirected back with an error
    #[error("identity provider returned error: {0}")]
    ProviderDenied(String),

    /// Neither code nor error in the callback
    #[error("OAuth callback response code is empty")]
    MissingCode,

    /// The code exchange failed
    #[error("token exchange error: {0}")]
    Exchange(String),

    /// The code exchange took too long
    #[error("token exchange timed out after {0:?}")]
    ExchangeTimeout(Duration),

    /// Revoking a refresh-less token failed
    #[error("existing access token was not revoked: {0}")]
    NotRevoked(String),

    /// A refresh-less token was revoked; the user must go through the flow again
    #[error("existing token revoked - please try authenticating again")]
    ReauthenticationRequired,
}
