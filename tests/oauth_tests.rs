//! OAuth handshake tests
//!
//! Pairs `wait_for_token` callers with `handle_callback` redirects through a
//! scripted provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use draupnir::auth::{OAuthProvider, OAuthToken, ProviderError};
use draupnir::oauth::{CallbackOutcome, CallbackParams, OAuthCoordinator, OAuthError};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(60);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Provider issuing `token-for-<code>` tokens
#[derive(Default)]
struct ScriptedProvider {
    omit_refresh_token: bool,
    fail_revoke: bool,
    exchange_delay: Option<Duration>,
    revoked: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn token(code: &str, with_refresh: bool) -> OAuthToken {
        OAuthToken {
            access_token: format!("access-{code}"),
            token_type: "Bearer".to_string(),
            refresh_token: if with_refresh {
                format!("refresh-{code}")
            } else {
                String::new()
            },
            expiry: None,
        }
    }
}

#[async_trait]
impl OAuthProvider for ScriptedProvider {
    fn auth_code_url(&self, state: &str) -> String {
        format!("https://accounts.example.com/o/oauth2/auth?state={state}&access_type=offline")
    }

    async fn exchange_code(&self, code: &str) -> Result<OAuthToken, ProviderError> {
        if let Some(delay) = self.exchange_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Self::token(code, !self.omit_refresh_token))
    }

    async fn revoke_token(&self, access_token: &str) -> Result<(), ProviderError> {
        self.revoked.lock().push(access_token.to_string());
        if self.fail_revoke {
            return Err(ProviderError::NotRevoked { status: 400 });
        }
        Ok(())
    }
}

fn coordinator(provider: Arc<ScriptedProvider>) -> Arc<OAuthCoordinator> {
    Arc::new(OAuthCoordinator::new(provider, CALLBACK_TIMEOUT, EXCHANGE_TIMEOUT))
}

fn spawn_waiter(
    coord: &Arc<OAuthCoordinator>,
    state: &str,
) -> tokio::task::JoinHandle<Result<OAuthToken, OAuthError>> {
    let coord = Arc::clone(coord);
    let state = state.to_string();
    tokio::spawn(async move { coord.wait_for_token(&state).await })
}

async fn until_pending(coord: &OAuthCoordinator, state: &str) {
    while !coord.is_pending(state) {
        tokio::task::yield_now().await;
    }
}

fn callback(state: &str, code: &str) -> CallbackParams {
    CallbackParams {
        state: state.to_string(),
        code: Some(code.to_string()),
        error: None,
    }
}

#[tokio::test]
async fn callback_delivers_token_to_waiter() {
    let provider = Arc::new(ScriptedProvider::default());
    let coord = coordinator(provider.clone());

    let waiter = spawn_waiter(&coord, "xyz789");
    until_pending(&coord, "xyz789").await;

    let outcome = coord.handle_callback(&callback("xyz789", "4/abc")).await;
    assert_eq!(outcome, CallbackOutcome::Completed);

    let token = waiter.await.unwrap().unwrap();
    assert_eq!(token, ScriptedProvider::token("4/abc", true));
    assert_eq!(coord.pending_count(), 0);
    assert!(provider.revoked.lock().is_empty());
}

#[tokio::test]
async fn missing_refresh_token_revokes_and_asks_to_retry() {
    let provider = Arc::new(ScriptedProvider {
        omit_refresh_token: true,
        ..ScriptedProvider::default()
    });
    let coord = coordinator(provider.clone());

    let waiter = spawn_waiter(&coord, "again");
    until_pending(&coord, "again").await;

    let outcome = coord.handle_callback(&callback("again", "4/def")).await;
    assert_eq!(outcome, CallbackOutcome::Failed(OAuthError::ReauthenticationRequired));
    assert_eq!(
        waiter.await.unwrap().unwrap_err(),
        OAuthError::ReauthenticationRequired
    );
    assert_eq!(*provider.revoked.lock(), vec!["access-4/def".to_string()]);
}

#[tokio::test]
async fn failed_revocation_is_reported_to_both_sides() {
    let provider = Arc::new(ScriptedProvider {
        omit_refresh_token: true,
        fail_revoke: true,
        ..ScriptedProvider::default()
    });
    let coord = coordinator(provider);

    let waiter = spawn_waiter(&coord, "stuck");
    until_pending(&coord, "stuck").await;

    let outcome = coord.handle_callback(&callback("stuck", "4/ghi")).await;
    assert!(matches!(outcome, CallbackOutcome::Failed(OAuthError::NotRevoked(_))));
    assert!(matches!(waiter.await.unwrap(), Err(OAuthError::NotRevoked(_))));
}

#[tokio::test]
async fn provider_denial_is_forwarded() {
    let coord = coordinator(Arc::new(ScriptedProvider::default()));

    let waiter = spawn_waiter(&coord, "denied");
    until_pending(&coord, "denied").await;

    let params = CallbackParams {
        state: "denied".to_string(),
        code: None,
        error: Some("access_denied".to_string()),
    };
    let outcome = coord.handle_callback(&params).await;
    let expected = OAuthError::ProviderDenied("access_denied".to_string());
    assert_eq!(outcome, CallbackOutcome::Failed(expected.clone()));
    assert_eq!(waiter.await.unwrap().unwrap_err(), expected);
}

#[tokio::test(start_paused = true)]
async fn waiter_times_out_and_late_callback_finds_nothing() {
    let coord = coordinator(Arc::new(ScriptedProvider::default()));

    let err = coord.wait_for_token("slow").await.unwrap_err();
    assert_eq!(err, OAuthError::CallbackTimeout);
    assert_eq!(coord.pending_count(), 0);

    let outcome = coord.handle_callback(&callback("slow", "4/late")).await;
    assert_eq!(outcome, CallbackOutcome::NotPending);
}

#[tokio::test(start_paused = true)]
async fn slow_exchange_times_out() {
    let provider = Arc::new(ScriptedProvider {
        exchange_delay: Some(EXCHANGE_TIMEOUT * 2),
        ..ScriptedProvider::default()
    });
    let coord = coordinator(provider);

    let waiter = spawn_waiter(&coord, "hang");
    until_pending(&coord, "hang").await;

    let outcome = coord.handle_callback(&callback("hang", "4/jkl")).await;
    assert_eq!(
        outcome,
        CallbackOutcome::Failed(OAuthError::ExchangeTimeout(EXCHANGE_TIMEOUT))
    );
    assert_eq!(
        waiter.await.unwrap().unwrap_err(),
        OAuthError::ExchangeTimeout(EXCHANGE_TIMEOUT)
    );
}

#[tokio::test(start_paused = true)]
async fn claimed_waiter_outlasts_its_timeout_during_the_exchange() {
    let provider = Arc::new(ScriptedProvider {
        exchange_delay: Some(Duration::from_secs(4)),
        ..ScriptedProvider::default()
    });
    let coord = coordinator(provider.clone());

    let waiter = spawn_waiter(&coord, "late");
    until_pending(&coord, "late").await;

    // The callback arrives just before the waiter's deadline and the
    // exchange runs past it
    tokio::time::sleep(CALLBACK_TIMEOUT - Duration::from_secs(2)).await;
    let outcome = coord.handle_callback(&callback("late", "4/edge")).await;

    assert_eq!(outcome, CallbackOutcome::Completed);
    let token = waiter.await.unwrap().unwrap();
    assert_eq!(token.access_token, "access-4/edge");
    assert!(provider.revoked.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn token_for_a_departed_waiter_is_revoked() {
    let provider = Arc::new(ScriptedProvider {
        exchange_delay: Some(Duration::from_secs(2)),
        ..ScriptedProvider::default()
    });
    let coord = coordinator(provider.clone());

    let waiter = spawn_waiter(&coord, "left");
    until_pending(&coord, "left").await;

    let callback_task = {
        let coord = Arc::clone(&coord);
        tokio::spawn(async move { coord.handle_callback(&callback("left", "4/orphan")).await })
    };
    while coord.is_pending("left") {
        tokio::task::yield_now().await;
    }

    // The client disconnects while the code is being exchanged
    waiter.abort();
    let _ = waiter.await;

    let outcome = callback_task.await.unwrap();
    assert_eq!(outcome, CallbackOutcome::Failed(OAuthError::Abandoned));
    assert_eq!(*provider.revoked.lock(), vec!["access-4/orphan".to_string()]);
}

#[tokio::test]
async fn each_waiter_receives_its_own_token() {
    let coord = coordinator(Arc::new(ScriptedProvider::default()));

    let states = ["alpha", "bravo", "charlie"];
    let waiters: Vec<_> = states.iter().map(|s| spawn_waiter(&coord, s)).collect();
    for state in states {
        until_pending(&coord, state).await;
    }

    for state in states.iter().rev() {
        let outcome = coord.handle_callback(&callback(state, &format!("code-{state}"))).await;
        assert_eq!(outcome, CallbackOutcome::Completed);
    }

    for (state, waiter) in states.iter().zip(waiters) {
        let token = waiter.await.unwrap().unwrap();
        assert_eq!(token.access_token, format!("access-code-{state}"));
    }
}

#[tokio::test]
async fn second_callback_for_same_state_is_not_pending() {
    let coord = coordinator(Arc::new(ScriptedProvider::default()));

    let waiter = spawn_waiter(&coord, "once");
    until_pending(&coord, "once").await;

    assert_eq!(
        coord.handle_callback(&callback("once", "4/first")).await,
        CallbackOutcome::Completed
    );
    assert_eq!(
        coord.handle_callback(&callback("once", "4/second")).await,
        CallbackOutcome::NotPending
    );

    let token = waiter.await.unwrap().unwrap();
    assert_eq!(token.access_token, "access-4/first");
}

#[tokio::test]
async fn abandoned_waiter_releases_its_state() {
    let coord = coordinator(Arc::new(ScriptedProvider::default()));

    let waiter = spawn_waiter(&coord, "gone");
    until_pending(&coord, "gone").await;

    waiter.abort();
    let _ = waiter.await;
    assert!(!coord.is_pending("gone"));

    assert_eq!(
        coord.handle_callback(&callback("gone", "4/late")).await,
        CallbackOutcome::NotPending
    );

    // The state can be reused straight away
    let again = spawn_waiter(&coord, "gone");
    until_pending(&coord, "gone").await;
    assert_eq!(
        coord.handle_callback(&callback("gone", "4/new")).await,
        CallbackOutcome::Completed
    );
    assert!(again.await.unwrap().is_ok());
}

#[test]
fn auth_code_url_comes_from_the_provider() {
    let coord = coordinator(Arc::new(ScriptedProvider::default()));
    let url = coord.auth_code_url("xyz789");
    assert!(url.contains("state=xyz789"));
    assert!(url.contains("access_type=offline"));
}
