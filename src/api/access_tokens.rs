//! OAuth handshake routes

use axum::{
    Json,
    extract::{Query, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use serde::Deserialize;
use tracing::info;

use super::{ApiError, AppState};
use crate::oauth::{CallbackOutcome, CallbackParams, OAuthError, pages};

/// Query of `GET /authenticate`
#[derive(Debug, Deserialize)]
pub struct AuthenticateQuery {
    #[serde(default)]
    state: String,
}

/// Body of `POST /access_tokens`
#[derive(Debug, Deserialize)]
pub struct CreateAccessTokenRequest {
    state: String,
}

/// `GET /authenticate`: send the browser to the consent page
pub async fn authenticate(State(state): State<AppState>, Query(query): Query<AuthenticateQuery>) -> Response {
    let url = state.oauth.auth_code_url(&query.state);
    (StatusCode::FOUND, [(header::LOCATION, url)]).into_response()
}

/// `POST /access_tokens`: block until the browser completes the flow
pub async fn create(
    State(state): State<AppState>,
    body: Result<Json<CreateAccessTokenRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(format!("invalid JSON: {e}")))?;

    match state.oauth.wait_for_token(&request.state).await {
        Ok(token) => Ok((StatusCode::CREATED, Json(token)).into_response()),
        Err(e) => {
            info!(state = %request.state, error = %e, "OAuth request failed");
            let status = match e {
                OAuthError::StateInUse => StatusCode::CONFLICT,
                _ => StatusCode::BAD_REQUEST,
            };
            Err(ApiError::new(status, e.to_string()))
        }
    }
}

/// `GET /oauth_callback`: the provider's redirect back to us
pub async fn callback(State(state): State<AppState>, Query(params): Query<CallbackParams>) -> Response {
    match state.oauth.handle_callback(&params).await {
        CallbackOutcome::Completed => Html(pages::success_page()).into_response(),
        CallbackOutcome::NotPending | CallbackOutcome::Failed(OAuthError::Abandoned) => {
            Html(pages::expired_page()).into_response()
        }
        CallbackOutcome::Failed(e) => {
            let status = match e {
                OAuthError::ProviderDenied(_) | OAuthError::MissingCode | OAuthError::ReauthenticationRequired => {
                    StatusCode::BAD_REQUEST
                }
                _ => StatusCode::BAD_GATEWAY,
            };
            (status, Html(pages::error_page(&e.to_string()))).into_response()
        }
    }
}
