//! HTTP API
//!
//! Unauthenticated routes drive the OAuth handshake and the health check.
//! Image and instance routes require a bearer credential, and instance routes
//! record the caller's address for whitelisting. Every JSON route except the
//! health check insists on a compatible `Draupnir-Version` header.

mod access_tokens;
mod health;
mod images;
mod instances;
pub mod middleware;

use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::auth::Authenticator;
use crate::exec::Executor;
use crate::oauth::OAuthCoordinator;
use crate::store::{ImageStore, InstanceStore, WhitelistedAddressStore};
use crate::whitelist::ReconcileHandle;
use middleware::ClientIpResolver;

/// Trigger source recorded for reconciles requested by API calls
pub const API_SOURCE: &str = "api";

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    /// Request authenticator
    pub authenticator: Arc<dyn Authenticator>,
    /// OAuth handshake coordinator
    pub oauth: Arc<OAuthCoordinator>,
    /// Image persistence
    pub images: Arc<dyn ImageStore>,
    /// Instance persistence
    pub instances: Arc<dyn InstanceStore>,
    /// Whitelisted address persistence
    pub addresses: Arc<dyn WhitelistedAddressStore>,
    /// Privileged image and instance operations
    pub executor: Arc<dyn Executor>,
    /// Whitelist reconcile trigger
    pub whitelist: ReconcileHandle,
    /// Caller address resolution
    pub client_ip: Arc<ClientIpResolver>,
    /// Lowest instance port (inclusive)
    pub min_instance_port: u16,
    /// Highest instance port (exclusive)
    pub max_instance_port: u16,
}

/// Build the API router
pub fn create_router(state: AppState) -> Router {
    let instance_routes = Router::new()
        .route("/instances", get(instances::list).post(instances::create))
        .route("/instances/{id}", get(instances::get).delete(instances::destroy))
        .route_layer(from_fn_with_state(state.clone(), middleware::authenticate))
        .route_layer(from_fn_with_state(state.clone(), middleware::record_client_ip));

    let image_routes = Router::new()
        .route("/images", get(images::list).post(images::create))
        .route("/images/{id}", get(images::get).delete(images::destroy))
        .route("/images/{id}/done", post(images::done))
        .route_layer(from_fn_with_state(state.clone(), middleware::authenticate));

    let versioned_routes = Router::new()
        .route("/access_tokens", post(access_tokens::create))
        .merge(image_routes)
        .merge(instance_routes)
        .route_layer(from_fn(middleware::check_api_version));

    Router::new()
        .route("/health_check", get(health::health_check))
        .merge(versioned_routes)
        .route_layer(from_fn(middleware::with_version))
        // Browser-facing, so neither versioned nor JSON
        .route("/authenticate", get(access_tokens::authenticate))
        .route("/oauth_callback", get(access_tokens::callback))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run `work` on its own task and wait for it.
///
/// Dropping the request future (client disconnect) leaves the task running,
/// so multi-step changes to disk and store are never cut short.
pub(crate) async fn detached<T, F>(work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, ApiError>> + Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|e| ApiError::internal("request task failed", &e))?
}

/// JSON error response
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Error with an explicit status
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// 400
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// 401
    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    /// 404
    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "not found")
    }

    /// 422
    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    /// 500. The detail is logged, not returned.
    pub fn internal(context: &str, err: &dyn std::fmt::Display) -> Self {
        tracing::error!(error = %err, "{context}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "status": self.status.as_u16(),
                "message": self.message,
            }
        }));

        if self.status == StatusCode::UNAUTHORIZED {
            (self.status, [("WWW-Authenticate", "Bearer")], body).into_response()
        } else {
            (self.status, body).into_response()
        }
    }
}
