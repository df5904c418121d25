//! Instance routes

use std::net::IpAddr;

use axum::{
    Extension, Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{info, warn};

use super::middleware::ClientIp;
use super::{API_SOURCE, ApiError, AppState, detached};
use crate::auth::AuthenticatedUser;
use crate::models::{ImageId, Instance, InstanceId, WhitelistedAddress};
use crate::ports::{self, PortError};
use crate::store::StoreError;

/// Attempts at inserting an instance when another request takes its port first
const CREATE_ATTEMPTS: u32 = 3;

/// Body of `POST /instances`
#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    image_id: ImageId,
}

/// `POST /instances`: clone a ready image for the caller
pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    body: Result<Json<CreateInstanceRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(format!("invalid JSON: {e}")))?;

    let image = match state.images.get(request.image_id).await {
        Ok(image) => image,
        Err(StoreError::ImageNotFound(_)) => {
            return Err(ApiError::new(StatusCode::NOT_FOUND, "image not found"));
        }
        Err(e) => return Err(ApiError::internal("failed to get image", &e)),
    };
    if !image.ready {
        return Err(ApiError::unprocessable("image is not ready to be used"));
    }

    let instance = detached(provision(state, user, image.id, ip)).await?;
    Ok((StatusCode::CREATED, Json(instance)).into_response())
}

/// Reserve a port, start the instance and whitelist the caller
async fn provision(state: AppState, user: AuthenticatedUser, image_id: ImageId, ip: IpAddr) -> Result<Instance, ApiError> {
    let mut instance = insert_with_free_port(&state, &user, image_id).await?;

    if let Err(e) = state
        .executor
        .create_instance(image_id, instance.id, instance.port)
        .await
    {
        if let Err(cleanup) = state.instances.destroy(instance.id).await {
            warn!(instance_id = instance.id, error = %cleanup, "Failed to remove record of unstarted instance");
        }
        return Err(ApiError::internal("failed to create instance", &e));
    }

    instance.credentials = Some(
        state
            .executor
            .retrieve_instance_credentials(instance.id)
            .await
            .map_err(|e| ApiError::internal("failed to retrieve instance credentials", &e))?,
    );

    whitelist_caller(&state, &instance, ip).await?;

    info!(
        instance_id = instance.id,
        image_id,
        user_email = %instance.user_email,
        port = instance.port,
        ip_address = %ip,
        "Created instance"
    );

    Ok(instance)
}

/// `GET /instances`: the caller's instances
pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<Vec<Instance>>, ApiError> {
    let instances = state
        .instances
        .list()
        .await
        .map_err(|e| ApiError::internal("failed to get instances", &e))?;

    Ok(Json(
        instances
            .into_iter()
            .filter(|i| i.user_email == user.email)
            .collect(),
    ))
}

/// `GET /instances/{id}`: also whitelists the caller's current address
pub async fn get(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(id): Path<String>,
) -> Result<Json<Instance>, ApiError> {
    let mut instance = find(&state, &id).await?;
    if instance.user_email != user.email {
        return Err(ApiError::not_found());
    }

    instance.credentials = Some(
        state
            .executor
            .retrieve_instance_credentials(instance.id)
            .await
            .map_err(|e| ApiError::internal("failed to retrieve instance credentials", &e))?,
    );

    whitelist_caller(&state, &instance, ip).await?;

    Ok(Json(instance))
}

/// `DELETE /instances/{id}`: by the owner or the upload identity
pub async fn destroy(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let instance = find(&state, &id).await?;
    if !user.is_upload() && instance.user_email != user.email {
        return Err(ApiError::not_found());
    }

    info!(instance_id = instance.id, user_email = %user.email, "Destroying instance");

    detached(async move {
        teardown(&state, &instance).await?;
        // The store dropped the instance's whitelisted addresses with it
        state.whitelist.trigger(API_SOURCE);
        Ok::<_, ApiError>(StatusCode::NO_CONTENT)
    })
    .await
}

/// Remove an instance from disk, then from the store
pub(super) async fn teardown(state: &AppState, instance: &Instance) -> Result<(), ApiError> {
    state
        .executor
        .destroy_instance(instance.id)
        .await
        .map_err(|e| ApiError::internal("failed to destroy instance on disk", &e))?;

    state
        .instances
        .destroy(instance.id)
        .await
        .map_err(|e| ApiError::internal("failed to remove instance from store", &e))
}

async fn find(state: &AppState, id: &str) -> Result<Instance, ApiError> {
    let id: InstanceId = id.parse().map_err(|_| ApiError::not_found())?;
    match state.instances.get(id).await {
        Ok(instance) => Ok(instance),
        Err(StoreError::NotFound(_)) => Err(ApiError::not_found()),
        Err(e) => Err(ApiError::internal("failed to get instance", &e)),
    }
}

/// Allocate a port and persist the instance, retrying when a concurrent
/// request claims the same port first
async fn insert_with_free_port(state: &AppState, user: &AuthenticatedUser, image_id: ImageId) -> Result<Instance, ApiError> {
    for attempt in 1..=CREATE_ATTEMPTS {
        let port = ports::allocate_free_port(
            state.instances.as_ref(),
            state.min_instance_port,
            state.max_instance_port,
        )
        .await
        .map_err(port_error)?;

        let mut instance = Instance::new(image_id, &user.email, &user.refresh_token);
        instance.port = port;

        match state.instances.create(instance).await {
            Ok(instance) => return Ok(instance),
            Err(StoreError::PortConflict(port)) => {
                warn!(port, attempt, "Port taken by a concurrent request, allocating again");
            }
            Err(e) => return Err(ApiError::internal("failed to create instance", &e)),
        }
    }

    Err(ApiError::new(
        StatusCode::SERVICE_UNAVAILABLE,
        format!("could not reserve a port after {CREATE_ATTEMPTS} attempts, please retry"),
    ))
}

fn port_error(err: PortError) -> ApiError {
    match err {
        PortError::Exhausted { .. } => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        other => ApiError::internal("failed to allocate port", &other),
    }
}

async fn whitelist_caller(state: &AppState, instance: &Instance, ip: IpAddr) -> Result<(), ApiError> {
    state
        .addresses
        .create(WhitelistedAddress::new(ip, instance))
        .await
        .map_err(|e| ApiError::internal("failed to record whitelisted IP address", &e))?;
    state.whitelist.trigger(API_SOURCE);
    Ok(())
}
