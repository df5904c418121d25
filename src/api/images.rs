//! Image routes
//!
//! An image is a restored backup. Uploaders create the record, fill its volume,
//! then call `done` to anonymise and snapshot it before instances may clone it.

use axum::{
    Extension, Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use super::instances::teardown;
use super::{API_SOURCE, ApiError, AppState, detached};
use crate::auth::AuthenticatedUser;
use crate::models::{Image, ImageId};
use crate::store::StoreError;

/// Body of `POST /images`
#[derive(Debug, Deserialize)]
pub struct CreateImageRequest {
    backed_up_at: DateTime<Utc>,
    #[serde(default)]
    anonymisation_script: String,
}

/// `GET /images`
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Image>>, ApiError> {
    state
        .images
        .list()
        .await
        .map(Json)
        .map_err(|e| ApiError::internal("failed to get images", &e))
}

/// `GET /images/{id}`
pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Image>, ApiError> {
    find(&state, &id).await.map(Json)
}

/// `POST /images`: record a new image and create its upload volume
pub async fn create(
    State(state): State<AppState>,
    body: Result<Json<CreateImageRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(format!("invalid JSON: {e}")))?;

    let image = detached(async move {
        let image = state
            .images
            .create(Image::new(request.backed_up_at, request.anonymisation_script))
            .await
            .map_err(|e| ApiError::internal("failed to create image", &e))?;

        if let Err(e) = state.executor.create_image_volume(image.id).await {
            if let Err(cleanup) = state.images.destroy(image.id).await {
                warn!(image_id = image.id, error = %cleanup, "Failed to remove record of image without volume");
            }
            return Err(ApiError::internal("failed to create image volume", &e));
        }

        info!(image_id = image.id, backed_up_at = %image.backed_up_at, "Created image");
        Ok::<_, ApiError>(image)
    })
    .await?;

    Ok((StatusCode::CREATED, Json(image)).into_response())
}

/// `POST /images/{id}/done`: finalise the upload and mark the image ready
pub async fn done(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Image>, ApiError> {
    let image = find(&state, &id).await?;
    if image.ready {
        return Ok(Json(image));
    }

    detached(async move {
        state
            .executor
            .finalise_image(&image)
            .await
            .map_err(|e| ApiError::internal("failed to finalise image", &e))?;

        let image = state
            .images
            .mark_ready(image.id)
            .await
            .map_err(|e| ApiError::internal("failed to mark image as ready", &e))?;

        info!(image_id = image.id, "Finalised image");
        Ok::<_, ApiError>(Json(image))
    })
    .await
}

/// `DELETE /images/{id}`.
///
/// The upload identity tears down the image's instances first; anyone else
/// gets 422 while instances remain.
pub async fn destroy(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let image = find(&state, &id).await?;

    detached(async move {
        if user.is_upload() {
            let instances = state
                .instances
                .list()
                .await
                .map_err(|e| ApiError::internal("failed to get instances", &e))?;

            let mut destroyed = 0;
            for instance in instances.iter().filter(|i| i.image_id == image.id) {
                info!(instance_id = instance.id, image_id = image.id, "Destroying instance of image");
                teardown(&state, instance).await?;
                destroyed += 1;
            }
            if destroyed > 0 {
                state.whitelist.trigger(API_SOURCE);
            }
        }

        match state.images.destroy(image.id).await {
            Ok(()) => {}
            Err(StoreError::ImageInUse { instances, .. }) => {
                return Err(ApiError::unprocessable(format!(
                    "image has {instances} instance(s), destroy them first"
                )));
            }
            Err(e) => return Err(ApiError::internal("failed to remove image from store", &e)),
        }

        state
            .executor
            .destroy_image(image.id)
            .await
            .map_err(|e| ApiError::internal("failed to destroy image on disk", &e))?;

        info!(image_id = image.id, user_email = %user.email, "Destroyed image");
        Ok::<_, ApiError>(StatusCode::NO_CONTENT)
    })
    .await
}

async fn find(state: &AppState, id: &str) -> Result<Image, ApiError> {
    let id: ImageId = id.parse().map_err(|_| ApiError::not_found())?;
    match state.images.get(id).await {
        Ok(image) => Ok(image),
        Err(StoreError::ImageNotFound(_)) => Err(ApiError::not_found()),
        Err(e) => Err(ApiError::internal("failed to get image", &e)),
    }
}
