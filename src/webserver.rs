use crate::admission::{self, Review};
use crate::image_reference::{ImageReference, ParseError};
use crate::notify::{DockerHubPayload, QuayPayload};
use crate::state::AppState;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

pub async fn readiness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(text) => ([(header::CONTENT_TYPE, state.metrics.content_type())], text).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn pushed_images<P: DeserializeOwned>(
    body: &[u8],
    images: impl FnOnce(&P) -> Result<Vec<ImageReference>, ParseError>,
) -> Result<Vec<ImageReference>, String> {
    let payload: P = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    images(&payload).map_err(|e| e.to_string())
}

async fn images_pushed(
    state: &AppState,
    source: &str,
    images: Result<Vec<ImageReference>, String>,
) -> StatusCode {
    let images = match images {
        Ok(images) => images,
        Err(e) => {
            warn!(source, error = %e, "Undecodable push notification");
            return StatusCode::BAD_REQUEST;
        }
    };
    match state.notifier.images_pushed(&images).await {
        Ok(updated) => {
            info!(source, images = images.len(), updated, "Processed push notification");
            StatusCode::OK
        }
        Err(e) => {
            warn!(source, error = %e, "Push notification failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn dockerhub_push(State(state): State<AppState>, body: Bytes) -> StatusCode {
    let images = pushed_images::<DockerHubPayload>(&body, DockerHubPayload::images);
    images_pushed(&state, "dockerhub", images).await
}

async fn quay_push(State(state): State<AppState>, body: Bytes) -> StatusCode {
    let images = pushed_images::<QuayPayload>(&body, QuayPayload::images);
    images_pushed(&state, "quay", images).await
}

async fn validate_tag(body: Bytes) -> Json<Review> {
    Json(admission::validate_tag(&body))
}

async fn mutate_pod(State(state): State<AppState>, body: Bytes) -> Json<Review> {
    Json(admission::mutate_pod(&state.tag_syncer, &body).await)
}

/// Probes, metrics and registry push notifications, served over plain HTTP.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/metrics", get(metrics))
        .route("/webhooks/dockerhub", post(dockerhub_push))
        .route("/webhooks/quay", post(quay_push))
        .with_state(state)
}

/// Admission webhooks, served over HTTPS.
pub fn create_admission_app(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/admission/validate-tag", post(validate_tag))
        .route("/admission/mutate-pod", post(mutate_pod))
        .with_state(state)
}
