use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use switchyard_infra::channel::ChannelError;

use crate::app::services::ServiceError;

pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    match err {
        ServiceError::Domain(e) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        ServiceError::Channel(e @ ChannelError::ChannelMissing(_)) => {
            json_error(StatusCode::NOT_FOUND, "channel_missing", e.to_string())
        }
        ServiceError::Channel(e @ ChannelError::ChannelPaused(_)) => {
            json_error(StatusCode::CONFLICT, "channel_paused", e.to_string())
        }
        ServiceError::Channel(ChannelError::Domain(e)) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        ServiceError::Channel(ChannelError::Store(e)) => {
            tracing::error!(error = %e, "store call failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_error", e.to_string())
        }
        ServiceError::Snapshot(e) => {
            tracing::error!(error = %e, "snapshot store call failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "snapshot_error", e.to_string())
        }
        ServiceError::Join(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
