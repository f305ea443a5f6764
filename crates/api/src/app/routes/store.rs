//! Keyed access to archived job snapshots.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(bucket_size))
        .route("/:key", get(get_value).delete(delete_value))
        .route("/:key/:value", post(put_value))
}

pub async fn bucket_size(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let bucket = services.bucket.clone();
    match services
        .run(|s| Ok(s.snapshots.count(&s.bucket)?))
        .await
    {
        Ok(count) => Json(json!({ "bucket": bucket, "count": count })).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn get_value(
    Extension(services): Extension<Arc<AppServices>>,
    Path(key): Path<String>,
) -> axum::response::Response {
    let lookup = key.clone();
    let found = services
        .run(move |s| Ok(s.snapshots.get(&s.bucket, &lookup)?))
        .await;

    match found {
        Ok(Some(raw)) => {
            let (value, is_json) = dto::snapshot_value(raw);
            Json(json!({
                "success": true,
                "key": key,
                "value": value,
                "json": is_json,
            }))
            .into_response()
        }
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "key not found"),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn put_value(
    Extension(services): Extension<Arc<AppServices>>,
    Path((key, value)): Path<(String, String)>,
) -> axum::response::Response {
    match services
        .run(move |s| Ok(s.snapshots.put(&s.bucket, &key, &value)?))
        .await
    {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn delete_value(
    Extension(services): Extension<Arc<AppServices>>,
    Path(key): Path<String>,
) -> axum::response::Response {
    match services
        .run(move |s| Ok(s.snapshots.delete(&s.bucket, &key)?))
        .await
    {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
