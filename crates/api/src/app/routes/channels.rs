//! Channel status and control.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tracing::info;

use switchyard_core::{ChannelName, JobId};
use switchyard_infra::channel::ChannelStatus;

use crate::app::services::{AppServices, ServiceError};
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_channels))
        .route("/:name", get(get_channel))
        .route("/:name/pause", post(pause_channel))
        .route("/:name/resume", post(resume_channel))
        .route("/:name/jobs", post(enqueue_job))
        .route("/:name/requeue", post(requeue_orphans))
}

pub async fn list_channels(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let listed = services
        .run(|s| {
            let mut statuses: Vec<ChannelStatus> = Vec::new();
            for name in s.channels.list()? {
                if let Some(status) = s.channels.status(&name)? {
                    statuses.push(status);
                }
            }
            Ok(statuses)
        })
        .await;

    match listed {
        Ok(channels) => Json(json!({ "channels": channels })).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn get_channel(
    Extension(services): Extension<Arc<AppServices>>,
    Path(name): Path<String>,
) -> axum::response::Response {
    let status = services
        .run(move |s| {
            let name = ChannelName::new(name)?;
            Ok(s.channels.status(&name)?)
        })
        .await;

    match status {
        Ok(Some(status)) => Json(status).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "channel_missing", "channel not found"),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn pause_channel(
    Extension(services): Extension<Arc<AppServices>>,
    Path(name): Path<String>,
) -> axum::response::Response {
    set_paused(services, name, true).await
}

pub async fn resume_channel(
    Extension(services): Extension<Arc<AppServices>>,
    Path(name): Path<String>,
) -> axum::response::Response {
    set_paused(services, name, false).await
}

async fn set_paused(
    services: Arc<AppServices>,
    name: String,
    paused: bool,
) -> axum::response::Response {
    let result = services
        .run(move |s| {
            let name = ChannelName::new(name)?;
            if paused {
                s.channels.pause(&name)?;
            } else {
                s.channels.resume(&name)?;
            }
            Ok(name)
        })
        .await;

    match result {
        Ok(name) => Json(json!({
            "success": true,
            "channel": name.as_str(),
            "paused": paused,
        }))
        .into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn enqueue_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(name): Path<String>,
    Json(body): Json<dto::EnqueueRequest>,
) -> axum::response::Response {
    let result = services
        .run(move |s| {
            let channel = ChannelName::new(name)?;
            let id = match body.id.as_deref() {
                Some(raw) => JobId::new(raw)?,
                None => JobId::generate(),
            };
            s.channels.enqueue(&channel, &id, body.field_values())?;
            Ok::<_, ServiceError>((channel, id))
        })
        .await;

    match result {
        Ok((channel, id)) => {
            info!(channel = %channel, job_id = %id, "job enqueued via admin api");
            (
                StatusCode::CREATED,
                Json(json!({ "id": id.as_str(), "channel": channel.as_str() })),
            )
                .into_response()
        }
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn requeue_orphans(
    Extension(services): Extension<Arc<AppServices>>,
    Path(name): Path<String>,
) -> axum::response::Response {
    let result = services
        .run(move |s| {
            let name = ChannelName::new(name)?;
            Ok(s.channels.requeue_orphans(&name)?)
        })
        .await;

    match result {
        Ok(ids) => {
            let ids: Vec<&str> = ids.iter().map(JobId::as_str).collect();
            Json(json!({ "requeued": ids })).into_response()
        }
        Err(e) => errors::service_error_to_response(e),
    }
}
