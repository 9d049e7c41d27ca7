//! HTTP control plane: lifecycle, event queries, the SSE live stream, and
//! clip file serving. This is the only module that knows how domain errors
//! map onto HTTP.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use chrono::Utc;
use futures_util::Stream;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::config::{AppConfig, Settings};
use crate::database::{Database, EventRecord};
use crate::error::PipelineError;
use crate::pipeline::{NewEvent, PersistFn, PipelineService};

const DEFAULT_EVENTS_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<PipelineService>,
    pub db: Option<Arc<Database>>,
    pub settings: Arc<Settings>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/status", get(status))
        .route("/events", get(get_events))
        .route("/events/id/:event_id", get(get_event))
        .route("/events/stream", get(stream_events))
        .route("/video", get(get_video))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve the control plane until a shutdown signal arrives.
pub async fn serve(state: AppState, host: &str, port: u16) -> Result<()> {
    let app = create_router(state);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("control plane listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
        })
        .await
        .context("server error")
}

fn error_status(err: &PipelineError) -> StatusCode {
    use PipelineError::*;
    match err {
        ServiceAlreadyRunning | ServiceNotRunning => StatusCode::CONFLICT,
        InvalidConfig(_) | DatabaseNotConfigured => StatusCode::BAD_REQUEST,
        EventNotFound(_) | InvalidVideoPath(_) => StatusCode::NOT_FOUND,
        VideoProcessingFailed(_) | FrameExtractionFailed(_) | AiDetectionFailed(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let body = json!({ "error_code": self.code(), "message": self.to_string() });
        (error_status(&self), Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    service_active: bool,
    queue_info: QueueInfoResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct QueueInfoResponse {
    video_chunks_queue_size: usize,
    event_detection_queue_size: usize,
}

#[derive(Debug, Serialize)]
struct EventResponse {
    event_id: i32,
    event_timestamp: String,
    event_code: String,
    event_description: String,
    event_video_url: String,
    event_detection_explanation_by_ai: String,
}

impl From<EventRecord> for EventResponse {
    fn from(record: EventRecord) -> Self {
        Self {
            event_id: record.event_id,
            event_timestamp: record.event_timestamp.to_rfc3339(),
            event_code: record.event_code,
            event_description: record.event_description,
            event_video_url: record.event_video_url,
            event_detection_explanation_by_ai: record.event_detection_explanation_by_ai,
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let database = match &state.db {
        Some(db) => match db.health_check().await {
            Ok(()) => "connected",
            Err(_) => "disconnected",
        },
        None => "not configured",
    };
    Json(json!({ "status": "healthy", "database": database, "timestamp": Utc::now() }))
}

async fn start(
    State(state): State<AppState>,
    Json(raw): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, PipelineError> {
    let config: AppConfig = serde_json::from_value(raw)
        .map_err(|e| PipelineError::InvalidConfig(format!("config is missing required keys: {e}")))?;

    let persist = state.db.clone().map(persist_callback);
    let api_key = state.settings.google_api_key.clone().unwrap_or_default();
    state
        .pipeline
        .start(config, &state.settings.video_chunks_dir, api_key, persist)?;

    Ok(Json(json!({ "status": "Services started successfully" })))
}

/// Each write checks out its own pooled connection; nothing is shared
/// between worker iterations.
fn persist_callback(db: Arc<Database>) -> PersistFn {
    Arc::new(move |event: NewEvent| {
        let db = Arc::clone(&db);
        Box::pin(async move { db.insert_event(&event).await })
    })
}

async fn stop(State(state): State<AppState>) -> Result<Json<serde_json::Value>, PipelineError> {
    state.pipeline.stop().await?;
    Ok(Json(json!({ "status": "Services stopped successfully" })))
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let status = state.pipeline.status();
    Json(StatusResponse {
        service_active: status.active,
        queue_info: QueueInfoResponse {
            video_chunks_queue_size: status.queues.video_paths,
            event_detection_queue_size: status.queues.detections,
        },
        stream_url: status.stream_url,
    })
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<i64>,
}

async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let Some(db) = state.db.as_ref() else {
        return PipelineError::DatabaseNotConfigured.into_response();
    };
    match db.recent_events(query.limit.unwrap_or(DEFAULT_EVENTS_LIMIT)).await {
        Ok(records) => {
            let events: Vec<EventResponse> = records.into_iter().map(Into::into).collect();
            Json(json!({ "events": events })).into_response()
        }
        Err(e) => {
            error!("failed to list events: {e:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_event(State(state): State<AppState>, Path(event_id): Path<i32>) -> Response {
    let Some(db) = state.db.as_ref() else {
        return PipelineError::DatabaseNotConfigured.into_response();
    };
    match db.event_by_id(event_id).await {
        Ok(Some(record)) => Json(EventResponse::from(record)).into_response(),
        Ok(None) => PipelineError::EventNotFound(event_id).into_response(),
        Err(e) => {
            error!("failed to fetch event {event_id}: {e:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Server-sent events: one frame per published event. The subscription is
/// dropped (and thus unregistered) when the client disconnects.
async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = state.pipeline.subscribe();
    let stream = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.next().await?;
        let frame = SseEvent::default().json_data(&event).unwrap_or_default();
        Some((Ok(frame), subscription))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct VideoQuery {
    filepath: String,
}

async fn get_video(Query(query): Query<VideoQuery>) -> Response {
    let path = PathBuf::from(&query.filepath);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "clip.mp4".to_string());
            (
                [
                    (header::CONTENT_TYPE, "video/mp4".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{filename}\""),
                    ),
                ],
                bytes,
            )
                .into_response()
        }
        Err(_) => PipelineError::InvalidVideoPath(query.filepath).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn lifecycle_errors_map_to_conflict() {
        let response = PipelineError::ServiceAlreadyRunning.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["error_code"], "SERVICE_ALREADY_RUNNING");
        assert_eq!(body["message"], "Service is already running");

        let response = PipelineError::ServiceNotRunning.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn config_errors_map_to_bad_request() {
        let response =
            PipelineError::InvalidConfig("chunk duration must be positive".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error_code"], "INVALID_CONFIG");

        let response = PipelineError::DatabaseNotConfigured.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error_code"], "DATABASE_NOT_CONFIGURED");
    }

    #[tokio::test]
    async fn missing_resources_map_to_not_found() {
        let response = PipelineError::EventNotFound(42).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error_code"], "EVENT_NOT_FOUND");
        assert_eq!(body["message"], "Event 42 not found");

        let response = PipelineError::InvalidVideoPath("/tmp/x.mp4".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error_code"], "INVALID_VIDEO_PATH");
    }

    #[tokio::test]
    async fn video_endpoint_rejects_missing_files() {
        let response = get_video(Query(VideoQuery {
            filepath: "/definitely/not/here.mp4".to_string(),
        }))
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn video_endpoint_serves_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("20260801100000_20260801100002.mp4");
        std::fs::write(&clip, b"not really mp4").unwrap();

        let response = get_video(Query(VideoQuery {
            filepath: clip.to_string_lossy().into_owned(),
        }))
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "video/mp4"
        );
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(disposition.contains("20260801100000_20260801100002.mp4"));
    }
}
