//! HTTP control surface
//!
//! `GET /healthz`, `POST /v1/jobs`, `DELETE /v1/jobs/:id` and
//! `POST /v1/uploads`. The `/v1` routes require `Authorization: Bearer <token>`
//! when a token is configured. Errors are plain text, successes JSON.

use crate::controller::{Controller, ControllerError, NewJob, NewUpload, StopOutcome};
use crate::jobs::{JobKind, Rendition};
use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Errors that can occur when running the API server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Request failures, rendered as plain-text responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    BadRequest(&'static str),
    Unauthorized,
    NotFound,
    Internal(&'static str),
}

impl ApiError {
    /// Public message for a failed create; details are logged by the controller.
    fn from_controller(err: &ControllerError, kind: JobKind) -> Self {
        let message = match (err, kind) {
            (ControllerError::Plan(_), _) => "unable to prepare transcode",
            (ControllerError::Start(_), _) => "failed to start encoder",
            (ControllerError::Store(_), JobKind::Live) => "failed to persist job",
            (ControllerError::Store(_), JobKind::Upload) => "failed to persist upload",
            (ControllerError::Registry(_), _) | (ControllerError::Publish(_), _) => {
                "internal error"
            }
        };
        ApiError::Internal(message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized").into_response(),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
            ApiError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
            }
        }
    }
}

const INVALID_PAYLOAD: &str = "invalid payload";
const INVALID_RENDITIONS: &str = "invalid renditions";
const JOB_FIELDS_REQUIRED: &str = "channelId, sessionId, and originUrl are required";
const UPLOAD_FIELDS_REQUIRED: &str = "channelId, uploadId, and sourceUrl are required";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobRequest {
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    origin_url: Option<String>,
    #[serde(default)]
    renditions: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadRequest {
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    upload_id: Option<String>,
    #[serde(default)]
    source_url: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    renditions: Option<Value>,
}

/// One ladder entry as clients send it. Any `manifestUrl` is ignored.
#[derive(Debug, Deserialize)]
struct RenditionRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    bitrate: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobResponse {
    job_id: String,
    job_ids: Vec<String>,
    renditions: Vec<Rendition>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    job_id: String,
    playback_url: String,
    renditions: Vec<Rendition>,
}

fn required(field: Option<String>) -> Option<String> {
    field.filter(|value| !value.trim().is_empty())
}

fn parse_renditions(raw: Option<Value>) -> Result<Vec<Rendition>, ApiError> {
    match raw {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => {
            let entries: Vec<RenditionRequest> = serde_json::from_value(value)
                .map_err(|_| ApiError::BadRequest(INVALID_RENDITIONS))?;
            Ok(entries
                .into_iter()
                .map(|entry| Rendition::new(entry.name.unwrap_or_default(), entry.bitrate))
                .collect())
        }
    }
}

/// Parse and validate a `POST /v1/jobs` body
pub fn parse_job_request(body: &[u8]) -> Result<NewJob, ApiError> {
    let request: JobRequest =
        serde_json::from_slice(body).map_err(|_| ApiError::BadRequest(INVALID_PAYLOAD))?;

    let (Some(channel_id), Some(session_id), Some(origin_url)) = (
        required(request.channel_id),
        required(request.session_id),
        required(request.origin_url),
    ) else {
        return Err(ApiError::BadRequest(JOB_FIELDS_REQUIRED));
    };

    Ok(NewJob {
        channel_id,
        session_id,
        origin_url,
        renditions: parse_renditions(request.renditions)?,
    })
}

/// Parse and validate a `POST /v1/uploads` body
pub fn parse_upload_request(body: &[u8]) -> Result<NewUpload, ApiError> {
    let request: UploadRequest =
        serde_json::from_slice(body).map_err(|_| ApiError::BadRequest(INVALID_PAYLOAD))?;

    let (Some(channel_id), Some(upload_id), Some(source_url)) = (
        required(request.channel_id),
        required(request.upload_id),
        required(request.source_url),
    ) else {
        return Err(ApiError::BadRequest(UPLOAD_FIELDS_REQUIRED));
    };

    Ok(NewUpload {
        channel_id,
        upload_id,
        source_url,
        filename: request.filename.unwrap_or_default(),
        renditions: parse_renditions(request.renditions)?,
    })
}

/// Checks an `Authorization` header value against the expected token.
///
/// The `Bearer ` scheme is matched case-insensitively and the token is
/// compared after trimming.
pub fn bearer_token_matches(header: Option<&str>, expected: &str) -> bool {
    let Some(header) = header.map(str::trim) else {
        return false;
    };
    match (header.get(..7), header.get(7..)) {
        (Some(scheme), Some(token)) if scheme.eq_ignore_ascii_case("bearer ") => {
            token.trim() == expected
        }
        _ => false,
    }
}

#[derive(Clone)]
struct ApiState {
    controller: Arc<Controller>,
    token: Option<Arc<str>>,
}

async fn require_token(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    if let Some(expected) = &state.token {
        let header = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        if !bearer_token_matches(header, expected) {
            return ApiError::Unauthorized.into_response();
        }
    }
    next.run(request).await
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;
    info!(
        "{} {} -> {} ({:?})",
        method,
        path,
        response.status().as_u16(),
        started.elapsed()
    );
    response
}

async fn healthz() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_job(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let request = parse_job_request(&body)?;
    let created = state
        .controller
        .create_job(request)
        .await
        .map_err(|e| ApiError::from_controller(&e, JobKind::Live))?;

    Ok((
        StatusCode::CREATED,
        Json(JobResponse {
            job_ids: vec![created.job_id.clone()],
            job_id: created.job_id,
            renditions: created.renditions,
        }),
    ))
}

async fn stop_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.controller.stop_job(&id).await {
        StopOutcome::Stopped => Ok(StatusCode::NO_CONTENT),
        StopOutcome::NotFound => Err(ApiError::NotFound),
    }
}

async fn create_upload(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let request = parse_upload_request(&body)?;
    let created = state
        .controller
        .create_upload(request)
        .await
        .map_err(|e| ApiError::from_controller(&e, JobKind::Upload))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            job_id: created.job_id,
            playback_url: created.playback_url,
            renditions: created.renditions,
        }),
    ))
}

/// Creates the axum Router for the control API
///
/// A blank `token` disables authentication.
pub fn create_api_router(controller: Arc<Controller>, token: Option<&str>) -> Router {
    let state = ApiState {
        controller,
        token: token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(Arc::from),
    };

    let v1 = Router::new()
        .route("/v1/jobs", post(create_job))
        .route("/v1/jobs/:id", delete(stop_job))
        .route("/v1/uploads", post(create_upload))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(v1)
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

/// Serve `router` until `shutdown` resolves
///
/// After the shutdown signal the listener stops accepting and in-flight
/// requests get `grace` to finish; the server task is then aborted.
pub async fn run_api_server<F>(
    listener: TcpListener,
    router: Router,
    grace: Duration,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send,
{
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = stop_rx.wait_for(|stop| *stop).await;
    });
    let mut server_task = tokio::spawn(async move { server.await });

    tokio::select! {
        result = &mut server_task => return Ok(result??),
        _ = shutdown => {}
    }

    info!(grace_secs = grace.as_secs(), "shutting down API server");
    let _ = stop_tx.send(true);

    match tokio::time::timeout(grace, &mut server_task).await {
        Ok(result) => Ok(result??),
        Err(_) => {
            warn!("grace period elapsed, closing remaining connections");
            server_task.abort();
            Ok(())
        }
    }
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
