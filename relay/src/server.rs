//! HTTP front end: request validation, streaming responses, session tasks

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use eyre::{Context, Result};
use futures::FutureExt;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, error, info, info_span};
use uuid::Uuid;

use crate::directions::{DIRECTIONS_PATH, DirectionsClient, DirectionsError, DirectionsRequest};
use crate::events::OutboundEvent;
use crate::pipeline::{Pipeline, PipelineOutcome, Session};
use crate::sink::{DEFAULT_CHANNEL_CAPACITY, EventSink, SinkError};

/// Path of the planning endpoint
pub const PLAN_PATH: &str = "/api/plan";

const QUERY_REQUIRED: &str = "query is required";

/// State shared by every request handler
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
    directions: Option<Arc<DirectionsClient>>,
    channel_capacity: usize,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            directions: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Serve route lookups at `/api/directions` through this client
    pub fn with_directions(mut self, directions: DirectionsClient) -> Self {
        self.directions = Some(Arc::new(directions));
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}

#[derive(Debug, Deserialize)]
struct PlanRequest {
    #[serde(default)]
    query: Option<String>,
}

/// Extract a usable query from a raw request body
pub fn parse_query(body: &[u8]) -> Option<String> {
    let request: PlanRequest = serde_json::from_slice(body).ok()?;
    request.query.filter(|query| !query.is_empty())
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route(PLAN_PATH, post(plan).options(preflight))
        .route("/health", get(health));
    if state.directions.is_some() {
        router = router.route(DIRECTIONS_PATH, post(directions).options(preflight));
    }
    router.with_state(state)
}

/// Bind and serve until Ctrl+C
pub async fn serve(host: &str, port: u16, state: AppState) -> Result<()> {
    let listener = TcpListener::bind((host, port))
        .await
        .context(format!("Failed to bind {}:{}", host, port))?;
    info!("planrelay listening on http://{}{}", listener.local_addr()?, PLAN_PATH);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("planrelay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down");
}

async fn health() -> &'static str {
    "Ok"
}

async fn preflight() -> Response {
    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("POST, OPTIONS"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type"));
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    response
}

async fn plan(State(state): State<AppState>, body: Bytes) -> Response {
    let Some(query) = parse_query(&body) else {
        debug!(body_len = body.len(), "plan: rejecting request without query");
        let mut response = (StatusCode::BAD_REQUEST, Json(json!({"error": QUERY_REQUIRED}))).into_response();
        response
            .headers_mut()
            .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        return response;
    };

    let (sink, rx) = EventSink::channel(state.channel_capacity);
    let session_id = Uuid::now_v7();
    let span = info_span!("session", id = %session_id);
    tokio::spawn(run_session(state.pipeline.clone(), Session::new(query, sink)).instrument(span));

    stream_response(ReceiverStream::new(rx))
}

async fn directions(State(state): State<AppState>, body: Bytes) -> Response {
    let Some(client) = state.directions.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let result = match serde_json::from_slice::<DirectionsRequest>(&body) {
        Ok(request) => client.route(&request).await,
        Err(e) => {
            debug!(error = %e, "directions: unreadable request body");
            Err(DirectionsError::InvalidArgument)
        }
    };

    let mut response = match result {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => {
            let status = directions_status(&e);
            if status.is_server_error() {
                error!(error = %e, "directions: lookup failed");
            } else {
                debug!(error = %e, "directions: request rejected");
            }
            (status, Json(json!({"error": e.to_string()}))).into_response()
        }
    };
    response
        .headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

fn directions_status(err: &DirectionsError) -> StatusCode {
    match err {
        DirectionsError::InvalidArgument => StatusCode::BAD_REQUEST,
        DirectionsError::MissingCredential { .. } => StatusCode::SERVICE_UNAVAILABLE,
        DirectionsError::Upstream { .. } | DirectionsError::Transport(_) | DirectionsError::InvalidResponse(_) => {
            StatusCode::BAD_GATEWAY
        }
    }
}

fn stream_response(frames: ReceiverStream<crate::sink::Frame>) -> Response {
    let mut response = Response::new(Body::from_stream(frames));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

/// Run one session to a terminal state
///
/// Whatever happens inside the pipeline, including a panic, the stream ends
/// with at most one terminal event. When the pipeline did not write one and
/// the client is still there, a final `error` event is attempted.
pub async fn run_session(pipeline: Arc<Pipeline>, mut session: Session) {
    info!(query_len = session.query().len(), "Session started");
    let result = AssertUnwindSafe(pipeline.run(&mut session)).catch_unwind().await;

    let Some(failure) = unreported_failure(result, &session) else {
        return;
    };
    if session.sink().is_terminated() {
        return;
    }
    if let Err(e) = session.sink().send(&OutboundEvent::Error { status: &failure }).await {
        debug!(error = %e, "Session: final error event not delivered");
    }
}

type RunResult = std::thread::Result<Result<PipelineOutcome, SinkError>>;

// The message still owed to the client, if any. Finished runs already wrote
// their terminal event and a departed client has no one to tell.
fn unreported_failure(result: RunResult, session: &Session) -> Option<String> {
    match result {
        Ok(Ok(PipelineOutcome::Completed { .. })) => {
            info!("Session completed");
            None
        }
        Ok(Ok(PipelineOutcome::Failed { stage, message })) => {
            info!(%stage, %message, "Session halted");
            None
        }
        Ok(Err(SinkError::Disconnected)) => {
            debug!(state = %session.state(), "Session ended: client disconnected");
            None
        }
        Ok(Err(e)) => {
            error!(error = %e, state = %session.state(), "Session ended: event not written");
            Some(e.to_string())
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(%message, state = %session.state(), "Session panicked");
            Some(message)
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "internal error".to_string()
    }
}
