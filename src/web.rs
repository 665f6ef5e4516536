//! HTTP surface: video, server events, camera and drive control
//!
//! - `GET /video_feed` multipart JPEG stream
//! - `GET /event_stream` server-sent state changes
//! - `GET|POST /api/camera/ptz`, `GET|POST /api/camera/focus`
//! - `POST /api/camera/reset`, `GET /api/camera/controls`
//! - `POST /api/motion/direction`

use std::convert::Infallible;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::error::{ControlError, DispatchError, StreamError};
use crate::motion::{Maneuver, MotionRequest};
use crate::pipeline::events::Consumed;
use crate::pipeline::streamer;
use crate::records::{DirectionRecord, FocusRecord, PtzRecord, ServerEvent};
use crate::utils::lock;

type Ctx = State<Arc<AppContext>>;

/// Error response with a JSON `message`
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "message": self.1 }))).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    }
}

impl From<StreamError> for ApiError {
    fn from(e: StreamError) -> Self {
        ApiError(StatusCode::CONFLICT, e.to_string())
    }
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/video_feed", get(video_feed))
        .route("/event_stream", get(event_stream))
        .route("/api/camera/ptz", get(get_ptz).post(set_ptz))
        .route("/api/camera/focus", get(get_focus).post(set_focus))
        .route("/api/camera/reset", post(reset_camera))
        .route("/api/camera/controls", get(get_controls))
        .route("/api/motion/direction", post(set_direction))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Serve until a shutdown signal, then give open connections a grace period.
pub async fn serve(ctx: Arc<AppContext>) -> std::io::Result<()> {
    let server = &ctx.config.server;
    let addr: SocketAddr = format!("{}:{}", server.host, server.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let grace = Duration::from_secs(server.shutdown_grace_secs);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{addr}");

    tokio::spawn(shutdown_signal(ctx.shutdown.clone()));

    let token = ctx.shutdown.clone();
    let graceful = axum::serve(listener, router(ctx.clone()))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .into_future();

    tokio::select! {
        result = graceful => result,
        _ = async {
            ctx.shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!("Connections still open after {grace:?}, closing anyway");
            Ok(())
        }
    }
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = token.cancelled() => return,
    }
    info!("Shutdown requested");
    token.cancel();
}

async fn video_feed(State(ctx): Ctx) -> Result<Response, ApiError> {
    let frames = ctx.streamer.activate()?;
    let body = Body::from_stream(frames.map(Ok::<_, Infallible>));
    Ok(([(header::CONTENT_TYPE, streamer::CONTENT_TYPE)], body).into_response())
}

async fn event_stream(State(ctx): Ctx) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = ctx.events.clone();
    let shutdown = ctx.shutdown.clone();
    let poll = Duration::from_millis(ctx.config.events.poll_interval_ms);

    let stream = stream! {
        loop {
            let consumed = tokio::select! {
                _ = shutdown.cancelled() => break,
                consumed = events.consume(poll) => consumed,
            };
            let Consumed::Event(event) = consumed else {
                continue;
            };
            match sse_event(&event) {
                Ok(sse) => yield Ok(sse),
                Err(e) => warn!(id = %event.id, "Dropping unserializable event: {e}"),
            }
        }
        debug!("Event stream closed");
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_event(event: &ServerEvent) -> Result<Event, axum::Error> {
    Event::default()
        .event(event.event)
        .id(event.id.to_string())
        .json_data(&event.data)
}

async fn get_ptz(State(ctx): Ctx) -> Json<PtzRecord> {
    Json(ctx.dispatcher.ptz())
}

async fn set_ptz(State(ctx): Ctx, Json(record): Json<PtzRecord>) -> Result<Json<Value>, ApiError> {
    ctx.dispatcher.submit(MotionRequest::Ptz(record))?;
    Ok(Json(json!({ "message": "PTZ submitted successfully!", "data": record })))
}

async fn get_focus(State(ctx): Ctx) -> Json<FocusRecord> {
    Json(ctx.dispatcher.focus())
}

async fn set_focus(State(ctx): Ctx, Json(record): Json<FocusRecord>) -> Result<Json<Value>, ApiError> {
    ctx.dispatcher.submit(MotionRequest::Focus(record))?;
    Ok(Json(json!({ "message": "Focus submitted successfully!", "data": record })))
}

async fn reset_camera(State(ctx): Ctx) -> Result<Json<Value>, ApiError> {
    ctx.dispatcher.submit(MotionRequest::Reset)?;
    Ok(Json(json!({ "message": "Camera was reset successfully!" })))
}

#[derive(Debug, Deserialize)]
struct ControlsQuery {
    hierarchy: Option<bool>,
}

async fn get_controls(State(ctx): Ctx, Query(query): Query<ControlsQuery>) -> Result<Json<Value>, ApiError> {
    let hierarchy = query.hierarchy.unwrap_or(true);
    let motion = ctx.motion.clone();
    let catalog = tokio::task::spawn_blocking(move || lock(&motion).get_controls(hierarchy)).await??;
    Ok(Json(json!({ "data": catalog })))
}

async fn set_direction(State(ctx): Ctx, Json(record): Json<DirectionRecord>) -> Json<Value> {
    let maneuver = Maneuver::from(record.direction);
    let mut errors = Vec::new();

    match lock(&ctx.tracks).apply(maneuver) {
        Ok(true) => ctx.events.publish(ServerEvent::new(record.into())),
        Ok(false) => debug!(heading = ?record.direction, "Heading has no drive mapping"),
        Err(e) => {
            warn!("Drive command failed: {e}");
            errors.push(e.to_string());
        }
    }

    Json(json!({
        "message": "Direction submitted successfully!",
        "data": record,
        "errors": errors,
    }))
}
