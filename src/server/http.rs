use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Map, Value as JsonValue};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ENV_DISABLE_HEALTH_LOGS, ENV_LOG_LEVEL, ENV_WORKSPACE_BASE};
use crate::error::{GatewayError, Result};
use crate::proto::SCHEMA_VERSION;
use crate::request::json::{parse_request, status_to_json, to_json};
use crate::request::{DataRequest, DEFAULT_ENDPOINT};
use crate::streamer::Streamer;

const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

#[derive(Clone)]
struct HttpState {
    streamer: Streamer,
}

pub fn router(streamer: Streamer) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/status", get(status))
        .route("/dry_run", get(dry_run))
        .route("/metrics", get(metrics))
        .route("/*endpoint", post(post_endpoint))
        .with_state(HttpState { streamer })
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}

pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> Result<()> {
    if let Ok(address) = listener.local_addr() {
        info!(%address, "HTTP gateway listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health(State(state): State<HttpState>) -> StatusCode {
    if !state.streamer.config().disable_health_logs {
        info!(method = "GET", path = "/", status = 200, "health check");
    }
    StatusCode::OK
}

async fn status(State(state): State<HttpState>) -> Json<JsonValue> {
    let config = state.streamer.config();
    let mut envs = Map::new();
    envs.insert(ENV_LOG_LEVEL.into(), JsonValue::String(config.log_level.clone()));
    envs.insert(
        ENV_DISABLE_HEALTH_LOGS.into(),
        JsonValue::Bool(config.disable_health_logs),
    );
    envs.insert(
        ENV_WORKSPACE_BASE.into(),
        config
            .workspace_base
            .clone()
            .map_or(JsonValue::Null, JsonValue::String),
    );
    Json(json!({
        "jina": {
            "gateway": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "proto_version": SCHEMA_VERSION,
        },
        "envs": envs,
    }))
}

/// Runs an empty request through the Flow and reports how it ended.
async fn dry_run(State(state): State<HttpState>) -> Json<JsonValue> {
    let status = match state.streamer.unary(DataRequest::new(DEFAULT_ENDPOINT)).await {
        Ok(response) => match response.body() {
            Ok(body) => body.status.clone().unwrap_or_default(),
            Err(e) => e.to_status_proto(),
        },
        Err(e) => e.to_status_proto(),
    };
    Json(status_to_json(&status))
}

async fn metrics(State(state): State<HttpState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.streamer.metrics().render_prometheus(),
    )
}

async fn post_endpoint(
    State(state): State<HttpState>,
    Path(endpoint): Path<String>,
    body: Bytes,
) -> Response {
    let request = match parse_request(&body, Some(&endpoint)) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };
    let response = match state.streamer.unary(request).await {
        Ok(response) => response,
        Err(e) => return error_response(&e),
    };
    match response.body() {
        Ok(body) => Json(to_json(body)).into_response(),
        Err(e) => error_response(&e),
    }
}

fn error_response(error: &GatewayError) -> Response {
    let body = json!({
        "detail": error.client_message(),
        "header": { "status": status_to_json(&error.to_status_proto()) },
    });
    (error.http_status(), Json(body)).into_response()
}
