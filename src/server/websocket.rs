//! `/{endpoint}` over WebSocket. One message is one request; responses go
//! out in completion order.
//!
//! With the `json` subprotocol (the default) messages carry the JSON form.
//! With `bytes`, binary messages carry envelopes around an encoded
//! `DataRequestProto`; responses use the algorithm of the client's latest
//! envelope.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::request::envelope::{self, Algorithm};
use crate::request::json::{is_end_of_stream, parse_request, to_json};
use crate::request::DataRequest;
use crate::server::close_reason;
use crate::streamer::Streamer;

/// Single-byte binary message ending a stream.
pub const END_OF_STREAM: u8 = 0x01;

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_INTERNAL: u16 = 1011;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subprotocol {
    Json,
    Bytes,
}

impl Subprotocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Subprotocol::Json => "json",
            Subprotocol::Bytes => "bytes",
        }
    }

    /// The first subprotocol the client offers that we speak, else `json`.
    pub fn negotiate(headers: &HeaderMap) -> Self {
        headers
            .get_all("sec-websocket-protocol")
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .find_map(|offer| match offer.trim() {
                "json" => Some(Subprotocol::Json),
                "bytes" => Some(Subprotocol::Bytes),
                _ => None,
            })
            .unwrap_or(Subprotocol::Json)
    }
}

#[derive(Clone)]
struct WsState {
    streamer: Streamer,
    shutdown: CancellationToken,
}

pub fn router(streamer: Streamer, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/", get(upgrade_default))
        .route("/*endpoint", get(upgrade))
        .with_state(WsState { streamer, shutdown })
}

pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> Result<()> {
    if let Ok(address) = listener.local_addr() {
        info!(%address, "WebSocket gateway listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn upgrade_default(
    state: State<WsState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, Path(String::new()), headers, ws).await
}

async fn upgrade(
    State(state): State<WsState>,
    Path(endpoint): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let protocol = Subprotocol::negotiate(&headers);
    ws.protocols([protocol.as_str()])
        .on_upgrade(move |socket| run(state, socket, endpoint, protocol))
}

/// What one inbound message means for the stream.
enum Inbound {
    Request(DataRequest),
    End,
    Skip,
}

fn decode_message(
    message: Message,
    protocol: Subprotocol,
    endpoint: &str,
    algorithm: &AtomicU8,
) -> Inbound {
    let path = (!endpoint.is_empty()).then_some(endpoint);
    let parsed = match message {
        Message::Text(text) => {
            if is_end_of_stream(text.as_bytes()) {
                return Inbound::End;
            }
            parse_request(text.as_bytes(), path)
        }
        Message::Binary(raw) => {
            if raw == [END_OF_STREAM] {
                return Inbound::End;
            }
            match protocol {
                Subprotocol::Json => {
                    if is_end_of_stream(&raw) {
                        return Inbound::End;
                    }
                    parse_request(&raw, path)
                }
                Subprotocol::Bytes => envelope::decode(&raw).map(|(body, used)| {
                    algorithm.store(used as u8, Ordering::Relaxed);
                    DataRequest::from_bytes(body)
                }),
            }
        }
        Message::Close(_) => return Inbound::End,
        Message::Ping(_) | Message::Pong(_) => return Inbound::Skip,
    };
    match parsed {
        Ok(request) => Inbound::Request(request),
        // malformed messages are answered with an error, the stream goes on
        Err(e) => {
            debug!("rejecting message: {e}");
            Inbound::Request(DataRequest::failed("", endpoint, e.to_status_proto()))
        }
    }
}

fn encode_response(response: &DataRequest, protocol: Subprotocol, algorithm: &AtomicU8) -> Result<Message> {
    match protocol {
        Subprotocol::Json => {
            let json = to_json(response.body()?);
            let text = serde_json::to_string(&json)
                .map_err(|e| GatewayError::Internal(format!("response does not serialize: {e}")))?;
            Ok(Message::Text(text))
        }
        Subprotocol::Bytes => {
            let algorithm = Algorithm::try_from(algorithm.load(Ordering::Relaxed))?;
            Ok(Message::Binary(envelope::encode(&response.to_bytes(), algorithm)?))
        }
    }
}

async fn run(state: WsState, socket: WebSocket, endpoint: String, protocol: Subprotocol) {
    let (mut sink, source) = socket.split();
    let algorithm = Arc::new(AtomicU8::new(Algorithm::None as u8));

    let inbound_algorithm = algorithm.clone();
    let ingress = source
        .map(move |message| match message {
            Ok(message) => Ok(decode_message(message, protocol, &endpoint, &inbound_algorithm)),
            Err(e) => Err(GatewayError::Cancelled(format!("websocket failed: {e}"))),
        })
        .take_while(|item| future::ready(!matches!(item, Ok(Inbound::End))))
        .filter_map(|item| {
            future::ready(match item {
                Ok(Inbound::Request(request)) => Some(Ok(request)),
                Ok(Inbound::End | Inbound::Skip) => None,
                Err(e) => Some(Err(e)),
            })
        });

    let mut responses = match state.streamer.open(ingress) {
        Ok(responses) => responses,
        Err(e) => {
            warn!("refusing websocket stream: {e}");
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_INTERNAL,
                    reason: close_reason(&e.client_message()).into(),
                })))
                .await;
            return;
        }
    };

    while let Some(response) = responses.next().await {
        let message = match encode_response(&response, protocol, &algorithm) {
            Ok(message) => message,
            Err(e) => {
                warn!("closing websocket: {e}");
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_INTERNAL,
                        reason: close_reason(&e.client_message()).into(),
                    })))
                    .await;
                return;
            }
        };
        if sink.send(message).await.is_err() {
            debug!("client went away");
            return;
        }
    }

    let (code, reason) = if state.shutdown.is_cancelled() {
        (CLOSE_GOING_AWAY, "gateway shutting down")
    } else {
        (CLOSE_NORMAL, "end of stream")
    };
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Frames `request` for the `bytes` subprotocol.
pub fn encode_frame(request: &DataRequest, algorithm: Algorithm) -> Result<Bytes> {
    envelope::encode(&request.to_bytes(), algorithm).map(Bytes::from)
}
