//! WebSocket query surface.
//!
//! A separate listener (default port 6033) upgrades `/` to a WebSocket and
//! answers JSON frames `{type, query}`. Only `type == "query"` is honored;
//! binary frames are ignored. Connections close on client disconnect or
//! process shutdown; live handlers are tracked so shutdown can wait for them
//! to drain within a bounded grace period.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::Database;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct SocketState {
    db: Arc<Database>,
    api_key: Option<String>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// A client request frame.
#[derive(Debug, Deserialize)]
struct WsEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    #[serde(default)]
    query: String,
}

/// A server response frame.
#[derive(Debug, Serialize)]
struct WsResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    results: Option<Vec<Map<String, Value>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl WsResponse {
    fn success(results: Vec<Map<String, Value>>) -> Self {
        WsResponse {
            status: "success",
            results: Some(results),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        WsResponse {
            status: "error",
            results: None,
            error: Some(message.into()),
        }
    }
}

/// Serve the WebSocket listener until the token is cancelled, then wait up
/// to five seconds for live connection handlers to drain.
pub async fn run_socket_server(
    db: Arc<Database>,
    config: Arc<Config>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let state = SocketState {
        db,
        api_key: config.api_key.clone(),
        tracker: TaskTracker::new(),
        cancel: cancel.clone(),
    };
    let tracker = state.tracker.clone();

    let app = Router::new()
        .route("/", get(handle_upgrade))
        .layer(middleware::from_fn_with_state(state.clone(), api_key_middleware))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "starting WebSocket server");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    tracker.close();
    if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait())
        .await
        .is_err()
    {
        warn!("WebSocket handlers did not drain within the grace period");
    }
    info!(addr = %addr, "WebSocket server stopped");
    Ok(())
}

async fn api_key_middleware(
    State(state): State<SocketState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(req).await;
    };
    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided != expected {
        info!("unauthorized WebSocket access attempt");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "Unauthorized",
                "message": "Invalid or missing API Key",
            })),
        )
            .into_response();
    }
    next.run(req).await
}

async fn handle_upgrade(State(state): State<SocketState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| {
        let tracker = state.tracker.clone();
        tracker.track_future(handle_socket(socket, state))
    })
}

async fn handle_socket(mut socket: WebSocket, state: SocketState) {
    info!("WebSocket connection established");
    let mut request_count = 0u64;

    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            incoming = socket.recv() => {
                let message = match incoming {
                    None => {
                        info!(request_count, "WebSocket connection closed by client");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "error reading WebSocket message");
                        break;
                    }
                    Some(Ok(message)) => message,
                };

                let text = match message {
                    Message::Text(text) => text,
                    // Binary frames are not part of the protocol.
                    Message::Binary(_) => continue,
                    Message::Close(_) => {
                        info!(request_count, "WebSocket connection closed by client");
                        break;
                    }
                    _ => continue,
                };

                let event: WsEvent = match serde_json::from_str(text.as_str()) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "error decoding WebSocket message");
                        break;
                    }
                };

                request_count += 1;
                info!(
                    request_number = request_count,
                    event_type = %event.event_type,
                    query = %event.query,
                    "WebSocket request received"
                );

                let response = process_request(&state.db, event).await;
                let payload = match serde_json::to_string(&response) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "error encoding WebSocket response");
                        break;
                    }
                };
                if let Err(e) = socket.send(Message::Text(payload.into())).await {
                    warn!(error = %e, "error writing WebSocket response");
                    break;
                }
            }
        }
    }
}

async fn process_request(db: &Database, event: WsEvent) -> WsResponse {
    match event.event_type.as_str() {
        "query" => {
            if event.query.is_empty() {
                info!("empty query rejected");
                return WsResponse::error("query cannot be empty");
            }
            match db.execute_query(&event.query).await {
                Ok(result) => {
                    info!(
                        duration_ms = result.duration.as_millis() as u64,
                        result_count = result.results.len(),
                        "query processed successfully"
                    );
                    WsResponse::success(result.results)
                }
                Err(e) => {
                    warn!(error = %e, "error executing query");
                    WsResponse::error(e.to_string())
                }
            }
        }
        other => {
            info!(event_type = other, "unknown request type");
            WsResponse::error(format!("unknown request type: {other}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_frame_shape() {
        let resp = WsResponse::success(vec![Map::new()]);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "success");
        assert!(json["results"].is_array());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn error_frame_shape() {
        let resp = WsResponse::error("query cannot be empty");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "query cannot be empty");
        assert!(json.get("results").is_none());
    }

    #[test]
    fn event_decoding_defaults() {
        let event: WsEvent = serde_json::from_str(r#"{"type":"query","query":"SELECT 1"}"#).unwrap();
        assert_eq!(event.event_type, "query");
        assert_eq!(event.query, "SELECT 1");

        let event: WsEvent = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(event.event_type, "");
    }
}
