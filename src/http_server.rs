//! HTTP and WebSocket gateway using Axum.

use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::SessionController;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const INBOUND_QUEUE: usize = 64;
const OUTBOUND_QUEUE: usize = 256;
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: &'static str,
    message: &'static str,
    websocket: String,
    supported_languages: Vec<String>,
    active_sessions: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/ws", get(ws_only))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `signal` resolves, then tear down every live session.
pub async fn serve<F>(listener: TcpListener, state: AppState, signal: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Starting WebSocket server on {}", listener.local_addr()?);
    let app = router(state.clone());
    let stopping = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            info!("Shutting down, closing sessions");
            stopping.begin_shutdown();
        })
        .await?;

    if !state.wait_idle(SHUTDOWN_TIMEOUT).await {
        warn!(active = state.active_sessions(), "Sessions still open at shutdown");
    }
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn root(
    ws: Option<WebSocketUpgrade>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    match ws {
        Some(ws) => upgrade(ws, state, &headers),
        None => Json(status(&state, &headers)).into_response(),
    }
}

async fn ws_only(ws: WebSocketUpgrade, State(state): State<AppState>, headers: HeaderMap) -> Response {
    upgrade(ws, state, &headers)
}

fn status(state: &AppState, headers: &HeaderMap) -> StatusResponse {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    StatusResponse {
        status: "running",
        message: "Multi-language code runner backend running",
        websocket: format!("ws://{host}"),
        supported_languages: state
            .engine
            .registry
            .languages()
            .into_iter()
            .map(str::to_owned)
            .collect(),
        active_sessions: state.active_sessions(),
    }
}

fn upgrade(ws: WebSocketUpgrade, state: AppState, headers: &HeaderMap) -> Response {
    let Some(permit) = state.try_admit() else {
        warn!(active = state.active_sessions(), "Rejecting connection, at capacity");
        return (StatusCode::SERVICE_UNAVAILABLE, "Server is at capacity").into_response();
    };
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown origin")
        .to_owned();
    ws.on_upgrade(move |socket| handle_socket(socket, state, permit, origin))
}

async fn handle_socket(socket: WebSocket, state: AppState, permit: OwnedSemaphorePermit, origin: String) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);
    let (in_tx, in_rx) = mpsc::channel::<ClientMessage>(INBOUND_QUEUE);

    let session = SessionController::new(state.engine.clone(), out_tx.clone());
    let session_id = session.id();
    info!(session = %session_id, %origin, "Client connected");
    let controller = tokio::spawn(session.drive(in_rx));

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match msg.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut stopping = state.stopping();
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = stopping.wait_for(|stop| *stop) => break,
        };
        let raw = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    let _ = out_tx.send(ServerMessage::error("invalid message: not UTF-8")).await;
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(session = %session_id, error = %e, "WebSocket transport error");
                break;
            }
        };
        match ClientMessage::decode(&raw) {
            Ok(msg) => {
                if in_tx.send(msg).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = out_tx.send(ServerMessage::error(format!("invalid message: {e}"))).await;
            }
        }
    }

    // Teardown must finish before the slot and the socket are released.
    drop(in_tx);
    if let Err(e) = controller.await {
        warn!(session = %session_id, error = %e, "Session task failed");
    }
    drop(out_tx);
    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
        abort.abort();
    }
    drop(permit);
    info!(session = %session_id, "Client disconnected");
}
