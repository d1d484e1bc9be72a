//! End-to-end tests through the WebSocket gateway.

mod common;

use futures_util::{SinkExt, StreamExt};
use sandbox_runner::http_server;
use sandbox_runner::protocol::ServerMessage;
use sandbox_runner::state::AppState;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(10);

struct Server {
    addr: SocketAddr,
    root: TempDir,
    state: AppState,
}

async fn start(max_sessions: usize) -> Server {
    let root = TempDir::new().unwrap();
    let state = AppState::new(common::engine(root.path()), max_sessions);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(http_server::serve(listener, state.clone(), std::future::pending()));
    Server { addr, root, state }
}

async fn connect(server: &Server, path: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{}{}", server.addr, path)).await.unwrap();
    ws
}

async fn send(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn recv(ws: &mut Client) -> ServerMessage {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn until_exit(ws: &mut Client) -> (String, i32) {
    let mut stdout = String::new();
    loop {
        match recv(ws).await {
            ServerMessage::Stdout { data } => stdout.push_str(&data),
            ServerMessage::Stderr { .. } => {}
            ServerMessage::Exit { code } => return (stdout, code),
            ServerMessage::Error { data } => panic!("unexpected error event: {data}"),
        }
    }
}

#[tokio::test]
async fn run_over_websocket() {
    let server = start(4).await;
    let mut ws = connect(&server, "/").await;

    send(&mut ws, json!({ "type": "run", "lang": "sh", "code": "echo $((1 + 1))" })).await;
    assert_eq!(until_exit(&mut ws).await, ("2\n".to_owned(), 0));
}

#[tokio::test]
async fn ws_path_is_an_alias() {
    let server = start(4).await;
    let mut ws = connect(&server, "/ws").await;

    send(&mut ws, json!({ "type": "run", "lang": "sh", "code": "read x; echo \"$x\"" })).await;
    send(&mut ws, json!({ "type": "stdin", "data": "hello\n" })).await;
    assert_eq!(until_exit(&mut ws).await, ("hello\n".to_owned(), 0));
}

#[tokio::test]
async fn invalid_messages_get_an_error_and_keep_the_session() {
    let server = start(4).await;
    let mut ws = connect(&server, "/").await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    match recv(&mut ws).await {
        ServerMessage::Error { data } => assert!(data.starts_with("invalid message"), "{data}"),
        other => panic!("expected error, got {other:?}"),
    }

    send(&mut ws, json!({ "type": "launch", "lang": "sh" })).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Error { .. }));

    send(&mut ws, json!({ "type": "run", "lang": "sh", "code": "exit 4" })).await;
    assert_eq!(until_exit(&mut ws).await, (String::new(), 4));
}

#[tokio::test]
async fn unsupported_language_over_websocket() {
    let server = start(4).await;
    let mut ws = connect(&server, "/").await;

    send(&mut ws, json!({ "type": "run", "lang": "cobol", "code": "" })).await;
    match recv(&mut ws).await {
        ServerMessage::Error { data } => assert!(data.contains("cobol"), "{data}"),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(common::workspace_count(server.root.path()), 0);
}

#[tokio::test]
async fn status_and_health() {
    let server = start(4).await;
    let base = format!("http://{}", server.addr);

    let status: Value = reqwest::get(format!("{base}/"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "running");
    assert_eq!(status["activeSessions"], 0);
    let languages = status["supportedLanguages"].as_array().unwrap();
    assert!(languages.iter().any(|l| l == "sh"));

    let health = reqwest::get(format!("{base}/health")).await.unwrap();
    assert!(health.status().is_success());
    assert_eq!(health.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn connections_beyond_capacity_are_rejected() {
    let server = start(1).await;
    let _first = connect(&server, "/").await;
    assert_eq!(server.state.active_sessions(), 1);

    match connect_async(format!("ws://{}/", server.addr)).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 503),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("second connection was admitted"),
    }
}

#[tokio::test]
async fn disconnect_kills_the_run_and_frees_the_slot() {
    let server = start(1).await;
    let mut ws = connect(&server, "/").await;

    send(&mut ws, json!({ "type": "run", "lang": "sh", "code": "echo up; exec sleep 30" })).await;
    assert_eq!(recv(&mut ws).await, ServerMessage::Stdout { data: "up\n".into() });
    assert_eq!(common::workspace_count(server.root.path()), 1);

    ws.close(None).await.unwrap();
    drop(ws);

    assert!(common::wait_for_no_workspaces(server.root.path(), WAIT).await);
    assert!(server.state.wait_idle(WAIT).await);

    // The slot is reusable
    let mut ws = connect(&server, "/").await;
    send(&mut ws, json!({ "type": "run", "lang": "sh", "code": "echo again" })).await;
    assert_eq!(until_exit(&mut ws).await, ("again\n".to_owned(), 0));
}
