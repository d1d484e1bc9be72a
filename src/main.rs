//! sandbox-runner - per-session sandboxed code execution over WebSocket.
//!
//! Usage:
//!   sandbox-runner serve [--port 5001]                 # Start WebSocket server
//!   sandbox-runner run --lang python --file main.py    # Run one file in this terminal

use clap::Parser;
use sandbox_runner::config::{Cli, Commands, EngineConfig};
use sandbox_runner::http_server;
use sandbox_runner::protocol::{ClientMessage, ServerMessage};
use sandbox_runner::sandbox::DockerLauncher;
use sandbox_runner::session::SessionController;
use sandbox_runner::state::{AppState, Engine};
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::process::exit;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Serve {
            host,
            port,
            max_sessions,
            engine,
        } => serve(host, port, max_sessions, engine.into()).await,
        Commands::Run { lang, file, engine } => run_once(&lang, &file, engine.into()).await,
    };
    exit(code);
}

async fn serve(host: IpAddr, port: u16, max_sessions: usize, config: EngineConfig) -> i32 {
    let engine = match Engine::from_config(&config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    // Leftovers from a previous process that did not shut down cleanly
    engine.workspaces.sweep();
    DockerLauncher::new(&config.runtime).reap_orphans().await;

    let addr = SocketAddr::new(host, port);
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Error: cannot bind {}: {}", addr, e);
            return 1;
        }
    };
    info!(
        languages = ?engine.registry.languages(),
        workspace_root = %engine.workspaces.root().display(),
        "WebSocket running on ws://{}",
        addr
    );

    let state = AppState::new(engine, max_sessions);
    match http_server::serve(listener, state, shutdown_signal()).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

/// Drive a single session from the terminal: stdin is forwarded to the
/// program and its output is printed as it arrives.
async fn run_once(lang: &str, file: &Path, config: EngineConfig) -> i32 {
    let code = match tokio::fs::read_to_string(file).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: cannot read {}: {}", file.display(), e);
            return 1;
        }
    };
    let engine = match Engine::from_config(&config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    let (out_tx, mut out_rx) = mpsc::channel(256);
    let (in_tx, in_rx) = mpsc::channel(64);
    let controller = tokio::spawn(SessionController::new(engine, out_tx).drive(in_rx));

    let run = ClientMessage::Run {
        lang: lang.to_owned(),
        code,
    };
    if in_tx.send(run).await.is_err() {
        eprintln!("Error: session ended unexpectedly");
        return 1;
    }

    let input = in_tx.clone();
    let stdin_task = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 4096];
        while let Ok(n) = stdin.read(&mut buf).await {
            if n == 0 {
                break;
            }
            let data = String::from_utf8_lossy(&buf[..n]).into_owned();
            if input.send(ClientMessage::Stdin { data }).await.is_err() {
                break;
            }
        }
    });

    let mut exit_code = 1;
    while let Some(msg) = out_rx.recv().await {
        match msg {
            ServerMessage::Stdout { data } => {
                print!("{}", data);
                let _ = std::io::stdout().flush();
            }
            ServerMessage::Stderr { data } => eprint!("{}", data),
            ServerMessage::Exit { code } => {
                exit_code = code;
                break;
            }
            ServerMessage::Error { data } => {
                eprintln!("Error: {}", data);
                break;
            }
        }
    }

    stdin_task.abort();
    drop(in_tx);
    let _ = controller.await;
    exit_code
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
