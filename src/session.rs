//! Per-connection session controller.
//!
//! A session runs at most one sandbox at a time. All state transitions
//! happen on the task that drives the session, so the phase itself is the
//! serialization point between staging, launching, streaming and teardown.

use crate::error::SandboxError;
use crate::protocol::{ClientMessage, ServerMessage, TextDecoder};
use crate::sandbox::{OutputStream, SandboxEvent, SandboxHandle, Termination, KILLED_EXIT_CODE};
use crate::state::Engine;
use crate::workspace::Workspace;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Staging,
    Running,
    Draining,
}

struct ActiveRun {
    id: Uuid,
    lang: String,
    workspace: Workspace,
    sandbox: SandboxHandle,
    stdout: TextDecoder,
    stderr: TextDecoder,
}

pub struct SessionController {
    id: Uuid,
    engine: Arc<Engine>,
    outbound: mpsc::Sender<ServerMessage>,
    phase: SessionPhase,
    run: Option<ActiveRun>,
}

impl SessionController {
    pub fn new(engine: Arc<Engine>, outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            engine,
            outbound,
            phase: SessionPhase::Idle,
            run: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Identifier of the in-flight run, if any.
    pub fn active_run(&self) -> Option<Uuid> {
        self.run.as_ref().map(|run| run.id)
    }

    /// Process client messages and sandbox events until `inbound` closes,
    /// then tear the session down.
    pub async fn drive(mut self, mut inbound: mpsc::Receiver<ClientMessage>) {
        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                event = self.next_event() => self.on_event(event).await,
            }
        }
        self.teardown().await;
    }

    pub async fn handle(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Run { lang, code } => self.start_run(lang, code).await,
            ClientMessage::Stdin { data } => self.forward_stdin(data).await,
        }
    }

    /// Waits for the active sandbox's next event; never resolves while idle.
    pub async fn next_event(&mut self) -> SandboxEvent {
        let Some(run) = self.run.as_mut() else {
            return std::future::pending().await;
        };
        match run.sandbox.next_event().await {
            Some(event) => event,
            // The supervisor always ends with a terminal event; if it is gone
            // the process is gone too.
            None => SandboxEvent::Terminated(run.sandbox.termination().unwrap_or(Termination::Killed)),
        }
    }

    pub async fn on_event(&mut self, event: SandboxEvent) {
        match event {
            SandboxEvent::Output(chunk) => {
                let Some(run) = self.run.as_mut() else {
                    return;
                };
                let msg = match chunk.stream {
                    OutputStream::Stdout => ServerMessage::Stdout {
                        data: run.stdout.decode(&chunk.data),
                    },
                    OutputStream::Stderr => ServerMessage::Stderr {
                        data: run.stderr.decode(&chunk.data),
                    },
                };
                self.emit_output(msg).await;
            }
            SandboxEvent::Terminated(termination) => self.finish_run(termination).await,
        }
    }

    /// Kill any active run and remove its workspace.
    pub async fn teardown(&mut self) {
        self.cancel_run(self.engine.grace, "session closed").await;
        info!(session = %self.id, "Session torn down");
    }

    async fn start_run(&mut self, lang: String, code: String) {
        if self.run.is_some() {
            self.cancel_run(self.engine.supersede_grace, "superseded").await;
        }

        let spec = match self.engine.registry.resolve(&lang) {
            Ok(spec) => spec.clone(),
            Err(e) => {
                warn!(session = %self.id, %lang, "Rejected run request");
                self.emit(ServerMessage::error(e.to_string())).await;
                return;
            }
        };

        let run_id = Uuid::new_v4();
        self.phase = SessionPhase::Staging;
        let workspace = match self.engine.workspaces.stage(run_id, &spec.file, &code).await {
            Ok(workspace) => workspace,
            Err(e) => {
                warn!(session = %self.id, run = %run_id, error = %e, "Staging failed");
                self.phase = SessionPhase::Idle;
                self.emit(ServerMessage::error(e.to_string())).await;
                return;
            }
        };

        self.phase = SessionPhase::Running;
        let launched = self
            .engine
            .launcher
            .launch(run_id, workspace.path(), &spec, &self.engine.limits)
            .await;
        let sandbox = match launched {
            Ok(sandbox) => sandbox,
            Err(e) => {
                warn!(session = %self.id, run = %run_id, error = %e, "Launch failed");
                release(workspace).await;
                self.phase = SessionPhase::Idle;
                self.emit(ServerMessage::error(e.to_string())).await;
                return;
            }
        };

        info!(session = %self.id, run = %run_id, %lang, bytes = code.len(), "Run started");
        self.run = Some(ActiveRun {
            id: run_id,
            lang,
            workspace,
            sandbox,
            stdout: TextDecoder::default(),
            stderr: TextDecoder::default(),
        });
    }

    async fn forward_stdin(&mut self, data: String) {
        let run = match (self.phase, self.run.as_ref()) {
            (SessionPhase::Running, Some(run)) => run,
            _ => {
                debug!(session = %self.id, phase = ?self.phase, "Discarding stdin, no running process");
                return;
            }
        };
        match run.sandbox.write(data.into_bytes()) {
            Ok(()) => {}
            Err(SandboxError::ProcessNotRunning) => {
                debug!(session = %self.id, run = %run.id, "Discarding stdin, process already exited");
            }
            Err(e) => {
                warn!(session = %self.id, run = %run.id, error = %e, "Stdin dropped");
                self.emit(ServerMessage::error(e.to_string())).await;
            }
        }
    }

    async fn finish_run(&mut self, termination: Termination) {
        let Some(mut run) = self.run.take() else {
            return;
        };
        self.phase = SessionPhase::Draining;

        let tail = run.stdout.finish();
        self.emit_output(ServerMessage::Stdout { data: tail }).await;
        let tail = run.stderr.finish();
        self.emit_output(ServerMessage::Stderr { data: tail }).await;

        let code = match termination {
            Termination::Exited(code) => code,
            Termination::Killed => KILLED_EXIT_CODE,
        };
        info!(session = %self.id, run = %run.id, lang = %run.lang, code, "Run finished");
        self.emit(ServerMessage::Exit { code }).await;

        drop(run.sandbox);
        release(run.workspace).await;
        self.phase = SessionPhase::Idle;
    }

    /// Forced teardown of the active run. Nothing is reported to the client.
    async fn cancel_run(&mut self, grace: Duration, reason: &'static str) {
        let Some(run) = self.run.take() else {
            self.phase = SessionPhase::Idle;
            return;
        };
        let termination = run.sandbox.terminate(grace).await;
        info!(session = %self.id, run = %run.id, ?termination, reason, "Run cancelled");
        drop(run.sandbox);
        release(run.workspace).await;
        self.phase = SessionPhase::Idle;
    }

    async fn emit_output(&self, msg: ServerMessage) {
        let empty = match &msg {
            ServerMessage::Stdout { data } | ServerMessage::Stderr { data } => data.is_empty(),
            _ => false,
        };
        if !empty {
            self.emit(msg).await;
        }
    }

    async fn emit(&self, msg: ServerMessage) {
        if self.outbound.send(msg).await.is_err() {
            debug!(session = %self.id, "Client gone, dropping message");
        }
    }
}

async fn release(workspace: Workspace) {
    let path = workspace.path().to_path_buf();
    if let Err(e) = workspace.destroy().await {
        warn!(workspace = %path.display(), error = %e, "Failed to destroy workspace");
    }
}
