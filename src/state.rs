//! Shared application state.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::registry::Registry;
use crate::sandbox::{DockerLauncher, Launcher, SandboxLimits};
use crate::workspace::WorkspaceManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

/// Everything a session needs to stage and launch runs. Read-only once built.
pub struct Engine {
    pub registry: Registry,
    pub workspaces: WorkspaceManager,
    pub launcher: Arc<dyn Launcher>,
    pub limits: SandboxLimits,
    /// Grace period when a session closes.
    pub grace: Duration,
    /// Grace period when a new run replaces an active one.
    pub supersede_grace: Duration,
}

impl Engine {
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.limits.validate()?;
        let registry = match &config.languages {
            Some(path) => Registry::with_overrides(path)?,
            None => Registry::builtin(),
        };
        Ok(Self {
            registry,
            workspaces: WorkspaceManager::new(&config.workspace_root)?,
            launcher: Arc::new(DockerLauncher::new(&config.runtime)),
            limits: config.limits.clone(),
            grace: config.grace,
            supersede_grace: config.supersede_grace,
        })
    }
}

/// State shared by every connection.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    slots: Arc<Semaphore>,
    max_sessions: usize,
    stop: Arc<watch::Sender<bool>>,
    stopping: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(engine: Engine, max_sessions: usize) -> Self {
        let max_sessions = max_sessions.max(1);
        let (stop, stopping) = watch::channel(false);
        Self {
            engine: Arc::new(engine),
            slots: Arc::new(Semaphore::new(max_sessions)),
            max_sessions,
            stop: Arc::new(stop),
            stopping,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.max_sessions - self.slots.available_permits()
    }

    /// A session slot, or `None` when at capacity or shutting down.
    pub(crate) fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        if *self.stopping.borrow() {
            return None;
        }
        self.slots.clone().try_acquire_owned().ok()
    }

    pub(crate) fn stopping(&self) -> watch::Receiver<bool> {
        self.stopping.clone()
    }

    /// Tell every live session to tear down.
    pub fn begin_shutdown(&self) {
        self.stop.send_replace(true);
    }

    /// Wait until every session has released its slot. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active_sessions() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}
