#![allow(dead_code)]

use async_trait::async_trait;
use sandbox_runner::registry::{LanguageSpec, Registry};
use sandbox_runner::sandbox::{Launcher, SandboxHandle, SandboxLimits};
use sandbox_runner::state::Engine;
use sandbox_runner::workspace::WorkspaceManager;
use sandbox_runner::{Result, SandboxError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use uuid::Uuid;

pub const MISSING_IMAGE: &str = "missing-image";

/// Runs the language command with `sh` directly in the workspace. Stands in
/// for the container runtime so tests only need a POSIX shell.
pub struct ShellLauncher;

#[async_trait]
impl Launcher for ShellLauncher {
    async fn launch(
        &self,
        _run: Uuid,
        workspace: &Path,
        spec: &LanguageSpec,
        _limits: &SandboxLimits,
    ) -> Result<SandboxHandle> {
        if spec.image == MISSING_IMAGE {
            return Err(SandboxError::Launch(format!("image {MISSING_IMAGE} is not available")));
        }
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&spec.command).current_dir(workspace);
        SandboxHandle::spawn(cmd, None)
    }
}

pub fn registry() -> Registry {
    Registry::from_entries([
        ("sh", LanguageSpec::new("main.sh", "shell", "sh main.sh")),
        ("broken", LanguageSpec::new("main.sh", MISSING_IMAGE, "sh main.sh")),
        // The file cannot be written, so staging fails
        ("nested", LanguageSpec::new("no/such/dir/main.sh", "shell", "sh main.sh")),
    ])
}

pub fn engine(root: &Path) -> Engine {
    Engine {
        registry: registry(),
        workspaces: WorkspaceManager::new(root).expect("workspace root"),
        launcher: Arc::new(ShellLauncher),
        limits: SandboxLimits::default(),
        grace: Duration::from_millis(500),
        supersede_grace: Duration::from_millis(100),
    }
}

pub fn workspace_count(root: &Path) -> usize {
    std::fs::read_dir(root).map(|dir| dir.count()).unwrap_or(0)
}

/// Poll until the workspace root is empty or the timeout expires.
pub async fn wait_for_no_workspaces(root: &Path, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while workspace_count(root) > 0 {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    true
}

/// True while `pid` exists and is not a zombie.
pub fn process_alive(pid: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid.trim())) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map_or(false, |rest| rest.trim_start().chars().next() != Some('Z')),
        Err(_) => false,
    }
}

/// Poll until `pid` is gone or the timeout expires.
pub async fn wait_for_exit(pid: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while process_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    true
}
