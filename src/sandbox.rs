//! Sandboxed process supervision.
//!
//! A [`Launcher`] turns a staged workspace into a running [`SandboxHandle`].
//! The handle owns the process through a supervisor task: stdout and stderr
//! are drained by two independent tasks, stdin is fed by a writer task, and
//! exactly one [`Termination`] is produced per process.

use crate::error::{Result, SandboxError};
use crate::registry::LanguageSpec;
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Exit code reported when the process died from a signal it was not asked to.
pub const KILLED_EXIT_CODE: i32 = -1;

/// Mount point of the workspace inside the sandbox.
pub const SANDBOX_WORKDIR: &str = "/workspace";

/// Label attached to every container this service starts.
pub const CONTAINER_LABEL: &str = "sandbox-runner";

const READ_BUF_SIZE: usize = 8192;
const EVENT_QUEUE: usize = 64;
const STDIN_QUEUE: usize = 256;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const REAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Network access granted to executed code. There is only one option.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NetworkMode {
    #[default]
    None,
}

impl NetworkMode {
    pub fn as_arg(&self) -> &'static str {
        match self {
            NetworkMode::None => "none",
        }
    }
}

/// Per-run resource caps, enforced by the sandbox runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    /// Memory ceiling in runtime notation, e.g. `256m`. Also caps swap.
    pub memory: String,
    /// CPU share, e.g. `0.5` for half a core.
    pub cpus: f64,
    pub pids_limit: u32,
    pub network: NetworkMode,
}

impl SandboxLimits {
    /// Reject values the runtime would only refuse after the process started.
    pub fn validate(&self) -> Result<()> {
        if !valid_memory(&self.memory) {
            return Err(SandboxError::Limits(format!(
                "memory {:?} must be a positive number with an optional b, k, m or g suffix",
                self.memory
            )));
        }
        if !self.cpus.is_finite() || self.cpus <= 0.0 {
            return Err(SandboxError::Limits(format!("cpus {} must be greater than zero", self.cpus)));
        }
        if self.pids_limit == 0 {
            return Err(SandboxError::Limits("pids limit must be greater than zero".into()));
        }
        Ok(())
    }
}

fn valid_memory(memory: &str) -> bool {
    let digits = memory.trim_end_matches(|c: char| matches!(c.to_ascii_lowercase(), 'b' | 'k' | 'm' | 'g'));
    let suffix = memory.len() - digits.len();
    suffix <= 1
        && !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && digits.bytes().any(|b| b != b'0')
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory: "256m".to_string(),
            cpus: 0.5,
            pids_limit: 128,
            network: NetworkMode::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

/// How a sandboxed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The program ended on its own. A program killed by a signal it was not
    /// sent by us reports [`KILLED_EXIT_CODE`].
    Exited(i32),
    /// The process was torn down by [`SandboxHandle::terminate`] or by
    /// dropping the handle.
    Killed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxEvent {
    Output(OutputChunk),
    /// Always the last event, sent after both output streams are drained.
    Terminated(Termination),
}

#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start `spec.command` with `workspace` as its working directory.
    /// Failures surface as [`SandboxError::Launch`] and leave nothing running.
    async fn launch(
        &self,
        run: Uuid,
        workspace: &Path,
        spec: &LanguageSpec,
        limits: &SandboxLimits,
    ) -> Result<SandboxHandle>;
}

/// A container that must be force-removed if its runtime client is killed.
#[derive(Debug, Clone)]
pub struct ContainerRef {
    runtime: String,
    name: String,
}

impl ContainerRef {
    pub fn new(runtime: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn remove(&self) {
        let mut cmd = Command::new(&self.runtime);
        cmd.args(["rm", "--force", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        match timeout(REAP_TIMEOUT, cmd.status()).await {
            Ok(Ok(_)) => debug!(container = %self.name, "Container removed"),
            Ok(Err(e)) => warn!(container = %self.name, error = %e, "Failed to remove container"),
            Err(_) => warn!(container = %self.name, "Timed out removing container"),
        }
    }
}

/// One running sandboxed process, exclusively owned by the session that
/// launched it. Dropping the handle kills the process.
#[derive(Debug)]
pub struct SandboxHandle {
    stdin: mpsc::Sender<Vec<u8>>,
    events: mpsc::Receiver<SandboxEvent>,
    kill: watch::Sender<Option<Duration>>,
    done: watch::Receiver<Option<Termination>>,
}

impl SandboxHandle {
    /// Spawn `command` with piped stdio and start supervising it.
    ///
    /// The process leads a new process group; everything it forks is
    /// signalled together with it.
    pub fn spawn(mut command: Command, container: Option<ContainerRef>) -> Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::Launch(format!("failed to spawn sandbox process: {e}")))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(SandboxError::Launch("sandbox process has no stdio pipes".into()));
        };
        let group = child.id();
        debug!(pid = ?group, "Sandbox process spawned");

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_QUEUE);
        let (kill_tx, kill_rx) = watch::channel(None);
        let (done_tx, done_rx) = watch::channel(None);

        let writer = tokio::spawn(feed_stdin(stdin, stdin_rx));
        let drains = [
            tokio::spawn(drain(stdout, OutputStream::Stdout, events_tx.clone())),
            tokio::spawn(drain(stderr, OutputStream::Stderr, events_tx.clone())),
        ];
        tokio::spawn(supervise(Supervised {
            child,
            group,
            container,
            kill: kill_rx,
            done: done_tx,
            events: events_tx,
            drains,
            writer,
        }));

        Ok(Self {
            stdin: stdin_tx,
            events: events_rx,
            kill: kill_tx,
            done: done_rx,
        })
    }

    /// Queue bytes for the process's stdin without waiting on the process.
    pub fn write(&self, bytes: Vec<u8>) -> Result<()> {
        if self.done.borrow().is_some() {
            return Err(SandboxError::ProcessNotRunning);
        }
        self.stdin.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SandboxError::StdinBackpressure,
            mpsc::error::TrySendError::Closed(_) => SandboxError::ProcessNotRunning,
        })
    }

    /// Next output chunk or the terminal event. `None` once the terminal
    /// event has been received.
    pub async fn next_event(&mut self) -> Option<SandboxEvent> {
        self.events.recv().await
    }

    /// The termination, if the process has already ended.
    pub fn termination(&self) -> Option<Termination> {
        *self.done.borrow()
    }

    /// Ask the process to stop, force-kill it after `grace`, and wait until it
    /// is gone. Safe to call repeatedly and concurrently; later calls reuse
    /// the first grace period.
    pub async fn terminate(&self, grace: Duration) -> Termination {
        self.kill.send_if_modified(|req| {
            if req.is_none() {
                *req = Some(grace);
                true
            } else {
                false
            }
        });
        let mut done = self.done.clone();
        let termination = match done.wait_for(Option::is_some).await {
            Ok(termination) => termination.unwrap_or(Termination::Killed),
            Err(_) => Termination::Killed,
        };
        termination
    }
}

struct Supervised {
    child: Child,
    /// Process group id, equal to the leader's pid.
    group: Option<u32>,
    container: Option<ContainerRef>,
    kill: watch::Receiver<Option<Duration>>,
    done: watch::Sender<Option<Termination>>,
    events: mpsc::Sender<SandboxEvent>,
    drains: [JoinHandle<()>; 2],
    writer: JoinHandle<()>,
}

async fn supervise(mut s: Supervised) {
    let termination = tokio::select! {
        status = s.child.wait() => exit_termination(status),
        grace = requested(&mut s.kill) => {
            shutdown(&mut s.child, s.group, s.container.as_ref(), grace).await;
            Termination::Killed
        }
    };
    // Background processes do not outlive the run. Their output already in
    // the pipes is still drained.
    kill_group(s.group);
    s.writer.abort();

    match termination {
        // Output of a cancelled run is discarded, so there is nothing to wait for.
        Termination::Killed => s.drains.iter().for_each(JoinHandle::abort),
        Termination::Exited(_) => finish_drains(s.drains).await,
    }

    info!(?termination, container = ?s.container.as_ref().map(ContainerRef::name), "Sandbox process ended");
    let _ = s.done.send(Some(termination));
    let _ = s.events.send(SandboxEvent::Terminated(termination)).await;
}

/// Resolves with the requested grace period; a dropped handle counts as a
/// request with no grace at all.
async fn requested(kill: &mut watch::Receiver<Option<Duration>>) -> Duration {
    loop {
        if let Some(grace) = *kill.borrow_and_update() {
            return grace;
        }
        if kill.changed().await.is_err() {
            return Duration::ZERO;
        }
    }
}

async fn shutdown(child: &mut Child, group: Option<u32>, container: Option<&ContainerRef>, grace: Duration) {
    let graceful = !grace.is_zero() && signal_terminate(group);
    let exited = graceful && matches!(timeout(grace, child.wait()).await, Ok(Ok(_)));
    if !exited {
        debug!(pid = ?child.id(), "Force-killing sandbox process");
        let _ = child.start_kill();
    }
    kill_group(group);
    let _ = child.wait().await;
    // Killing the runtime client does not stop the container it started.
    if let Some(container) = container {
        container.remove().await;
    }
}

#[cfg(target_os = "linux")]
fn signal_group(group: Option<u32>, signal: nix::sys::signal::Signal) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match group {
        Some(pgid) => killpg(Pid::from_raw(pgid as i32), signal).is_ok(),
        None => false,
    }
}

#[cfg(target_os = "linux")]
fn signal_terminate(group: Option<u32>) -> bool {
    signal_group(group, nix::sys::signal::Signal::SIGTERM)
}

/// SIGKILL whatever is left of the group. The group is usually empty already.
#[cfg(target_os = "linux")]
fn kill_group(group: Option<u32>) {
    signal_group(group, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(target_os = "linux"))]
fn signal_terminate(_group: Option<u32>) -> bool {
    false
}

#[cfg(not(target_os = "linux"))]
fn kill_group(_group: Option<u32>) {}

fn exit_termination(status: io::Result<ExitStatus>) -> Termination {
    match status {
        Ok(status) => Termination::Exited(status.code().unwrap_or(KILLED_EXIT_CODE)),
        Err(e) => {
            warn!(error = %e, "Failed to wait for sandbox process");
            Termination::Exited(KILLED_EXIT_CODE)
        }
    }
}

async fn finish_drains(drains: [JoinHandle<()>; 2]) {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    for task in drains {
        let abort = task.abort_handle();
        if tokio::time::timeout_at(deadline, task).await.is_err() {
            warn!("Output stream still open after exit; abandoning it");
            abort.abort();
        }
    }
}

async fn drain<R>(mut reader: R, stream: OutputStream, events: mpsc::Sender<SandboxEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = OutputChunk {
                    stream,
                    data: buf[..n].to_vec(),
                };
                if events.send(SandboxEvent::Output(chunk)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(?stream, error = %e, "Output stream read failed");
                break;
            }
        }
    }
}

async fn feed_stdin(mut stdin: ChildStdin, mut input: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = input.recv().await {
        if let Err(e) = stdin.write_all(&data).await {
            debug!(error = %e, "Failed to write to stdin");
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
}

/// Runs each program in a fresh container through a Docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct DockerLauncher {
    runtime: String,
}

impl DockerLauncher {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }

    pub fn container_name(run: Uuid) -> String {
        format!("{CONTAINER_LABEL}-{}", run.simple())
    }

    /// Arguments for `<runtime> run ...`.
    pub fn run_args(
        &self,
        name: &str,
        workspace: &Path,
        spec: &LanguageSpec,
        limits: &SandboxLimits,
    ) -> Vec<String> {
        let label = format!("{CONTAINER_LABEL}=1");
        let cpus = limits.cpus.to_string();
        let pids = limits.pids_limit.to_string();
        let mut args: Vec<String> = [
            "run",
            "--rm",
            "-i",
            "--init",
            "--pull",
            "never",
            "--name",
            name,
            "--label",
            label.as_str(),
            "--network",
            limits.network.as_arg(),
            "--memory",
            limits.memory.as_str(),
            "--memory-swap",
            limits.memory.as_str(),
            "--cpus",
            cpus.as_str(),
            "--pids-limit",
            pids.as_str(),
            // The workspace is world-writable, so no capability is needed to
            // build next to the source.
            "--cap-drop",
            "ALL",
            "--security-opt",
            "no-new-privileges",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.push("-v".into());
        args.push(format!("{}:{SANDBOX_WORKDIR}", workspace.display()));
        args.push("-w".into());
        args.push(SANDBOX_WORKDIR.into());
        args.push(spec.image.clone());
        args.push("bash".into());
        args.push("-c".into());
        args.push(spec.command.clone());
        args
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        let status = Command::new(&self.runtime)
            .args(["image", "inspect", "--format", "{{.Id}}", image])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| SandboxError::Launch(format!("container runtime {} unavailable: {e}", self.runtime)))?;
        if !status.success() {
            return Err(SandboxError::Launch(format!("image {image} is not available")));
        }
        Ok(())
    }

    /// Remove containers left behind by a previous process. Returns how many
    /// were removed.
    pub async fn reap_orphans(&self) -> usize {
        let listed = Command::new(&self.runtime)
            .args(["ps", "-aq", "--filter", &format!("label={CONTAINER_LABEL}")])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await;
        let ids: Vec<String> = match listed {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                .lines()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_owned)
                .collect(),
            Ok(_) | Err(_) => {
                warn!(runtime = %self.runtime, "Could not list stale containers");
                return 0;
            }
        };
        for id in &ids {
            ContainerRef::new(&self.runtime, id.as_str()).remove().await;
        }
        if !ids.is_empty() {
            info!(removed = ids.len(), "Reaped stale containers");
        }
        ids.len()
    }
}

#[async_trait]
impl Launcher for DockerLauncher {
    async fn launch(
        &self,
        run: Uuid,
        workspace: &Path,
        spec: &LanguageSpec,
        limits: &SandboxLimits,
    ) -> Result<SandboxHandle> {
        self.ensure_image(&spec.image).await?;

        let name = Self::container_name(run);
        let mut cmd = Command::new(&self.runtime);
        cmd.args(self.run_args(&name, workspace, spec, limits));
        info!(container = %name, image = %spec.image, "Launching sandbox");
        SandboxHandle::spawn(cmd, Some(ContainerRef::new(&self.runtime, name)))
    }
}
