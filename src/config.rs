//! Command-line and environment configuration.

use crate::sandbox::{NetworkMode, SandboxLimits};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "sandbox-runner")]
#[command(about = "Run untrusted code in per-session sandboxes over WebSocket")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the WebSocket server
    Serve {
        /// Address to bind
        #[arg(long, env = "HOST", default_value = "0.0.0.0")]
        host: IpAddr,

        /// Port to listen on
        #[arg(long, env = "PORT", default_value = "5001")]
        port: u16,

        /// Maximum concurrent sessions; extra connections are rejected
        #[arg(long, env = "MAX_SESSIONS", default_value = "64")]
        max_sessions: usize,

        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Run one source file in a sandbox attached to this terminal
    Run {
        /// Language tag, e.g. python
        #[arg(long)]
        lang: String,

        /// Source file to run
        #[arg(long)]
        file: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct EngineArgs {
    /// Directory holding per-run workspaces
    #[arg(long, env = "WORKSPACE_ROOT", default_value = "/tmp/sandbox-runner")]
    pub workspace_root: PathBuf,

    /// Docker-compatible container CLI
    #[arg(long, env = "CONTAINER_RUNTIME", default_value = "docker")]
    pub runtime: String,

    /// Memory ceiling per run
    #[arg(long, default_value = "256m")]
    pub memory: String,

    /// CPU share per run
    #[arg(long, default_value = "0.5")]
    pub cpus: f64,

    /// Maximum number of processes per run
    #[arg(long, default_value = "128")]
    pub pids_limit: u32,

    /// Grace period before force-killing a run when its session closes, in milliseconds
    #[arg(long, default_value = "2000")]
    pub grace_ms: u64,

    /// Grace period when a new run replaces an active one, in milliseconds
    #[arg(long, default_value = "250")]
    pub supersede_grace_ms: u64,

    /// JSON file adding or replacing language entries
    #[arg(long, env = "LANGUAGES_FILE")]
    pub languages: Option<PathBuf>,
}

/// Engine settings shared by `serve` and `run`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workspace_root: PathBuf,
    pub runtime: String,
    pub limits: SandboxLimits,
    pub grace: Duration,
    pub supersede_grace: Duration,
    pub languages: Option<PathBuf>,
}

impl From<EngineArgs> for EngineConfig {
    fn from(args: EngineArgs) -> Self {
        Self {
            workspace_root: args.workspace_root,
            runtime: args.runtime,
            limits: SandboxLimits {
                memory: args.memory,
                cpus: args.cpus,
                pids_limit: args.pids_limit,
                network: NetworkMode::None,
            },
            grace: Duration::from_millis(args.grace_ms),
            supersede_grace: Duration::from_millis(args.supersede_grace_ms),
            languages: args.languages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults() {
        let cli = Cli::try_parse_from(["sandbox-runner", "serve"]).unwrap();
        let Commands::Serve { max_sessions, engine, .. } = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(max_sessions, 64);

        let config = EngineConfig::from(engine);
        assert_eq!(config.runtime, "docker");
        assert_eq!(config.limits, SandboxLimits::default());
        assert_eq!(config.grace, Duration::from_secs(2));
        assert_eq!(config.supersede_grace, Duration::from_millis(250));
        assert!(config.languages.is_none());
    }

    #[test]
    fn run_requires_lang_and_file() {
        assert!(Cli::try_parse_from(["sandbox-runner", "run", "--lang", "python"]).is_err());

        let cli = Cli::try_parse_from([
            "sandbox-runner",
            "run",
            "--lang",
            "python",
            "--file",
            "main.py",
            "--memory",
            "512m",
            "--cpus",
            "1",
        ])
        .unwrap();
        let Commands::Run { lang, file, engine } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(lang, "python");
        assert_eq!(file, PathBuf::from("main.py"));
        let config = EngineConfig::from(engine);
        assert_eq!(config.limits.memory, "512m");
        assert_eq!(config.limits.cpus, 1.0);
        assert_eq!(config.limits.network, NetworkMode::None);
    }
}
