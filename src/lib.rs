//! Session-scoped sandboxed code execution.
//!
//! A client connects over WebSocket, submits source code with a language tag,
//! and receives the program's stdout/stderr as it is produced, followed by
//! its exit code. Each run executes in a fresh network-less, resource-capped
//! container with the source staged in a private workspace directory.

pub mod config;
pub mod error;
pub mod http_server;
pub mod protocol;
pub mod registry;
pub mod sandbox;
pub mod session;
pub mod state;
pub mod workspace;

pub use error::{Result, SandboxError};
