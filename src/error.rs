//! Error taxonomy for staging and supervising runs.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    /// The language tag has no registry entry. No resources were touched.
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Workspace I/O failed ({context}): {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Sandbox environment could not start: {0}")]
    Launch(String),
    #[error("Process is not running")]
    ProcessNotRunning,
    #[error("Process is not reading stdin fast enough; input dropped")]
    StdinBackpressure,
    #[error("Invalid language table: {0}")]
    Registry(String),
    #[error("Invalid sandbox limits: {0}")]
    Limits(String),
}

impl SandboxError {
    pub(crate) fn io(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| SandboxError::Io { context, source }
    }
}

pub type Result<T, E = SandboxError> = ::std::result::Result<T, E>;
