use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by workspaces, installers and engines.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or unusable configuration (version marker, required parameter).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A tool command exited with a non-zero status.
    #[error("`{}` exited with status {exit_status}: {}", .command.join(" "), .stderr.trim())]
    CommandExecution {
        command: Vec<String>,
        stderr: String,
        exit_status: i32,
    },

    /// Download, checksum or signature verification failure.
    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("{path} not found")]
    NotFound { path: String },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn transfer(message: impl Into<String>) -> Self {
        Self::Transfer(message.into())
    }

    /// Captured standard error of a failed command, if this is one.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::CommandExecution { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
