//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// Per-domain inspection failures are not represented here; they travel as
/// [`crate::domain::FailureReason`] inside an inspection result.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Hypervisor connection error: {0}")]
    Connection(String),

    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Command error: {0}")]
    Command(#[from] process_utils::CommandError),

    #[error("Failed to parse {what}: {message}")]
    Parse { what: &'static str, message: String },

    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn parse(what: &'static str, message: impl Into<String>) -> Self {
        Self::Parse {
            what,
            message: message.into(),
        }
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}
