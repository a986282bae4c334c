use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors surfaced by node lifecycle, persistence and provisioning calls.
///
/// The `Display` text is what the host sees after the `error:` prefix, so
/// every variant names the path, command or node it concerns.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Identifier rejected before any file or command was touched.
    #[error("invalid node identifier `{0}`")]
    InvalidId(String),

    /// A start was requested for a node that already has a live handle.
    #[error("already running: {0}")]
    AlreadyRunning(String),

    /// A tracked node whose state the service manager could not report.
    #[error("status unknown: {0}")]
    StatusUnknown(String),

    #[error("read {} failed: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("write {} failed: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("remove {} failed: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The native tool ran and reported failure; `output` is stdout+stderr.
    #[error("`{command}` failed: {output}")]
    Command { command: String, output: String },

    /// The native tool could not be launched at all.
    #[error("could not run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("terminate {id} failed: {source}")]
    Terminate {
        id: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid node registry content: {0}")]
    InvalidRegistry(String),

    #[error("worker binary not installed at {}", .0.display())]
    BinaryMissing(PathBuf),

    #[error("not supported")]
    Unsupported,

    #[error("invalid value `{value}` for {key}")]
    InvalidSetting { key: String, value: String },

    /// Several independent steps failed (reset is best effort).
    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Many(Vec<BridgeError>),
}

impl BridgeError {
    pub fn read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BridgeError::Read { path: path.into(), source }
    }

    pub fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BridgeError::Write { path: path.into(), source }
    }

    pub fn remove(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BridgeError::Remove { path: path.into(), source }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> BridgeError {
        BridgeError::InvalidRegistry(err.to_string())
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
