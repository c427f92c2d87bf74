//! Error taxonomy for the benchmark core
//!
//! Setup errors (`Config`, `Resolution`, `Fork`, `Attach`) are fatal and
//! reported once. `Privilege` and `Write` are local to a single snapshot: the
//! run logs them and carries on to the next checkpoint.

use std::path::PathBuf;
use thiserror::Error;

/// Invalid or contradictory run configuration
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown sort key '{0}'. Expected one of: name, id, count, overhead, avg-overhead")]
    UnknownSortKey(String),

    #[error("Invalid time specification \"{0}\". Supports values like: #[s] #m #h #d #w, combinable as 1m30s")]
    InvalidDuration(String),

    #[error("{what} must be greater than zero")]
    ZeroInterval { what: &'static str },

    #[error("{0}")]
    Conflict(String),

    #[error("Refusing to overwrite {0} without --overwrite")]
    WouldOverwrite(PathBuf),

    #[error("Cannot write results to {path}: {reason}")]
    Destination { path: PathBuf, reason: String },

    #[error("Invalid identity \"{0}\". Expected UID or UID:GID")]
    InvalidIdentity(String),
}

/// Errors surfaced by the orchestration core
#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unable to resolve target {target}: {reason}")]
    Resolution { target: String, reason: String },

    #[error("Failed to create target process: {0}")]
    Fork(#[source] nix::Error),

    #[error("Failed to attach instrumentation: {0}")]
    Attach(String),

    #[error("Skipping write to {path}: {reason}")]
    Privilege { path: PathBuf, reason: String },

    #[error("Failed to write snapshot to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to install signal handling: {0}")]
    Signal(#[source] nix::Error),

    #[error("Failed to start {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl BenchError {
    /// Whether the run can continue past this error
    pub fn is_local(&self) -> bool {
        matches!(self, BenchError::Privilege { .. } | BenchError::Write { .. })
    }
}

pub type Result<T> = std::result::Result<T, BenchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_errors() {
        let privilege = BenchError::Privilege {
            path: PathBuf::from("/tmp/x"),
            reason: "no identity".into(),
        };
        assert!(privilege.is_local());
        let write = BenchError::Write {
            path: PathBuf::from("/tmp/x"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(write.is_local());
        assert!(!BenchError::Attach("nope".into()).is_local());
        assert!(!BenchError::Config(ConfigError::UnknownSortKey("x".into())).is_local());
    }

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::UnknownSortKey("bogus".into());
        assert!(err.to_string().contains("bogus"));

        let err = ConfigError::ZeroInterval { what: "checkpoint" };
        assert_eq!(err.to_string(), "checkpoint must be greater than zero");
    }
}
