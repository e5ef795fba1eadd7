//! Error types for `burrow-core`.
//!
//! Fallible operations return [`CoreResult<T>`]. Filesystem failures while
//! loading entries never surface here: they degrade the entry instead. What
//! remains are configuration problems, bad filter patterns and task-body
//! failures, which the scheduler turns into plain-text notifications.

use std::path::{Path, PathBuf};

/// Unified error type for all core operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The target path does not exist.
    #[error("path not found: {0}")]
    NotFound(PathBuf),

    /// The process lacks permission to access the path.
    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// A directory was expected but the path points to something else.
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    /// A file name has no usable final component.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Failed to parse a TOML configuration file.
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// A hidden-file or name filter is not a valid regular expression.
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    /// An external process could not be started.
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// An I/O error that doesn't fit a more specific variant.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Maps an I/O error on `path` to the most specific variant.
    pub fn from_io(path: &Path, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => CoreError::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => CoreError::PermissionDenied(path.to_path_buf()),
            _ => CoreError::Io(err),
        }
    }
}

/// Convenience alias used throughout `burrow-core`.
pub type CoreResult<T> = Result<T, CoreError>;
