use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::backup::BackupError;
use crate::config::ConfigError;
use crate::metadata::FetchError;
use crate::rate_limit::RateLimited;
use crate::transport::TransportError;
use crate::verify::VerifyError;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    RateLimited(#[from] RateLimited),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("package verification failed: {0}")]
    Verify(#[from] VerifyError),

    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("'{requested}' is not managed by this client (unit '{managed}')")]
    UnknownUnit { requested: String, managed: String },

    #[error("another update is already being applied for '{0}'")]
    Busy(String),

    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Coarse failure category, for hosts that react to the kind of failure
/// rather than its details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Transport,
    Auth,
    InvalidResponse,
    RateLimited,
    CachedFailure,
    Download,
    Verification,
    ChecksumMismatch,
    Backup,
    Lock,
}

impl UpdateError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::UnknownUnit { .. } => ErrorKind::Config,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Fetch(FetchError::Transport(_)) | Self::Transport(_) => ErrorKind::Transport,
            Self::Fetch(FetchError::Auth { .. }) => ErrorKind::Auth,
            Self::Fetch(FetchError::HttpStatus { .. } | FetchError::InvalidResponse(_)) => {
                ErrorKind::InvalidResponse
            }
            Self::Fetch(FetchError::CachedFailure(_)) => ErrorKind::CachedFailure,
            Self::Verify(VerifyError::Download { .. } | VerifyError::DownloadStatus { .. }) => {
                ErrorKind::Download
            }
            Self::Verify(VerifyError::ChecksumMismatch { .. }) => ErrorKind::ChecksumMismatch,
            Self::Verify(VerifyError::ChecksumUnavailable(_) | VerifyError::Io { .. }) => {
                ErrorKind::Verification
            }
            Self::Backup(_) => ErrorKind::Backup,
            Self::Busy(_) | Self::Lock { .. } => ErrorKind::Lock,
        }
    }
}
