use std::path::PathBuf;

use thiserror::Error;
use updraft_core::UpdateError;
use updraft_platform::AppPathsError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("failed to resolve application paths: {0}")]
    Paths(#[from] AppPathsError),
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid units file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no units configured in {0}")]
    NoUnits(PathBuf),
    #[error("unit '{0}' is not configured")]
    UnknownUnit(String),
    #[error("no backups found for '{0}'")]
    NoBackups(String),
    #[error("failed to render output: {0}")]
    Render(#[from] serde_json::Error),
    #[error(transparent)]
    Update(#[from] UpdateError),
}

impl CliError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}
