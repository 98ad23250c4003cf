use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::api::ServerApi;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("download of {url} failed with HTTP {status}")]
    DownloadStatus { url: String, status: u16 },
    #[error("checksum unavailable: {0}")]
    ChecksumUnavailable(String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl VerifyError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    fn io_with_path(context: &'static str, path: &Path, source: &std::io::Error) -> Self {
        Self::Io {
            context,
            source: std::io::Error::new(source.kind(), format!("{}: {source}", path.display())),
        }
    }
}

/// Downloads a candidate artifact into a scratch directory and checks its
/// SHA-256 digest against the value the server declares.
#[derive(Clone)]
pub struct PackageVerifier {
    api: Arc<ServerApi>,
    transport: Arc<dyn Transport>,
    unit_id: String,
    current_version: String,
    temp_root: Option<PathBuf>,
}

impl PackageVerifier {
    pub fn new(
        api: Arc<ServerApi>,
        transport: Arc<dyn Transport>,
        unit_id: &str,
        current_version: &str,
    ) -> Self {
        Self {
            api,
            transport,
            unit_id: unit_id.to_string(),
            current_version: current_version.to_string(),
            temp_root: None,
        }
    }

    /// Create scratch directories under `root` instead of the system temp dir.
    #[must_use]
    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    /// Download `download_url` and verify it, returning the hex digest.
    ///
    /// The downloaded file is removed before returning on every path.
    ///
    /// # Errors
    /// Returns a download, checksum or I/O error; [`VerifyError::ChecksumMismatch`]
    /// when the artifact does not match the declared digest.
    pub async fn verify(&self, download_url: &str) -> Result<String, VerifyError> {
        let temp_dir = match &self.temp_root {
            Some(root) => tempfile::Builder::new()
                .prefix("updraft-verify-")
                .tempdir_in(root),
            None => tempfile::Builder::new().prefix("updraft-verify-").tempdir(),
        }
        .map_err(|error| VerifyError::io("failed to create download directory", error))?;

        let artifact = temp_dir.path().join(format!("{}.pkg", self.unit_id));
        let result = self.download_and_check(download_url, &artifact).await;

        let temp_path = temp_dir.path().to_path_buf();
        match (temp_dir.close(), result) {
            (Ok(()), result) => result,
            (Err(error), Ok(_)) => Err(VerifyError::io_with_path(
                "failed to remove verification download",
                &temp_path,
                &error,
            )),
            (Err(error), Err(result)) => {
                warn!(
                    "Failed to remove verification download {}: {error}",
                    temp_path.display()
                );
                Err(result)
            }
        }
    }

    async fn download_and_check(&self, url: &str, artifact: &Path) -> Result<String, VerifyError> {
        let request = self.api.download_request(url);
        let outcome = self
            .transport
            .download(&request, artifact)
            .await
            .map_err(|source| VerifyError::Download {
                url: url.to_string(),
                source,
            })?;
        if !(200..300).contains(&outcome.status) {
            return Err(VerifyError::DownloadStatus {
                url: url.to_string(),
                status: outcome.status,
            });
        }
        debug!("[{}] downloaded {} bytes for verification", self.unit_id, outcome.bytes);

        let expected = self.expected_checksum().await?;
        let actual = sha256_file(artifact)?;

        if actual == expected {
            info!("[{}] package checksum verified", self.unit_id);
            Ok(actual)
        } else {
            Err(VerifyError::ChecksumMismatch { expected, actual })
        }
    }

    async fn expected_checksum(&self) -> Result<String, VerifyError> {
        let response = self
            .transport
            .get(&self.api.checksum_request(&self.current_version))
            .await
            .map_err(|error| VerifyError::ChecksumUnavailable(error.to_string()))?;
        if !response.is_success() {
            return Err(VerifyError::ChecksumUnavailable(format!(
                "server returned HTTP {}{}",
                response.status,
                response.snippet(120)
            )));
        }

        parse_checksum(&response.text()).ok_or_else(|| {
            VerifyError::ChecksumUnavailable("server returned an empty checksum".to_string())
        })
    }
}

/// The first token of a checksum response, lowercased. Accepts both a bare
/// digest and `sha256sum`-style `<digest>  <file>` lines.
fn parse_checksum(body: &str) -> Option<String> {
    body.split_whitespace()
        .next()
        .map(str::to_ascii_lowercase)
}

/// Hex SHA-256 digest of a file's contents.
///
/// # Errors
/// Returns an I/O error if the file cannot be read.
pub fn sha256_file(path: &Path) -> Result<String, VerifyError> {
    let mut file = std::fs::File::open(path).map_err(|error| {
        VerifyError::io_with_path("failed to open file for checksum", path, &error)
    })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|error| {
        VerifyError::io_with_path("failed to read file for checksum", path, &error)
    })?;

    Ok(format!("{:x}", hasher.finalize()))
}
