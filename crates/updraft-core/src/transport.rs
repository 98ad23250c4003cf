use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("{context} for {url}: {details}")]
    Request {
        context: &'static str,
        url: String,
        details: String,
    },
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl TransportError {
    pub fn request(context: &'static str, url: &str, details: impl Into<String>) -> Self {
        Self::Request {
            context,
            url: url.to_string(),
            details: details.into(),
        }
    }

    fn from_reqwest(context: &'static str, url: &str, error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else {
            Self::request(context, url, error.to_string())
        }
    }

    fn io_with_path(context: &'static str, path: &Path, source: &std::io::Error) -> Self {
        Self::Io {
            context,
            source: std::io::Error::new(source.kind(), format!("{}: {source}", path.display())),
        }
    }
}

/// A fully described GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl HttpRequest {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Up to `max_chars` of the body, prefixed for appending to an error
    /// message.
    #[must_use]
    pub fn snippet(&self, max_chars: usize) -> String {
        let snippet: String = self.text().chars().take(max_chars).collect();
        if snippet.trim().is_empty() {
            String::new()
        } else {
            format!(": {}", snippet.trim())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub status: u16,
    pub bytes: u64,
}

/// The HTTP client the pipeline talks through.
///
/// Implementations must verify TLS certificates and honor the per-request
/// timeout.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;

    /// Stream the response body into `dest`. On a non-success status nothing
    /// is written and the status is returned for the caller to judge.
    async fn download(
        &self,
        request: &HttpRequest,
        dest: &Path,
    ) -> Result<DownloadOutcome, TransportError>;

    fn supports_tls(&self) -> bool {
        true
    }
}

/// `reqwest`-backed transport using rustls with certificate verification.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport with the given default `User-Agent` and timeout.
    ///
    /// # Errors
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|error| {
                TransportError::request("failed to build HTTP client", "-", error.to_string())
            })?;
        Ok(Self { client })
    }

    #[must_use]
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.get(&request.url).timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        debug!("GET {}", request.url);
        let response = self.build(request).send().await.map_err(|error| {
            TransportError::from_reqwest("request failed", &request.url, &error)
        })?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|error| {
            TransportError::from_reqwest("failed to read response body", &request.url, &error)
        })?;

        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }

    async fn download(
        &self,
        request: &HttpRequest,
        dest: &Path,
    ) -> Result<DownloadOutcome, TransportError> {
        debug!("Downloading {} to {}", request.url, dest.display());
        let response = self.build(request).send().await.map_err(|error| {
            TransportError::from_reqwest("download request failed", &request.url, &error)
        })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Ok(DownloadOutcome { status, bytes: 0 });
        }

        let partial = partial_path(dest);
        let written = match stream_to_file(response, &request.url, &partial).await {
            Ok(written) => written,
            Err(error) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await
                    && cleanup.kind() != std::io::ErrorKind::NotFound
                {
                    warn!("Failed to remove partial download {}: {cleanup}", partial.display());
                }
                return Err(error);
            }
        };
        tokio::fs::rename(&partial, dest).await.map_err(|error| {
            TransportError::io_with_path("failed to move download into place", dest, &error)
        })?;

        debug!("Download complete: {written} bytes");
        Ok(DownloadOutcome {
            status,
            bytes: written,
        })
    }
}

/// Downloads land next to `dest` and only take its name once complete.
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

async fn stream_to_file(
    response: reqwest::Response,
    url: &str,
    path: &Path,
) -> Result<u64, TransportError> {
    use futures_util::TryStreamExt;

    let mut file = tokio::fs::File::create(path).await.map_err(|error| {
        TransportError::io_with_path("failed to create download file", path, &error)
    })?;
    let mut chunks = response
        .bytes_stream()
        .map_err(|error| TransportError::from_reqwest("download stream error", url, &error));
    let mut written = 0_u64;
    while let Some(chunk) = chunks.try_next().await? {
        file.write_all(&chunk).await.map_err(|error| {
            TransportError::io_with_path("failed to write download data", path, &error)
        })?;
        written += chunk.len() as u64;
    }
    file.sync_all().await.map_err(|error| {
        TransportError::io_with_path("failed to flush download file", path, &error)
    })?;
    Ok(written)
}
