use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::api::ServerApi;
use crate::cache::{CacheStore, CacheValue, unit_key};
use crate::log_sink::UnitLog;
use crate::sanitize::{sanitize_html, sanitize_text, sanitize_url};
use crate::transport::{Transport, TransportError};
use crate::version::is_valid_version;

/// How long successful metadata is served from cache.
pub const METADATA_TTL: Duration = Duration::from_secs(6 * 60 * 60);
/// How long a failed lookup suppresses further requests.
pub const FAILURE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to reach update server: {0}")]
    Transport(#[from] TransportError),
    #[error("update server rejected credentials with HTTP {status}")]
    Auth { status: u16 },
    #[error("update server returned HTTP {status}{body_snippet}")]
    HttpStatus { status: u16, body_snippet: String },
    #[error("invalid metadata response: {0}")]
    InvalidResponse(String),
    #[error("skipping request after recent failure: {0}")]
    CachedFailure(String),
}

/// Sanitized description of the newest version the server offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetadata {
    pub name: String,
    pub slug: String,
    pub version: String,
    pub author: String,
    pub homepage: Option<String>,
    pub requirements: RemoteRequirements,
    pub download_url: Option<String>,
    pub sections: Sections,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRequirements {
    pub min_host_version: Option<String>,
    pub tested_host_version: Option<String>,
    pub min_runtime_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sections {
    pub description: String,
    pub installation: String,
    pub changelog: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawInfo {
    #[serde(default, deserialize_with = "lenient_string")]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    slug: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    version: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    author: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    homepage: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    requires: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    tested: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    requires_php: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    download_link: Option<String>,
    #[serde(default)]
    sections: RawSections,
}

#[derive(Debug, Default, Deserialize)]
struct RawSections {
    #[serde(default, deserialize_with = "lenient_string")]
    description: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    installation: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    changelog: Option<String>,
}

/// Accept strings and numbers (servers sometimes send `"version": 1.2`);
/// anything else reads as absent.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(value) => Some(value),
        serde_json::Value::Number(value) => Some(value.to_string()),
        _ => None,
    })
}

impl RemoteMetadata {
    /// Parse and sanitize a server `info` response body.
    ///
    /// # Errors
    /// Returns [`FetchError::InvalidResponse`] when the body is not JSON, the
    /// version is missing or malformed, or the download link is not an
    /// https URL. Plain http links are only accepted with `allow_plain_http`.
    pub fn from_json(
        body: &[u8],
        unit_id: &str,
        allow_plain_http: bool,
    ) -> Result<Self, FetchError> {
        let raw: RawInfo = serde_json::from_slice(body)
            .map_err(|error| FetchError::InvalidResponse(format!("body is not valid JSON: {error}")))?;
        Self::from_raw(raw, unit_id, allow_plain_http)
    }

    fn from_raw(raw: RawInfo, unit_id: &str, allow_plain_http: bool) -> Result<Self, FetchError> {
        let version = raw
            .version
            .as_deref()
            .map(str::trim)
            .filter(|version| !version.is_empty())
            .ok_or_else(|| FetchError::InvalidResponse("missing `version` field".to_string()))?;
        if !is_valid_version(version) {
            return Err(FetchError::InvalidResponse(format!(
                "`version` '{}' is not a valid version",
                sanitize_text(version)
            )));
        }

        let download_url = match raw.download_link.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(link) => Some(download_link(link, allow_plain_http)?),
        };

        let slug = raw
            .slug
            .as_deref()
            .map(sanitize_text)
            .filter(|slug| !slug.is_empty())
            .unwrap_or_else(|| unit_id.to_string());
        let name = raw
            .name
            .as_deref()
            .map(sanitize_text)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| slug.clone());

        Ok(Self {
            name,
            slug,
            version: version.to_string(),
            author: raw.author.as_deref().map(sanitize_html).unwrap_or_default(),
            homepage: raw.homepage.as_deref().and_then(sanitize_url),
            requirements: RemoteRequirements {
                min_host_version: valid_version(raw.requires.as_deref()),
                tested_host_version: valid_version(raw.tested.as_deref()),
                min_runtime_version: valid_version(raw.requires_php.as_deref()),
            },
            download_url,
            sections: Sections {
                description: section(raw.sections.description.as_deref()),
                installation: section(raw.sections.installation.as_deref()),
                changelog: section(raw.sections.changelog.as_deref()),
            },
        })
    }
}

fn download_link(link: &str, allow_plain_http: bool) -> Result<String, FetchError> {
    let url = sanitize_url(link).ok_or_else(|| {
        FetchError::InvalidResponse("`download_link` is not an http(s) URL".to_string())
    })?;
    if url.starts_with("https://") || allow_plain_http {
        Ok(url)
    } else {
        Err(FetchError::InvalidResponse(format!(
            "`download_link` {url} must use https"
        )))
    }
}

fn valid_version(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|version| is_valid_version(version))
        .map(str::to_string)
}

fn section(raw: Option<&str>) -> String {
    raw.map(sanitize_html).unwrap_or_default()
}

/// Retrieves remote metadata for one unit with positive and negative caching.
#[derive(Clone)]
pub struct MetadataFetcher {
    api: Arc<ServerApi>,
    transport: Arc<dyn Transport>,
    cache: Arc<CacheStore>,
    log: UnitLog,
    unit_id: String,
    current_version: String,
    use_cache: bool,
    allow_plain_http: bool,
}

impl MetadataFetcher {
    pub fn new(
        api: Arc<ServerApi>,
        transport: Arc<dyn Transport>,
        cache: Arc<CacheStore>,
        log: UnitLog,
        unit_id: &str,
        current_version: &str,
    ) -> Self {
        Self {
            api,
            transport,
            cache,
            log,
            unit_id: unit_id.to_string(),
            current_version: current_version.to_string(),
            use_cache: true,
            allow_plain_http: false,
        }
    }

    /// Always go to the network and never store results.
    #[must_use]
    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    /// Accept `http://` download links, for test servers without TLS.
    #[must_use]
    pub fn allow_plain_http(mut self) -> Self {
        self.allow_plain_http = true;
        self
    }

    #[must_use]
    pub fn cache_key(&self) -> String {
        unit_key(&self.unit_id, "info", &self.current_version)
    }

    /// Fetch metadata, serving cached results and cached failures first.
    ///
    /// # Errors
    /// Returns [`FetchError::CachedFailure`] while a previous failure is
    /// cached, otherwise the transport, auth, status or parse failure of the
    /// request. Fresh failures are cached for [`FAILURE_TTL`].
    pub async fn fetch_info(&self) -> Result<RemoteMetadata, FetchError> {
        let key = self.cache_key();
        if self.use_cache {
            match self.cache.get(&key) {
                Some(CacheValue::Metadata(metadata)) => {
                    log::debug!("[{}] metadata served from cache", self.unit_id);
                    return Ok(metadata);
                }
                Some(CacheValue::Failure { message }) => {
                    log::debug!("[{}] negative cache hit: {message}", self.unit_id);
                    return Err(FetchError::CachedFailure(message));
                }
                _ => {}
            }
        }

        match self.fetch_remote().await {
            Ok(metadata) => {
                if self.use_cache {
                    self.cache
                        .set(&key, CacheValue::Metadata(metadata.clone()), METADATA_TTL);
                }
                self.log.info(
                    "Fetched update metadata",
                    &[
                        ("version", metadata.version.clone()),
                        ("current_version", self.current_version.clone()),
                    ],
                );
                Ok(metadata)
            }
            Err(error) => {
                let message = error.to_string();
                if self.use_cache {
                    self.cache.set(
                        &key,
                        CacheValue::Failure {
                            message: message.clone(),
                        },
                        FAILURE_TTL,
                    );
                }
                self.log.error(
                    "Failed to fetch update metadata",
                    &[("url", self.api.info_request().url)],
                );
                self.log
                    .debug("Metadata fetch error detail", &[("error", message)]);
                Err(error)
            }
        }
    }

    async fn fetch_remote(&self) -> Result<RemoteMetadata, FetchError> {
        let response = self.transport.get(&self.api.info_request()).await?;
        match response.status {
            200 => RemoteMetadata::from_json(&response.body, &self.unit_id, self.allow_plain_http),
            401 | 403 => Err(FetchError::Auth {
                status: response.status,
            }),
            status => Err(FetchError::HttpStatus {
                status,
                body_snippet: response.snippet(160),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{FAILURE_TTL, FetchError, MetadataFetcher, RemoteMetadata};
    use crate::api::ServerApi;
    use crate::cache::CacheStore;
    use crate::clock::ManualClock;
    use crate::config::ClientConfig;
    use crate::log_sink::{LogLevel, LogSink, MemoryLogSink, UnitLog};
    use crate::test_support::{MockTransport, info_json};

    const INFO_URL: &str = "https://updates.example.com/info/acme";

    struct Harness {
        clock: Arc<ManualClock>,
        transport: Arc<MockTransport>,
        sink: Arc<MemoryLogSink>,
        fetcher: MetadataFetcher,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::default());
        let cache = Arc::new(CacheStore::new(clock.clone()));
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(MemoryLogSink::new());
        let config = ClientConfig::new("https://updates.example.com", "acme", "1.0.0", "/opt/acme");
        let fetcher = MetadataFetcher::new(
            Arc::new(ServerApi::from_config(&config)),
            transport.clone(),
            cache,
            UnitLog::new("acme", Some(sink.clone() as Arc<dyn LogSink>), clock.clone()),
            "acme",
            "1.0.0",
        );
        Harness {
            clock,
            transport,
            sink,
            fetcher,
        }
    }

    #[test]
    fn parses_and_sanitizes_server_json() {
        let body = br#"{
            "name": "<b>Acme</b> Widget",
            "slug": "acme",
            "version": "1.1.0",
            "author": "<a href=\"https://acme.example\" onclick=\"x()\">Acme Inc</a>",
            "homepage": "javascript:alert(1)",
            "requires": "6.0",
            "tested": 6.5,
            "requires_php": "8.x",
            "download_link": "https://updates.example.com/download/acme",
            "sections": {
                "description": "<p>Widgets!</p><script>alert(1)</script>",
                "changelog": "<ul><li>Fix</li></ul>"
            }
        }"#;

        let metadata = RemoteMetadata::from_json(body, "acme", false).expect("metadata should parse");
        assert_eq!(metadata.name, "Acme Widget");
        assert_eq!(metadata.version, "1.1.0");
        assert_eq!(
            metadata.author,
            "<a href=\"https://acme.example\">Acme Inc</a>"
        );
        assert_eq!(metadata.homepage, None);
        assert_eq!(metadata.requirements.min_host_version.as_deref(), Some("6.0"));
        assert_eq!(
            metadata.requirements.tested_host_version.as_deref(),
            Some("6.5")
        );
        assert_eq!(metadata.requirements.min_runtime_version, None);
        assert_eq!(metadata.sections.description, "<p>Widgets!</p>");
        assert_eq!(metadata.sections.changelog, "<ul><li>Fix</li></ul>");
        assert_eq!(metadata.sections.installation, "");
    }

    #[test]
    fn rejects_missing_or_invalid_version() {
        for body in [
            br#"{"name": "Acme"}"#.as_slice(),
            br#"{"version": ""}"#.as_slice(),
            br#"{"version": "latest"}"#.as_slice(),
            b"<html>maintenance</html>".as_slice(),
        ] {
            assert!(matches!(
                RemoteMetadata::from_json(body, "acme", false),
                Err(FetchError::InvalidResponse(_))
            ));
        }
    }

    #[test]
    fn rejects_non_http_download_link_and_defaults_slug() {
        assert!(matches!(
            RemoteMetadata::from_json(
                br#"{"version": "2.0", "download_link": "ftp://example.com/a.zip"}"#,
                "acme",
                false
            ),
            Err(FetchError::InvalidResponse(_))
        ));

        let metadata = RemoteMetadata::from_json(br#"{"version": 2}"#, "acme", false)
            .expect("numeric version should parse");
        assert_eq!(metadata.slug, "acme");
        assert_eq!(metadata.name, "acme");
        assert_eq!(metadata.version, "2");
        assert_eq!(metadata.download_url, None);
    }

    #[test]
    fn plain_http_download_link_needs_test_mode() {
        let body = br#"{"version": "1.1.0", "download_link": "http://mirror.example.com/acme.zip"}"#;
        assert!(matches!(
            RemoteMetadata::from_json(body, "acme", false),
            Err(FetchError::InvalidResponse(ref message)) if message.contains("https")
        ));

        let metadata =
            RemoteMetadata::from_json(body, "acme", true).expect("test servers may use http");
        assert_eq!(
            metadata.download_url.as_deref(),
            Some("http://mirror.example.com/acme.zip")
        );
    }

    #[tokio::test]
    async fn second_fetch_within_ttl_uses_cache() {
        let harness = harness();
        harness.transport.respond(INFO_URL, 200, info_json("1.1.0", None));

        let first = harness.fetcher.fetch_info().await.expect("first fetch succeeds");
        let second = harness.fetcher.fetch_info().await.expect("second fetch succeeds");

        assert_eq!(first, second);
        assert_eq!(harness.transport.request_count(), 1);
        let entries = harness.sink.entries("acme");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Info);
    }

    #[tokio::test]
    async fn failure_is_negatively_cached_for_an_hour() {
        let harness = harness();
        harness.transport.respond(INFO_URL, 503, "maintenance");

        let first = harness.fetcher.fetch_info().await;
        assert!(matches!(first, Err(FetchError::HttpStatus { status: 503, .. })));

        harness.transport.respond(INFO_URL, 200, info_json("1.1.0", None));
        harness.clock.advance(FAILURE_TTL - Duration::from_secs(1));
        let cached = harness.fetcher.fetch_info().await;
        assert!(matches!(cached, Err(FetchError::CachedFailure(ref message)) if message.contains("503")));
        assert_eq!(harness.transport.request_count(), 1);

        harness.clock.advance(Duration::from_secs(1));
        let retried = harness.fetcher.fetch_info().await;
        assert!(retried.is_ok());
        assert_eq!(harness.transport.request_count(), 2);

        let levels: Vec<_> = harness
            .sink
            .entries("acme")
            .into_iter()
            .map(|entry| entry.level)
            .collect();
        assert_eq!(levels, [LogLevel::Error, LogLevel::Debug, LogLevel::Info]);
    }

    #[tokio::test]
    async fn auth_and_transport_failures_are_typed() {
        let rejected = harness();
        rejected.transport.respond(INFO_URL, 401, "");
        assert!(matches!(
            rejected.fetcher.fetch_info().await,
            Err(FetchError::Auth { status: 401 })
        ));

        let unreachable = harness();
        unreachable.transport.fail(INFO_URL);
        assert!(matches!(
            unreachable.fetcher.fetch_info().await,
            Err(FetchError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn uncached_fetcher_always_hits_network() {
        let harness = harness();
        harness.transport.respond(INFO_URL, 200, info_json("1.1.0", None));
        let fetcher = harness.fetcher.clone().without_cache();

        fetcher.fetch_info().await.expect("first fetch succeeds");
        fetcher.fetch_info().await.expect("second fetch succeeds");
        assert_eq!(harness.transport.request_count(), 2);
    }
}
