use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::cache::CacheStore;
use crate::client::UpdateClient;
use crate::clock::ManualClock;
use crate::config::ClientConfig;
use crate::log_sink::MemoryLogSink;
use crate::transport::{DownloadOutcome, HttpRequest, HttpResponse, Transport, TransportError};

pub(crate) const SERVER: &str = "https://updates.example.com";
pub(crate) const INFO_URL: &str = "https://updates.example.com/info/acme";
pub(crate) const DOWNLOAD_URL: &str = "https://updates.example.com/download/acme";
pub(crate) const CHECKSUM_URL: &str =
    "https://updates.example.com/verify_file/acme?action=checksum&version=1.0.0";
pub(crate) const CONNECTED_URL: &str = "https://updates.example.com/connected";

enum Route {
    Respond { status: u16, body: Vec<u8> },
    Fail,
}

/// In-memory transport that records every request. Unrouted URLs answer 404.
pub(crate) struct MockTransport {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<HttpRequest>>,
    tls: bool,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            tls: true,
        }
    }

    pub(crate) fn without_tls(mut self) -> Self {
        self.tls = false;
        self
    }

    pub(crate) fn respond(&self, url: &str, status: u16, body: impl AsRef<[u8]>) {
        self.routes.lock().unwrap().insert(
            url.to_string(),
            Route::Respond {
                status,
                body: body.as_ref().to_vec(),
            },
        );
    }

    pub(crate) fn fail(&self, url: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), Route::Fail);
    }

    /// Serve `version` of `acme` with an artifact whose checksum the server
    /// declares.
    pub(crate) fn publish(&self, version: &str, artifact: &[u8]) {
        self.respond(INFO_URL, 200, info_json(version, Some(DOWNLOAD_URL)));
        self.respond(DOWNLOAD_URL, 200, artifact);
        self.respond(CHECKSUM_URL, 200, format!("{:x}\n", Sha256::digest(artifact)));
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|request| request.url)
            .collect()
    }

    pub(crate) fn count(&self, url: &str) -> usize {
        self.urls().iter().filter(|seen| *seen == url).count()
    }

    pub(crate) fn last_request(&self) -> Option<HttpRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    fn route(&self, request: &HttpRequest) -> Result<(u16, Vec<u8>), TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        match self.routes.lock().unwrap().get(&request.url) {
            Some(Route::Respond { status, body }) => Ok((*status, body.clone())),
            Some(Route::Fail) => Err(TransportError::request(
                "request failed",
                &request.url,
                "connection refused",
            )),
            None => Ok((404, Vec::new())),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let (status, body) = self.route(request)?;
        Ok(HttpResponse { status, body })
    }

    async fn download(
        &self,
        request: &HttpRequest,
        dest: &Path,
    ) -> Result<DownloadOutcome, TransportError> {
        let (status, body) = self.route(request)?;
        if !(200..300).contains(&status) {
            return Ok(DownloadOutcome { status, bytes: 0 });
        }
        std::fs::write(dest, &body).map_err(|source| TransportError::Io {
            context: "failed to write download",
            source,
        })?;
        Ok(DownloadOutcome {
            status,
            bytes: body.len() as u64,
        })
    }

    fn supports_tls(&self) -> bool {
        self.tls
    }
}

pub(crate) fn info_json(version: &str, download_link: Option<&str>) -> String {
    let mut info = serde_json::json!({
        "name": "Acme Widget",
        "slug": "acme",
        "version": version,
        "author": "Acme Inc",
        "sections": {
            "description": "Widgets for everyone",
            "changelog": "<ul><li>Fixes</li></ul>"
        }
    });
    if let Some(link) = download_link {
        info["download_link"] = serde_json::Value::from(link);
    }
    info.to_string()
}

/// A unit `acme` at 1.0.0 with a two-file install, wired to a shared mock
/// server, manual clock, cache and log sink.
pub(crate) struct Harness {
    pub(crate) root: tempfile::TempDir,
    pub(crate) server: Arc<MockTransport>,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) cache: Arc<CacheStore>,
    pub(crate) sink: Arc<MemoryLogSink>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir should be created");
        let install = root.path().join("install/acme");
        std::fs::create_dir_all(install.join("lib")).expect("install dir should be created");
        std::fs::write(install.join("acme.bin"), b"version one").expect("file written");
        std::fs::write(install.join("lib/helper.txt"), b"helper").expect("file written");
        std::fs::create_dir_all(root.path().join("tmp")).expect("tmp dir should be created");

        let clock = Arc::new(ManualClock::default());
        Self {
            root,
            server: Arc::new(MockTransport::new()),
            cache: Arc::new(CacheStore::new(clock.clone())),
            clock,
            sink: Arc::new(MemoryLogSink::new()),
        }
    }

    pub(crate) fn install_dir(&self) -> PathBuf {
        self.root.path().join("install/acme")
    }

    pub(crate) fn temp_dir(&self) -> PathBuf {
        self.root.path().join("tmp")
    }

    pub(crate) fn config(&self) -> ClientConfig {
        ClientConfig::new(SERVER, "acme", "1.0.0", self.install_dir())
            .with_api_key("secret-key")
            .with_backup_dir(self.root.path().join("backups"))
    }

    pub(crate) fn client(&self) -> UpdateClient {
        self.client_with(self.config())
    }

    pub(crate) fn client_with(&self, config: ClientConfig) -> UpdateClient {
        UpdateClient::builder(config)
            .transport(self.server.clone())
            .cache(self.cache.clone())
            .log_sink(self.sink.clone())
            .temp_dir(self.temp_dir())
            .build()
            .expect("client should build")
    }

    pub(crate) fn temp_dir_is_empty(&self) -> bool {
        std::fs::read_dir(self.temp_dir())
            .expect("tmp dir should be readable")
            .next()
            .is_none()
    }
}
