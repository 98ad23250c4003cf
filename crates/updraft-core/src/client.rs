use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use updraft_platform::AppPaths;

use crate::api::ServerApi;
use crate::backup::{BackupInfo, BackupManager};
use crate::cache::{CacheStore, unit_key};
use crate::config::{ClientConfig, ConfigError};
use crate::error::UpdateError;
use crate::health::{ConnectionResult, HealthMonitor, HealthReport, probe_connection};
use crate::lock::UnitLock;
use crate::log_sink::{LogSink, UnitLog};
use crate::metadata::{MetadataFetcher, RemoteMetadata};
use crate::rate_limit::RateLimiter;
use crate::status::{StatusReporter, UpdateStatus};
use crate::transport::{ReqwestTransport, Transport};
use crate::verify::PackageVerifier;
use crate::version::is_newer_version;

pub const ENDPOINT_UPDATE_CHECK: &str = "update_check";
pub const ENDPOINT_PLUGIN_INFORMATION: &str = "plugin_information";
pub const ENDPOINT_CONNECTION_TEST: &str = "connection_test";
pub const ENDPOINT_PACKAGE_VERIFY: &str = "package_verify";

/// States of a single update check. Every check starts from `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Idle,
    Checking,
    UpToDate,
    UpdateAvailable,
    Failed,
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::UpToDate => "up_to_date",
            Self::UpdateAvailable => "update_available",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A newer version the server offers, handed to the host's installer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableUpdate {
    pub current_version: String,
    pub metadata: RemoteMetadata,
}

#[derive(Debug)]
pub enum UpdateCheckResult {
    UpToDate {
        current_version: String,
        latest_version: String,
    },
    UpdateAvailable(AvailableUpdate),
    Failed(UpdateError),
}

impl UpdateCheckResult {
    #[must_use]
    pub fn state(&self) -> CheckState {
        match self {
            Self::UpToDate { .. } => CheckState::UpToDate,
            Self::UpdateAvailable(_) => CheckState::UpdateAvailable,
            Self::Failed(_) => CheckState::Failed,
        }
    }

    #[must_use]
    pub fn available(&self) -> Option<&AvailableUpdate> {
        match self {
            Self::UpdateAvailable(update) => Some(update),
            _ => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&UpdateError> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Outcome of [`UpdateClient::prepare_update`]: the artifact is verified (when
/// enabled) and the current install is backed up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedUpdate {
    pub metadata: RemoteMetadata,
    pub download_url: String,
    /// SHA-256 of the verified artifact; `None` when verification is disabled.
    pub checksum: Option<String>,
    pub backup_path: PathBuf,
}

impl PreparedUpdate {
    #[must_use]
    pub fn verified(&self) -> bool {
        self.checksum.is_some()
    }
}

pub struct UpdateClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    cache: Option<Arc<CacheStore>>,
    log_sink: Option<Arc<dyn LogSink>>,
    temp_dir: Option<PathBuf>,
}

impl UpdateClientBuilder {
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use `cache` instead of the process-wide store.
    #[must_use]
    pub fn cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Receives log entries while `enable_logging` is on.
    #[must_use]
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Directory for verification downloads; the system temp dir otherwise.
    #[must_use]
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Validate the configuration and wire the pipeline together.
    ///
    /// # Errors
    /// Returns [`UpdateError::Config`] for an invalid configuration or when
    /// the default backup directory cannot be resolved, and
    /// [`UpdateError::Transport`] if the default HTTP client cannot be built.
    pub fn build(self) -> Result<UpdateClient, UpdateError> {
        let mut config = self.config;
        config.validate()?;
        if config.backup_dir.is_none() {
            let paths = AppPaths::new().map_err(ConfigError::from)?;
            config.backup_dir = Some(paths.backups_dir());
        }
        let backup_dir = config.backup_dir.clone().unwrap_or_default();

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(
                &config.user_agent(),
                config.http_timeout(),
            )?),
        };
        let cache = self.cache.unwrap_or_else(CacheStore::shared);
        let clock = cache.clock();
        let api = Arc::new(ServerApi::from_config(&config));
        let unit_id = config.unit_id.as_str();
        let current_version = config.current_version.as_str();

        let sink = self.log_sink.filter(|_| config.options.enable_logging);
        let log = UnitLog::new(unit_id, sink, clock.clone());

        let limiter = config
            .options
            .rate_limiting
            .map(|settings| RateLimiter::new(cache.clone(), unit_id, settings));

        let mut fetcher = MetadataFetcher::new(
            api.clone(),
            transport.clone(),
            cache.clone(),
            log.clone(),
            unit_id,
            current_version,
        );
        if config.test_mode {
            fetcher = fetcher.without_cache().allow_plain_http();
        }

        let mut verifier =
            PackageVerifier::new(api.clone(), transport.clone(), unit_id, current_version);
        if let Some(dir) = self.temp_dir {
            verifier = verifier.with_temp_root(dir);
        }

        let backups = BackupManager::new(
            unit_id,
            current_version,
            config.install_dir.clone(),
            backup_dir,
            clock.clone(),
        );
        let health = HealthMonitor::new(
            api.clone(),
            transport.clone(),
            clock,
            config.host.clone(),
            config.requirements.clone(),
            config.install_dir.clone(),
        );
        let status = StatusReporter::new(cache.clone(), unit_id);

        log::debug!("Configured update client {config:?}");
        Ok(UpdateClient {
            config,
            api,
            transport,
            cache,
            log,
            limiter,
            fetcher,
            verifier,
            backups,
            health,
            status,
            apply_lock: tokio::sync::Mutex::new(()),
        })
    }
}

/// The update pipeline for one unit. Hosts keep one per unit and call its
/// operations whenever they decide to.
pub struct UpdateClient {
    config: ClientConfig,
    api: Arc<ServerApi>,
    transport: Arc<dyn Transport>,
    cache: Arc<CacheStore>,
    log: UnitLog,
    limiter: Option<RateLimiter>,
    fetcher: MetadataFetcher,
    verifier: PackageVerifier,
    backups: BackupManager,
    health: HealthMonitor,
    status: StatusReporter,
    apply_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for UpdateClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateClient")
            .field("config", &self.config)
            .field("api", &self.api)
            .finish_non_exhaustive()
    }
}

impl UpdateClient {
    #[must_use]
    pub fn builder(config: ClientConfig) -> UpdateClientBuilder {
        UpdateClientBuilder {
            config,
            transport: None,
            cache: None,
            log_sink: None,
            temp_dir: None,
        }
    }

    /// A client with the default transport, shared cache and no log sink.
    ///
    /// # Errors
    /// See [`UpdateClientBuilder::build`].
    pub fn new(config: ClientConfig) -> Result<Self, UpdateError> {
        Self::builder(config).build()
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn unit_id(&self) -> &str {
        &self.config.unit_id
    }

    #[must_use]
    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.limiter.as_ref()
    }

    #[must_use]
    pub fn backup_dir(&self) -> &Path {
        self.backups.backup_dir()
    }

    /// Run one update check: rate-limit gate, metadata fetch, version
    /// comparison.
    pub async fn check_for_updates(&self) -> UpdateCheckResult {
        self.transition(CheckState::Idle, CheckState::Checking);

        let outcome = match self.gate(ENDPOINT_UPDATE_CHECK) {
            Ok(()) => self.fetcher.fetch_info().await.map_err(UpdateError::from),
            Err(error) => Err(error),
        };

        let result = match outcome {
            Err(error) => {
                self.status.record_error(error.to_string());
                UpdateCheckResult::Failed(error)
            }
            Ok(metadata) if is_newer_version(&metadata.version, &self.config.current_version) => {
                self.status
                    .record_success(format!("Update {} is available", metadata.version));
                self.log.info(
                    "Update available",
                    &[
                        ("current_version", self.config.current_version.clone()),
                        ("new_version", metadata.version.clone()),
                    ],
                );
                UpdateCheckResult::UpdateAvailable(AvailableUpdate {
                    current_version: self.config.current_version.clone(),
                    metadata,
                })
            }
            Ok(metadata) => {
                self.status.record_success(format!(
                    "{} is up to date",
                    self.config.current_version
                ));
                UpdateCheckResult::UpToDate {
                    current_version: self.config.current_version.clone(),
                    latest_version: metadata.version,
                }
            }
        };

        self.transition(CheckState::Checking, result.state());
        result
    }

    /// Metadata for the unit identified by `slug`, as the host's plugin
    /// information screen would request it.
    ///
    /// # Errors
    /// Returns [`UpdateError::UnknownUnit`] if `slug` is not this client's
    /// unit, otherwise the rate-limit or fetch failure.
    pub async fn fetch_plugin_information(
        &self,
        slug: &str,
    ) -> Result<RemoteMetadata, UpdateError> {
        if slug != self.config.unit_id {
            return Err(UpdateError::UnknownUnit {
                requested: slug.to_string(),
                managed: self.config.unit_id.clone(),
            });
        }

        let result = match self.gate(ENDPOINT_PLUGIN_INFORMATION) {
            Ok(()) => self.fetcher.fetch_info().await.map_err(UpdateError::from),
            Err(error) => Err(error),
        };
        match &result {
            Ok(metadata) => self
                .status
                .record_success(format!("Fetched information for {}", metadata.version)),
            Err(error) => self.status.record_error(error.to_string()),
        }
        result
    }

    pub async fn test_server_connection(&self) -> ConnectionResult {
        if let Err(error) = self.gate(ENDPOINT_CONNECTION_TEST) {
            let message = error.to_string();
            self.status.record_error(message.clone());
            return ConnectionResult {
                connected: false,
                status_code: None,
                message,
                elapsed_ms: 0,
            };
        }

        let result = probe_connection(&self.api, self.transport.as_ref()).await;
        let context = [
            ("url", self.api.connected_request().url),
            ("elapsed_ms", result.elapsed_ms.to_string()),
        ];
        if result.connected {
            self.status.record_success(result.message.clone());
            self.log.info("Server connection succeeded", &context);
        } else {
            self.status.record_error(result.message.clone());
            self.log.warning(&result.message, &context);
        }
        result
    }

    /// `None` when health monitoring is disabled for this unit.
    pub async fn check_system_health(&self) -> Option<HealthReport> {
        if !self.config.options.health_monitoring {
            return None;
        }

        let report = self.health.check_health().await;
        let failed: Vec<&str> = report
            .checks
            .iter()
            .filter(|check| !check.passed)
            .map(|check| check.name.as_str())
            .collect();
        if failed.is_empty() {
            self.status.record_success("All health checks passed");
        } else {
            let message = format!("Health checks failed: {}", failed.join(", "));
            self.log.warning(&message, &[]);
            self.status.record_error(message);
        }
        Some(report)
    }

    #[must_use]
    pub fn get_last_status(&self) -> Option<UpdateStatus> {
        self.status.last()
    }

    /// Verify the offered artifact (when `verify_packages` is on) and back up
    /// the current install, ready for the host's installer.
    ///
    /// Attempts for the same unit are serialized in-process and across
    /// processes.
    ///
    /// # Errors
    /// Returns [`UpdateError::Busy`] when another process is preparing this
    /// unit, a verification error (including checksum mismatch), or a backup
    /// error. Nothing is downgraded to "no update".
    pub async fn prepare_update(
        &self,
        update: &AvailableUpdate,
    ) -> Result<PreparedUpdate, UpdateError> {
        let _guard = self.apply_lock.lock().await;
        let result = self.prepare_locked(update).await;
        match &result {
            Ok(prepared) => {
                self.status.record_success(format!(
                    "Update {} prepared",
                    prepared.metadata.version
                ));
                self.log.info(
                    "Update prepared",
                    &[
                        ("version", prepared.metadata.version.clone()),
                        ("backup", prepared.backup_path.display().to_string()),
                    ],
                );
            }
            Err(error) => {
                self.status.record_error(error.to_string());
                self.log.error(
                    "Update preparation failed",
                    &[
                        ("version", update.metadata.version.clone()),
                        ("error", error.to_string()),
                    ],
                );
            }
        }
        result
    }

    async fn prepare_locked(&self, update: &AvailableUpdate) -> Result<PreparedUpdate, UpdateError> {
        let _lock = UnitLock::acquire(self.backups.backup_dir(), &self.config.unit_id)?;

        let download_url = update
            .metadata
            .download_url
            .clone()
            .unwrap_or_else(|| self.api.default_download_url());

        let checksum = if self.config.options.verify_packages {
            self.gate(ENDPOINT_PACKAGE_VERIFY)?;
            Some(self.verifier.verify(&download_url).await?)
        } else {
            log::warn!(
                "[{}] package verification disabled, skipping checksum",
                self.config.unit_id
            );
            None
        };

        let backup_path = self.backups.backup_current()?;

        Ok(PreparedUpdate {
            metadata: update.metadata.clone(),
            download_url,
            checksum,
            backup_path,
        })
    }

    /// Roll the install directory back to `archive`.
    ///
    /// # Errors
    /// Returns [`UpdateError::Busy`] while an update is being prepared, or the
    /// backup error from extraction.
    pub async fn restore_backup(&self, archive: &Path) -> Result<usize, UpdateError> {
        let _guard = self.apply_lock.lock().await;
        let _lock = UnitLock::acquire(self.backups.backup_dir(), &self.config.unit_id)?;

        let result = self.backups.restore(archive).map_err(UpdateError::from);
        match &result {
            Ok(files) => {
                self.status
                    .record_success(format!("Restored {files} files from backup"));
                self.log.info(
                    "Backup restored",
                    &[("archive", archive.display().to_string())],
                );
            }
            Err(error) => {
                self.status.record_error(error.to_string());
                self.log.error(
                    "Backup restore failed",
                    &[
                        ("archive", archive.display().to_string()),
                        ("error", error.to_string()),
                    ],
                );
            }
        }
        result
    }

    /// Existing backups for this unit, newest first.
    ///
    /// # Errors
    /// Returns a backup error if the backup directory cannot be read.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, UpdateError> {
        Ok(self.backups.list()?)
    }

    /// Drop cached metadata and cached failures for this unit, so the next
    /// check goes to the server. Returns the number of entries removed.
    pub fn clear_cache(&self) -> usize {
        let removed = self
            .cache
            .remove_prefix(&unit_key(&self.config.unit_id, "info", ""));
        log::debug!("[{}] cleared {removed} cached entries", self.config.unit_id);
        removed
    }

    fn gate(&self, endpoint: &str) -> Result<(), UpdateError> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        limiter.allow(endpoint).map_err(|limited| {
            self.log.warning(
                "Rate limit reached",
                &[
                    ("endpoint", endpoint.to_string()),
                    ("retry_after_secs", limited.retry_after_secs.to_string()),
                ],
            );
            UpdateError::from(limited)
        })
    }

    fn transition(&self, from: CheckState, to: CheckState) {
        log::debug!("[{}] update check {from} -> {to}", self.config.unit_id);
    }
}
