use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::version::is_valid_version;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("configuration field `{0}` must not be empty")]
    EmptyField(&'static str),
    #[error("unit identifier '{0}' may only contain lowercase letters, digits, '-' and '_'")]
    InvalidUnitId(String),
    #[error("current version '{0}' is not a valid dotted version")]
    InvalidVersion(String),
    #[error("server URL '{0}' could not be parsed")]
    InvalidServerUrl(String),
    #[error("server URL '{0}' must use https (plain http is only allowed in test mode)")]
    InsecureServerUrl(String),
    #[error("rate limiting needs a non-zero request count and window")]
    InvalidRateLimit,
    #[error("backup directory {0} must not live inside the install directory")]
    BackupInsideInstall(PathBuf),
    #[error("failed to resolve default directories: {0}")]
    Paths(#[from] updraft_platform::AppPathsError),
}

/// Immutable configuration for one update unit.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_url: String,

    pub unit_id: String,

    pub current_version: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub test_mode: bool,

    pub install_dir: PathBuf,

    /// Root for backups; each unit archives into its own subdirectory.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,

    #[serde(default)]
    pub host: HostInfo,

    #[serde(default)]
    pub requirements: UnitRequirements,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    #[serde(default)]
    pub options: UpdateOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    #[serde(default = "default_host_name")]
    pub name: String,

    #[serde(default = "default_host_version")]
    pub version: String,

    /// Version of the runtime the host executes units on. Hosts report it;
    /// when absent, a unit's `min_runtime_version` cannot be satisfied.
    #[serde(default)]
    pub runtime_version: Option<String>,
}

/// Minimum host/runtime versions this unit needs, checked by the health
/// monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRequirements {
    #[serde(default)]
    pub min_host_version: Option<String>,

    #[serde(default)]
    pub min_runtime_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct UpdateOptions {
    #[serde(default = "default_true")]
    pub verify_packages: bool,

    #[serde(default = "default_true")]
    pub enable_logging: bool,

    #[serde(default = "default_true")]
    pub health_monitoring: bool,

    /// `None` (JSON `null`) disables the request gate.
    #[serde(default = "default_rate_limiting")]
    pub rate_limiting: Option<RateLimitSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,

    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

impl RateLimitSettings {
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

fn default_true() -> bool {
    true
}

fn default_http_timeout() -> u64 {
    15
}

fn default_requests_per_window() -> u32 {
    30
}

fn default_window_seconds() -> u64 {
    60
}

#[allow(clippy::unnecessary_wraps)]
fn default_rate_limiting() -> Option<RateLimitSettings> {
    Some(RateLimitSettings::default())
}

fn default_host_name() -> String {
    "updraft".to_string()
}

fn default_host_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            window_seconds: default_window_seconds(),
        }
    }
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            verify_packages: true,
            enable_logging: true,
            health_monitoring: true,
            rate_limiting: default_rate_limiting(),
        }
    }
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            name: default_host_name(),
            version: default_host_version(),
            runtime_version: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_url", &self.server_url)
            .field("unit_id", &self.unit_id)
            .field("current_version", &self.current_version)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("test_mode", &self.test_mode)
            .field("install_dir", &self.install_dir)
            .field("backup_dir", &self.backup_dir)
            .field("host", &self.host)
            .field("requirements", &self.requirements)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("options", &self.options)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(
        server_url: impl Into<String>,
        unit_id: impl Into<String>,
        current_version: impl Into<String>,
        install_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            unit_id: unit_id.into(),
            current_version: current_version.into(),
            api_key: None,
            test_mode: false,
            install_dir: install_dir.into(),
            backup_dir: None,
            host: HostInfo::default(),
            requirements: UnitRequirements::default(),
            http_timeout_secs: default_http_timeout(),
            options: UpdateOptions::default(),
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    #[must_use]
    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    #[must_use]
    pub fn with_backup_dir(mut self, backup_dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(backup_dir.into());
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: HostInfo) -> Self {
        self.host = host;
        self
    }

    #[must_use]
    pub fn with_requirements(mut self, requirements: UnitRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: UpdateOptions) -> Self {
        self.options = options;
        self
    }

    /// The server URL without a trailing slash.
    #[must_use]
    pub fn server_base(&self) -> &str {
        self.server_url.trim().trim_end_matches('/')
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    #[must_use]
    pub fn user_agent(&self) -> String {
        format!(
            "updraft/{} ({}/{})",
            env!("CARGO_PKG_VERSION"),
            self.host.name,
            self.host.version
        )
    }

    /// Check the invariants every pipeline relies on.
    ///
    /// # Errors
    /// Returns the first violated constraint: empty or malformed unit id,
    /// invalid current version, a non-https server URL outside test mode,
    /// zero rate-limit settings, or a backup directory nested in the install
    /// directory.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.unit_id.is_empty() {
            return Err(ConfigError::EmptyField("unit_id"));
        }
        if !is_valid_unit_id(&self.unit_id) {
            return Err(ConfigError::InvalidUnitId(self.unit_id.clone()));
        }
        if !is_valid_version(&self.current_version) {
            return Err(ConfigError::InvalidVersion(self.current_version.clone()));
        }
        if self.server_base().is_empty() {
            return Err(ConfigError::EmptyField("server_url"));
        }
        self.validate_server_url()?;

        if let Some(limits) = &self.options.rate_limiting
            && (limits.requests_per_window == 0 || limits.window_seconds == 0)
        {
            return Err(ConfigError::InvalidRateLimit);
        }

        if self.install_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyField("install_dir"));
        }
        if let Some(backup_dir) = &self.backup_dir
            && is_nested(backup_dir, &self.install_dir)
        {
            return Err(ConfigError::BackupInsideInstall(backup_dir.clone()));
        }

        Ok(())
    }

    fn validate_server_url(&self) -> Result<(), ConfigError> {
        let url = reqwest::Url::parse(self.server_base())
            .map_err(|_| ConfigError::InvalidServerUrl(self.server_url.clone()))?;
        match url.scheme() {
            "https" => Ok(()),
            "http" if self.test_mode => Ok(()),
            "http" => Err(ConfigError::InsecureServerUrl(self.server_url.clone())),
            _ => Err(ConfigError::InvalidServerUrl(self.server_url.clone())),
        }
    }
}

fn is_valid_unit_id(unit_id: &str) -> bool {
    unit_id
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
}

fn is_nested(candidate: &Path, parent: &Path) -> bool {
    candidate.starts_with(parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::new(
            "https://updates.example.com/api/",
            "acme-widget",
            "1.0.0",
            "/opt/acme-widget",
        )
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = config();
        assert!(config.options.verify_packages);
        assert!(config.options.enable_logging);
        assert!(config.options.health_monitoring);
        assert_eq!(
            config.options.rate_limiting,
            Some(RateLimitSettings {
                requests_per_window: 30,
                window_seconds: 60,
            })
        );
        assert_eq!(config.http_timeout(), Duration::from_secs(15));
        assert_eq!(config.server_base(), "https://updates.example.com/api");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserializes_with_defaults_and_null_rate_limit() {
        let config: ClientConfig = serde_json::from_str(
            r#"{
                "server_url": "https://updates.example.com",
                "unit_id": "acme",
                "current_version": "2.1",
                "install_dir": "/srv/acme",
                "options": { "verify_packages": false, "rate_limiting": null }
            }"#,
        )
        .expect("config should deserialize");

        assert!(!config.options.verify_packages);
        assert!(config.options.enable_logging);
        assert_eq!(config.options.rate_limiting, None);
        assert_eq!(config.http_timeout_secs, 15);
        assert_eq!(config.host.name, "updraft");
        assert!(config.api_key.is_none());
    }

    #[test]
    fn debug_output_redacts_api_key() {
        let config = config().with_api_key("super-secret-token");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret-token"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn rejects_plain_http_outside_test_mode() {
        let mut config = config();
        config.server_url = "http://updates.example.com".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InsecureServerUrl(_))
        ));

        let config = config.with_test_mode(true);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_malformed_fields() {
        let mut bad_unit = config();
        bad_unit.unit_id = "Acme Widget".to_string();
        assert!(matches!(
            bad_unit.validate(),
            Err(ConfigError::InvalidUnitId(_))
        ));

        let mut bad_version = config();
        bad_version.current_version = "one".to_string();
        assert!(matches!(
            bad_version.validate(),
            Err(ConfigError::InvalidVersion(_))
        ));

        let mut bad_scheme = config();
        bad_scheme.server_url = "ftp://updates.example.com".to_string();
        assert!(matches!(
            bad_scheme.validate(),
            Err(ConfigError::InvalidServerUrl(_))
        ));

        let mut zero_limit = config();
        zero_limit.options.rate_limiting = Some(RateLimitSettings {
            requests_per_window: 0,
            window_seconds: 60,
        });
        assert_eq!(zero_limit.validate(), Err(ConfigError::InvalidRateLimit));
    }

    #[test]
    fn rejects_backup_dir_inside_install_dir() {
        let config = config().with_backup_dir("/opt/acme-widget/backups");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BackupInsideInstall(_))
        ));
    }
}
