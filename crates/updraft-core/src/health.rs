use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::ServerApi;
use crate::clock::Clock;
use crate::config::{HostInfo, UnitRequirements};
use crate::transport::Transport;
use crate::version::{is_valid_version, meets_minimum};

pub const CHECK_HOST_VERSION: &str = "host_version";
pub const CHECK_RUNTIME_VERSION: &str = "runtime_version";
pub const CHECK_TLS_SUPPORT: &str = "tls_support";
pub const CHECK_WRITE_PERMISSIONS: &str = "write_permissions";
pub const CHECK_SERVER_CONNECTION: &str = "server_connection";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Good,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub checks: Vec<HealthCheck>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Critical as soon as any check fails.
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        if self.checks.iter().all(|check| check.passed) {
            HealthStatus::Good
        } else {
            HealthStatus::Critical
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Good
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|check| check.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionResult {
    pub connected: bool,
    pub status_code: Option<u16>,
    pub message: String,
    pub elapsed_ms: u64,
}

/// Request `{server}/connected` and describe the outcome. Only HTTP 200
/// counts as connected.
pub async fn probe_connection(api: &ServerApi, transport: &dyn Transport) -> ConnectionResult {
    let started = Instant::now();
    let outcome = transport.get(&api.connected_request()).await;
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match outcome {
        Ok(response) if response.status == 200 => ConnectionResult {
            connected: true,
            status_code: Some(200),
            message: format!("Connected to {}", api.base_url()),
            elapsed_ms,
        },
        Ok(response) => ConnectionResult {
            connected: false,
            status_code: Some(response.status),
            message: match response.status {
                401 | 403 => format!("Server rejected credentials (HTTP {})", response.status),
                status => format!("Server responded with HTTP {status}"),
            },
            elapsed_ms,
        },
        Err(error) => ConnectionResult {
            connected: false,
            status_code: None,
            message: error.to_string(),
            elapsed_ms,
        },
    }
}

/// Runs the fixed battery of environment and connectivity checks.
#[derive(Clone)]
pub struct HealthMonitor {
    api: Arc<ServerApi>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    host: HostInfo,
    requirements: UnitRequirements,
    install_dir: PathBuf,
}

impl HealthMonitor {
    pub fn new(
        api: Arc<ServerApi>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        host: HostInfo,
        requirements: UnitRequirements,
        install_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            api,
            transport,
            clock,
            host,
            requirements,
            install_dir: install_dir.into(),
        }
    }

    /// Every check runs regardless of earlier failures.
    pub async fn check_health(&self) -> HealthReport {
        let connection = probe_connection(&self.api, self.transport.as_ref()).await;

        let checks = vec![
            version_check(
                CHECK_HOST_VERSION,
                &self.host.name,
                Some(&self.host.version),
                self.requirements.min_host_version.as_deref(),
            ),
            version_check(
                CHECK_RUNTIME_VERSION,
                "runtime",
                self.host.runtime_version.as_deref(),
                self.requirements.min_runtime_version.as_deref(),
            ),
            self.tls_check(),
            self.write_check(),
            HealthCheck {
                name: CHECK_SERVER_CONNECTION.to_string(),
                passed: connection.connected,
                message: connection.message,
            },
        ];

        HealthReport {
            checks,
            checked_at: self.clock.now(),
        }
    }

    fn tls_check(&self) -> HealthCheck {
        let passed = self.transport.supports_tls();
        HealthCheck {
            name: CHECK_TLS_SUPPORT.to_string(),
            passed,
            message: if passed {
                "TLS with certificate verification is available".to_string()
            } else {
                "HTTP transport has no TLS support".to_string()
            },
        }
    }

    fn write_check(&self) -> HealthCheck {
        let result = tempfile::Builder::new()
            .prefix(".updraft-write-test")
            .tempfile_in(&self.install_dir);
        let (passed, message) = match result {
            Ok(_) => (
                true,
                format!("{} is writable", self.install_dir.display()),
            ),
            Err(error) => (
                false,
                format!("{} is not writable: {error}", self.install_dir.display()),
            ),
        };
        HealthCheck {
            name: CHECK_WRITE_PERMISSIONS.to_string(),
            passed,
            message,
        }
    }
}

fn version_check(
    name: &str,
    label: &str,
    actual: Option<&str>,
    minimum: Option<&str>,
) -> HealthCheck {
    let (passed, message) = match (minimum, actual) {
        (None, Some(actual)) => (true, format!("{label} {actual}, no minimum required")),
        (None, None) => (true, format!("{label} version not reported, no minimum required")),
        (Some(minimum), _) if !is_valid_version(minimum) => (
            false,
            format!("required {label} version '{minimum}' is not a valid version"),
        ),
        (Some(minimum), None) => (
            false,
            format!("{label} version not reported by the host, {minimum} is required"),
        ),
        (Some(minimum), Some(actual)) if meets_minimum(actual, minimum) => {
            (true, format!("{label} {actual} meets minimum {minimum}"))
        }
        (Some(minimum), Some(actual)) => (
            false,
            format!("{label} {actual} is older than required {minimum}"),
        ),
    };
    HealthCheck {
        name: name.to_string(),
        passed,
        message,
    }
}
