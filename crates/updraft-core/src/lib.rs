//! Self-update pipeline for independently versioned units.
//!
//! One [`UpdateClient`] per unit wires together:
//! - A fixed-window rate limiter and a TTL cache store shared by all units.
//! - Metadata fetching with positive and negative caching and sanitization.
//! - Version comparison, checksum-verified downloads, and zip backups with
//!   restore.
//! - Health checks and a short-lived last-status record for host display.
//!
//! The HTTP client is the [`Transport`] seam; [`ReqwestTransport`] is the
//! production implementation.

mod api;
mod backup;
mod cache;
mod client;
mod clock;
mod config;
mod error;
mod health;
mod lock;
mod log_sink;
mod metadata;
mod rate_limit;
mod sanitize;
mod status;
mod transport;
mod verify;
mod version;

#[cfg(test)]
pub(crate) mod test_support;

/// Request builders for the update server endpoints.
pub use api::ServerApi;
/// Install-directory snapshots and rollback.
pub use backup::{BackupError, BackupInfo, BackupManager};
/// Process-wide TTL store used for metadata, failures, counters and status.
pub use cache::{CacheEntry, CacheStore, CacheValue, unit_key};
/// The per-unit orchestrator and its results.
pub use client::{
    AvailableUpdate, CheckState, ENDPOINT_CONNECTION_TEST, ENDPOINT_PACKAGE_VERIFY,
    ENDPOINT_PLUGIN_INFORMATION, ENDPOINT_UPDATE_CHECK, PreparedUpdate, UpdateCheckResult,
    UpdateClient, UpdateClientBuilder,
};
pub use clock::{Clock, ManualClock, SystemClock};
/// Unit configuration and its validation errors.
pub use config::{
    ClientConfig, ConfigError, HostInfo, RateLimitSettings, UnitRequirements, UpdateOptions,
};
pub use error::{ErrorKind, UpdateError};
/// Environment and connectivity checks.
pub use health::{
    CHECK_HOST_VERSION, CHECK_RUNTIME_VERSION, CHECK_SERVER_CONNECTION, CHECK_TLS_SUPPORT,
    CHECK_WRITE_PERMISSIONS, ConnectionResult, HealthCheck, HealthMonitor, HealthReport,
    HealthStatus, probe_connection,
};
pub use lock::UnitLock;
/// Structured per-unit activity log.
pub use log_sink::{LOG_CAPACITY, LogEntry, LogLevel, LogSink, MemoryLogSink, UnitLog};
/// Remote metadata model and cached fetcher.
pub use metadata::{
    FAILURE_TTL, FetchError, METADATA_TTL, MetadataFetcher, RemoteMetadata, RemoteRequirements,
    Sections,
};
pub use rate_limit::{RateLimited, RateLimiter, RateWindow};
pub use sanitize::{sanitize_html, sanitize_text, sanitize_url};
pub use status::{STATUS_TTL, StatusKind, StatusReporter, UpdateStatus};
/// HTTP seam and its reqwest implementation.
pub use transport::{
    DownloadOutcome, HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError,
};
/// Artifact download and SHA-256 verification.
pub use verify::{PackageVerifier, VerifyError, sha256_file};
/// Dotted-numeric version ordering.
pub use version::{compare_versions, is_newer_version, is_valid_version, meets_minimum};
