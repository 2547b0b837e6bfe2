// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Relay configuration.
//!
//! Sources are layered with figment, lowest priority first:
//! 1. Defaults ([`Config::default`])
//! 2. YAML file (`relay.yaml` in the config directory, or `RELAY_CONFIG`)
//! 3. Environment variables prefixed `RELAY_`, nested keys separated by `__`
//!    (e.g. `RELAY_STORAGE__MAX_TOTAL_BYTES=1073741824`)
//!
//! Global settings that make the relay unusable fail [`Config::validate`]. A broken
//! destination only disables itself: [`DestinationSet::resolve`] records the reason and
//! every other destination keeps forwarding.

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::ConfigError;
use crate::protocol::Protocol;

pub const CONFIG_FILE_NAME: &str = "relay.yaml";
pub const ENV_PREFIX: &str = "RELAY_";
pub const ENV_CONFIG_PATH: &str = "RELAY_CONFIG";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const MAX_ZSTD_LEVEL: i32 = 22;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding partitions and the catalog.
    pub data_dir: PathBuf,
    /// Address of the ingestion/status HTTP surface.
    pub listen_address: String,
    pub log_level: String,
    /// Largest payload accepted by the ingestion API, in bytes.
    pub max_payload_bytes: usize,
    /// How long shutdown waits for in-flight HTTP requests, in seconds.
    pub shutdown_grace_secs: u64,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub connectivity: ConnectivityConfig,
    pub destinations: Vec<DestinationConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/telemetry-relay"),
            listen_address: "127.0.0.1:8280".to_string(),
            log_level: "info".to_string(),
            max_payload_bytes: 256 * 1024,
            shutdown_grace_secs: 10,
            storage: StorageConfig::default(),
            retention: RetentionConfig::default(),
            connectivity: ConnectivityConfig::default(),
            destinations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Hard cap on the bytes of all segment files together.
    pub max_total_bytes: u64,
    /// Fraction of the cap above which fully-forwarded segments are evicted early.
    pub eviction_watermark: f64,
    /// The open segment rotates once it reaches this many bytes...
    pub segment_max_bytes: u64,
    /// ...or once its first record is this old, whichever comes first.
    pub segment_max_age_secs: u64,
    /// zstd level for closed segments.
    pub compression_level: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_total_bytes: 1024 * 1024 * 1024,
            eviction_watermark: 0.9,
            segment_max_bytes: 8 * 1024 * 1024,
            segment_max_age_secs: 24 * 60 * 60,
            compression_level: 3,
        }
    }
}

impl StorageConfig {
    pub fn segment_max_age(&self) -> Duration {
        Duration::from_secs(self.segment_max_age_secs)
    }

    /// Usage above which the sweeper starts evicting fully-forwarded segments.
    pub fn soft_limit_bytes(&self) -> u64 {
        (self.max_total_bytes as f64 * self.eviction_watermark) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub default_secs: u64,
    pub per_protocol: HashMap<Protocol, u64>,
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            default_secs: 7 * 24 * 60 * 60,
            per_protocol: HashMap::new(),
            sweep_interval_secs: 30,
        }
    }
}

impl RetentionConfig {
    pub fn window(&self, protocol: Protocol) -> Duration {
        Duration::from_secs(
            self.per_protocol
                .get(&protocol)
                .copied()
                .unwrap_or(self.default_secs),
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Consecutive failed probes before a path goes DOWN.
    pub failure_threshold: u32,
    /// Consecutive successful probes before a DOWN path comes back.
    pub success_threshold: u32,
    /// Probe latency above which an otherwise healthy path reports DEGRADED.
    pub degraded_latency_ms: u64,
    pub paths: Vec<PathConfig>,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            probe_timeout_ms: 2_000,
            failure_threshold: 3,
            success_threshold: 3,
            degraded_latency_ms: 500,
            paths: Vec::new(),
        }
    }
}

impl ConnectivityConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// A network path (typically the tunnel) whose liveness gates forwarding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConfig {
    pub name: String,
    /// `host:port` reached with a TCP connect on every probe.
    pub probe_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// One UDP datagram per record, original bytes unchanged.
    Datagram,
    /// Batched HTTP POST, acknowledged by the response status.
    RequestResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 200,
            backoff_cap_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the delay before retry number `attempt` (1-based):
    /// `base * 2^(attempt-1)`, never above the cap.
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_cap_ms);
        Duration::from_millis(delay)
    }

    /// Equal jitter: half of the ceiling is fixed, the other half random.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt).as_millis() as u64;
        let half = ceiling / 2;
        Duration::from_millis(half + fastrand::u64(0..=ceiling - half))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    pub name: String,
    pub protocols: Vec<Protocol>,
    pub transport: TransportKind,
    /// `host:port` for datagram, an http(s) URL for request/response.
    pub address: String,
    pub auth_token: Option<String>,
    pub enabled: bool,
    /// Connectivity path gating this destination. None means always attempt.
    pub path: Option<String>,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub send_timeout_ms: u64,
    /// zstd level for request bodies, 0 disables compression.
    pub compression_level: i32,
    pub retry: RetryPolicy,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            protocols: Vec::new(),
            transport: TransportKind::RequestResponse,
            address: String::new(),
            auth_token: None,
            enabled: true,
            path: None,
            batch_size: 500,
            batch_timeout_ms: 1_000,
            send_timeout_ms: 5_000,
            compression_level: 0,
            retry: RetryPolicy::default(),
        }
    }
}

impl DestinationConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn accepts(&self, protocol: Protocol) -> bool {
        self.protocols.contains(&protocol)
    }

    fn validate(&self, known_paths: &HashSet<&str>) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::Destination {
            name: self.name.clone(),
            reason,
        };

        // Catalog keys use NUL as separator.
        if self.name.contains('\0') {
            return Err(invalid("name must not contain NUL bytes".to_string()));
        }
        if self.protocols.is_empty() {
            return Err(invalid("no protocol bindings".to_string()));
        }
        match self.transport {
            TransportKind::Datagram => {
                if !is_host_port(&self.address) {
                    return Err(invalid(format!(
                        "datagram address '{}' is not host:port",
                        self.address
                    )));
                }
            }
            TransportKind::RequestResponse => {
                let url = reqwest::Url::parse(&self.address)
                    .map_err(|e| invalid(format!("invalid URL '{}': {e}", self.address)))?;
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(invalid(format!(
                        "request/response address must be http(s), got '{}'",
                        url.scheme()
                    )));
                }
            }
        }
        if let Some(path) = &self.path {
            if !known_paths.contains(path.as_str()) {
                return Err(invalid(format!("unknown connectivity path '{path}'")));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1".to_string()));
        }
        if self.retry.backoff_base_ms > self.retry.backoff_cap_ms {
            return Err(invalid(
                "retry.backoff_base_ms must not exceed retry.backoff_cap_ms".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be at least 1".to_string()));
        }
        if self.send_timeout_ms == 0 {
            return Err(invalid("send_timeout_ms must be greater than 0".to_string()));
        }
        if !(0..=MAX_ZSTD_LEVEL).contains(&self.compression_level) {
            return Err(invalid(format!(
                "compression_level must be between 0 and {MAX_ZSTD_LEVEL}"
            )));
        }
        Ok(())
    }
}

fn is_host_port(address: &str) -> bool {
    if address.parse::<SocketAddr>().is_ok() {
        return true;
    }
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

impl Config {
    /// Loads defaults, the optional YAML file and `RELAY_` environment overrides, then
    /// validates the result.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__").ignore(&["config"]))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// `RELAY_CONFIG` when set, otherwise `relay.yaml` inside `config_directory`.
    pub fn path_from_env(config_directory: &Path) -> PathBuf {
        std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_directory.join(CONFIG_FILE_NAME))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_address.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "listen_address '{}' is not a socket address",
                self.listen_address
            )));
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_payload_bytes must be greater than 0".to_string(),
            ));
        }

        let storage = &self.storage;
        if storage.max_total_bytes == 0 || storage.segment_max_bytes == 0 {
            return Err(ConfigError::Invalid(
                "storage.max_total_bytes and storage.segment_max_bytes must be greater than 0"
                    .to_string(),
            ));
        }
        if !(storage.eviction_watermark > 0.0 && storage.eviction_watermark <= 1.0) {
            return Err(ConfigError::Invalid(
                "storage.eviction_watermark must be in (0, 1]".to_string(),
            ));
        }
        if !(1..=MAX_ZSTD_LEVEL).contains(&storage.compression_level) {
            return Err(ConfigError::Invalid(format!(
                "storage.compression_level must be between 1 and {MAX_ZSTD_LEVEL}"
            )));
        }
        if self.retention.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "retention.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }

        let connectivity = &self.connectivity;
        if connectivity.interval_ms == 0 || connectivity.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connectivity.interval_ms and connectivity.probe_timeout_ms must be greater than 0"
                    .to_string(),
            ));
        }
        if connectivity.failure_threshold == 0 || connectivity.success_threshold == 0 {
            return Err(ConfigError::Invalid(
                "connectivity thresholds must be at least 1".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for path in &connectivity.paths {
            if !seen.insert(path.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate connectivity path '{}'",
                    path.name
                )));
            }
            if !is_host_port(&path.probe_address) {
                return Err(ConfigError::Invalid(format!(
                    "probe_address '{}' of path '{}' is not host:port",
                    path.probe_address, path.name
                )));
            }
        }
        Ok(())
    }
}

/// A destination after validation. Misconfigured destinations stay listed (for status)
/// but never get workers.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDestination {
    pub config: DestinationConfig,
    pub disabled_reason: Option<String>,
}

impl ResolvedDestination {
    pub fn is_active(&self) -> bool {
        self.config.enabled && self.disabled_reason.is_none()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DestinationSet {
    entries: Vec<Arc<ResolvedDestination>>,
}

impl DestinationSet {
    pub fn resolve(destinations: &[DestinationConfig], paths: &[PathConfig]) -> Self {
        let known_paths: HashSet<&str> = paths.iter().map(|p| p.name.as_str()).collect();
        let mut names = HashSet::new();
        let mut entries = Vec::with_capacity(destinations.len());

        for destination in destinations {
            let outcome = if destination.name.trim().is_empty() {
                Err(ConfigError::Destination {
                    name: destination.name.clone(),
                    reason: "name must not be empty".to_string(),
                })
            } else if !names.insert(destination.name.as_str()) {
                Err(ConfigError::Destination {
                    name: destination.name.clone(),
                    reason: "duplicate destination name".to_string(),
                })
            } else {
                destination.validate(&known_paths)
            };

            let disabled_reason = match outcome {
                Ok(()) => None,
                Err(err) => {
                    warn!(destination = %destination.name, "Disabling destination: {err}");
                    Some(err.to_string())
                }
            };
            entries.push(Arc::new(ResolvedDestination {
                config: destination.clone(),
                disabled_reason,
            }));
        }

        Self { entries }
    }

    pub fn all(&self) -> &[Arc<ResolvedDestination>] {
        &self.entries
    }

    pub fn active(&self) -> impl Iterator<Item = &Arc<ResolvedDestination>> {
        self.entries.iter().filter(|d| d.is_active())
    }

    /// Names of the active destinations that forward `protocol`.
    pub fn consumers(&self, protocol: Protocol) -> Vec<&str> {
        self.active()
            .filter(|d| d.config.accepts(protocol))
            .map(|d| d.name())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ResolvedDestination>> {
        self.entries.iter().find(|d| d.name() == name)
    }
}
