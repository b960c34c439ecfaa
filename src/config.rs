//! Cluster configuration
//!
//! A [`ClusterConfig`] is an immutable snapshot once handed to a
//! [`Cluster`](crate::Cluster). It can be built in code with
//! [`ClusterConfig::builder`], parsed from TOML, or loaded from a file.
//!
//! ## Environment Variables
//!
//! [`ClusterConfig::load`] applies these overrides after reading the file:
//!
//! - `CQLWIRE_CONTACT_POINTS` - comma separated host list
//! - `CQLWIRE_PORT` - native protocol port
//! - `CQLWIRE_PROTOCOL_VERSION` - highest protocol version to try
//! - `CQLWIRE_KEYSPACE` - keyspace every connection switches to
//!
//! These can be set in a `.env` file next to the configuration file.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::protocol::types::{Consistency, DEFAULT_CQL_VERSION, MIN_SUPPORTED_VERSION};
use crate::error::{DriverError, DriverResult};

pub const DEFAULT_PORT: u16 = 9042;
pub const DEFAULT_PROTOCOL_VERSION: u8 = 4;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 12_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_ORPHAN_GRACE_MS: u64 = 30_000;

pub const ENV_CONTACT_POINTS: &str = "CQLWIRE_CONTACT_POINTS";
pub const ENV_PORT: &str = "CQLWIRE_PORT";
pub const ENV_PROTOCOL_VERSION: &str = "CQLWIRE_PROTOCOL_VERSION";
pub const ENV_KEYSPACE: &str = "CQLWIRE_KEYSPACE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Hosts tried in order when opening a session
    pub contact_points: Vec<String>,
    pub port: u16,
    /// Highest protocol version to attempt
    pub protocol_version: u8,
    /// Default per-request timeout
    #[serde(alias = "session_timeout_ms")]
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Connections opened per reachable host
    pub connections_per_host: usize,
    pub keyspace: Option<String>,
    pub cql_version: String,
    /// How long an abandoned stream id is held before reuse
    pub orphan_grace_ms: u64,
    pub consistency: Consistency,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            contact_points: vec!["127.0.0.1".to_string()],
            port: DEFAULT_PORT,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            connections_per_host: 1,
            keyspace: None,
            cql_version: DEFAULT_CQL_VERSION.to_string(),
            orphan_grace_ms: DEFAULT_ORPHAN_GRACE_MS,
            consistency: Consistency::default(),
        }
    }
}

impl ClusterConfig {
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::new()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_millis(self.orphan_grace_ms)
    }

    /// `host:port` for every contact point, in order. A contact point that
    /// already carries a port keeps it.
    pub fn addresses(&self) -> Vec<String> {
        self.contact_points
            .iter()
            .map(|host| with_port(host.trim(), self.port))
            .collect()
    }

    pub fn validate(&self) -> DriverResult<()> {
        if self.contact_points.is_empty()
            || self.contact_points.iter().any(|h| h.trim().is_empty())
        {
            return Err(DriverError::InvalidConfig(
                "At least one non-empty contact point is required".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(DriverError::InvalidConfig("Port must be non-zero".to_string()));
        }
        if self.protocol_version < MIN_SUPPORTED_VERSION {
            return Err(DriverError::InvalidConfig(format!(
                "Protocol version must be at least {}",
                MIN_SUPPORTED_VERSION
            )));
        }
        if self.connections_per_host == 0 {
            return Err(DriverError::InvalidConfig(
                "connections_per_host must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(DriverError::InvalidConfig("Timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> DriverResult<Self> {
        let config: ClusterConfig =
            toml::from_str(content).map_err(|e| DriverError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> DriverResult<String> {
        toml::to_string_pretty(self).map_err(|e| DriverError::InvalidConfig(e.to_string()))
    }

    /// Load a TOML file, honouring a `.env` file in the same directory and
    /// `CQLWIRE_*` environment overrides.
    pub fn load(path: &Path) -> DriverResult<Self> {
        if let Some(dir) = path.parent() {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
            }
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            DriverError::InvalidConfig(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let mut config: ClusterConfig =
            toml::from_str(&content).map_err(|e| DriverError::InvalidConfig(e.to_string()))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Empty or unparsable values are
    /// ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(hosts) = lookup(ENV_CONTACT_POINTS) {
            let hosts: Vec<String> = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect();
            if !hosts.is_empty() {
                self.contact_points = hosts;
            }
        }

        if let Some(port) = lookup(ENV_PORT).and_then(|p| p.trim().parse::<u16>().ok()) {
            self.port = port;
        }

        if let Some(version) =
            lookup(ENV_PROTOCOL_VERSION).and_then(|v| v.trim().parse::<u8>().ok())
        {
            self.protocol_version = version;
        }

        if let Some(keyspace) = lookup(ENV_KEYSPACE) {
            if !keyspace.is_empty() {
                self.keyspace = Some(keyspace);
            }
        }
    }
}

fn with_port(host: &str, port: u16) -> String {
    if host.parse::<SocketAddr>().is_ok() {
        return host.to_string();
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return SocketAddr::new(ip, port).to_string();
    }
    match host.rsplit_once(':') {
        Some((name, p)) if !name.contains(':') && p.parse::<u16>().is_ok() => host.to_string(),
        _ => format!("{}:{}", host, port),
    }
}

/// Builds a [`ClusterConfig`] from a fresh copy of the defaults.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClusterConfig::default(),
        }
    }

    pub fn contact_points<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.contact_points = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn protocol_version(mut self, version: u8) -> Self {
        self.config.protocol_version = version;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connections_per_host(mut self, count: usize) -> Self {
        self.config.connections_per_host = count;
        self
    }

    pub fn keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.config.keyspace = Some(keyspace.into());
        self
    }

    pub fn cql_version(mut self, version: impl Into<String>) -> Self {
        self.config.cql_version = version.into();
        self
    }

    pub fn orphan_grace(mut self, grace: Duration) -> Self {
        self.config.orphan_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.config.consistency = consistency;
        self
    }

    pub fn build(self) -> DriverResult<ClusterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
