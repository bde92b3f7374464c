/// Typed server parameters consumed from the configuration layer
///
/// The declarative configuration framework parses and type-checks textual
/// parameters before they reach this crate; the structs here are the typed
/// form it hands over. Per-field syntax is checked in `validate()`, while
/// cross-field invariants (monitor credential pairing, length limits) are
/// re-checked by the registry because they involve more than one field.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

/// Default backend port
fn default_port() -> u16 {
    3306
}

/// Default backend protocol module name
fn default_protocol() -> String {
    "mariadb-backend".to_string()
}

fn default_rank() -> Rank {
    Rank::Primary
}

/// Routing priority of a server relative to others in the same service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    Primary,
    Secondary,
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rank::Primary => write!(f, "primary"),
            Rank::Secondary => write!(f, "secondary"),
        }
    }
}

/// SSL connection requirements towards a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    #[default]
    Disabled,
    Required,
}

/// SSL settings for backend connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslParams {
    #[serde(default)]
    pub mode: SslMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
    /// TLS protocol version selector, "MAX" meaning newest supported
    #[serde(default = "SslParams::default_version")]
    pub version: String,
    #[serde(default = "SslParams::default_verify_peer")]
    pub verify_peer_certificate: bool,
    #[serde(default = "SslParams::default_verify_depth")]
    pub cert_verify_depth: u32,
}

impl SslParams {
    fn default_version() -> String {
        "MAX".to_string()
    }

    fn default_verify_peer() -> bool {
        true
    }

    fn default_verify_depth() -> u32 {
        9
    }
}

impl Default for SslParams {
    fn default() -> Self {
        Self {
            mode: SslMode::Disabled,
            cert: None,
            key: None,
            ca_cert: None,
            version: Self::default_version(),
            verify_peer_certificate: Self::default_verify_peer(),
            cert_verify_depth: Self::default_verify_depth(),
        }
    }
}

/// Validated per-server parameters
///
/// Unknown keys are collected into `custom`: administrators may attach
/// arbitrary string parameters (weighting hints and the like) that reporting
/// code reads back verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerParams {
    /// Network address of the backend; mutually exclusive with `socket`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Unix socket path of the backend; mutually exclusive with `address`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Secondary administrative port, 0 meaning none
    #[serde(default)]
    pub extra_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_password: Option<String>,
    /// Idle connections kept per worker, 0 disabling pooling
    #[serde(default)]
    pub persistpoolmax: usize,
    /// Maximum idle age in seconds for a pooled connection, 0 disabling pooling
    #[serde(default)]
    pub persistmaxtime: u64,
    #[serde(default)]
    pub proxy_protocol: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<SslParams>,
    /// Textual `path:percentage[,path:percentage]...` disk usage limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_space_threshold: Option<String>,
    #[serde(default = "default_rank")]
    pub rank: Rank,
    #[serde(flatten)]
    pub custom: BTreeMap<String, String>,
}

impl Default for ServerParams {
    fn default() -> Self {
        Self {
            address: None,
            socket: None,
            port: default_port(),
            extra_port: 0,
            protocol: default_protocol(),
            monitor_user: None,
            monitor_password: None,
            persistpoolmax: 0,
            persistmaxtime: 0,
            proxy_protocol: false,
            ssl: None,
            disk_space_threshold: None,
            rank: default_rank(),
            custom: BTreeMap::new(),
        }
    }
}

impl ServerParams {
    /// Convenience constructor for a TCP backend
    pub fn with_address<S: Into<String>>(address: S, port: u16) -> Self {
        Self {
            address: Some(address.into()),
            port,
            ..Default::default()
        }
    }

    /// Validate per-field syntax
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.address, &self.socket) {
            (None, None) => {
                return Err(ConfigError::ValidationError(
                    "either address or socket must be defined".to_string(),
                ));
            }
            (Some(_), Some(_)) => {
                return Err(ConfigError::ValidationError(
                    "address and socket are mutually exclusive".to_string(),
                ));
            }
            _ => {}
        }

        if let Some(address) = &self.address {
            if address.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "address cannot be empty".to_string(),
                ));
            }
        }

        if self.protocol.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "protocol cannot be empty".to_string(),
            ));
        }

        if let Some(threshold) = &self.disk_space_threshold {
            parse_disk_space_threshold(threshold)?;
        }

        Ok(())
    }

    /// Address or socket path, whichever is configured
    pub fn target(&self) -> &str {
        self.address
            .as_deref()
            .or(self.socket.as_deref())
            .unwrap_or("")
    }
}

/// Disk usage limits per mount point, percentage of capacity in 1..=100
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiskSpaceLimits {
    limits: BTreeMap<String, u8>,
}

impl DiskSpaceLimits {
    pub fn get(&self, path: &str) -> Option<u8> {
        self.limits.get(path).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u8)> {
        self.limits.iter()
    }
}

/// Parse a `path:percentage[,path:percentage]...` disk space threshold
///
/// Paths must be absolute (or the `*` wildcard covering all mount points);
/// percentages must fall in 1..=100.
pub fn parse_disk_space_threshold(text: &str) -> Result<DiskSpaceLimits, ConfigError> {
    let mut limits = BTreeMap::new();

    for entry in text.split(',') {
        let entry = entry.trim();
        let (path, percentage) = entry.split_once(':').ok_or_else(|| {
            ConfigError::ParseError(format!(
                "invalid disk space threshold entry '{}', expected path:percentage",
                entry
            ))
        })?;

        let path = path.trim();
        if path != "*" && !path.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "disk space threshold path '{}' is not absolute",
                path
            )));
        }

        let percentage: u8 = percentage.trim().parse().map_err(|_| {
            ConfigError::ParseError(format!(
                "invalid disk space threshold percentage '{}'",
                percentage
            ))
        })?;
        if !(1..=100).contains(&percentage) {
            return Err(ConfigError::ValidationError(format!(
                "disk space threshold percentage {} outside 1..=100",
                percentage
            )));
        }

        limits.insert(path.to_string(), percentage);
    }

    Ok(DiskSpaceLimits { limits })
}

/// A registry definition file: one `[servers.<name>]` table per backend
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerParams>,
}

impl RegistryConfig {
    /// Load a registry definition from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: RegistryConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save the registry definition to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate every server definition
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one server must be defined".to_string(),
            ));
        }

        for (name, params) in &self.servers {
            if name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "server name cannot be empty".to_string(),
                ));
            }
            params
                .validate()
                .map_err(|e| ConfigError::ValidationError(format!("server '{}': {}", name, e)))?;
        }

        Ok(())
    }

    /// Create an example registry definition file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let mut servers = BTreeMap::new();
        for (i, addr) in ["10.0.1.10", "10.0.1.11", "10.0.1.12"].iter().enumerate() {
            let mut params = ServerParams::with_address(*addr, 3306);
            params.persistpoolmax = 10;
            params.persistmaxtime = 300;
            servers.insert(format!("db-{}", i + 1), params);
        }

        let config = RegistryConfig { servers };
        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
