//! Configuration management for edgeacl.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::AclError;

/// Environment variable overriding `control_plane.secret`.
pub const SECRET_ENV: &str = "EDGEACL_NODE_SECRET";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/edgeacl/config.yaml";

/// Secure string type that zeroizes memory on drop
/// Used for sensitive data like tokens and passwords
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecureString(String);

impl SecureString {
    pub fn new(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecureString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<&str> for SecureString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where ACL items and actions come from
    pub control_plane: ControlPlaneConfig,

    /// Polling behaviour
    pub sync: SyncConfig,

    /// Local item store (JSON)
    pub state_file: PathBuf,

    /// Lock file guarding against a second daemon
    pub lock_file: PathBuf,

    /// Hard timeout for every external command
    pub command_timeout_secs: u64,

    /// TCP rate limiting on nftables
    pub ddos: DdosConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_plane: ControlPlaneConfig::default(),
            sync: SyncConfig::default(),
            state_file: PathBuf::from("/var/lib/edgeacl/items.json"),
            lock_file: PathBuf::from("/var/run/edgeacl.lock"),
            command_timeout_secs: 10,
            ddos: DdosConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Base URL, e.g. `https://cp.example.com/api/v1`
    pub endpoint: String,
    pub node_id: String,
    /// Node secret; can also come from the EDGEACL_NODE_SECRET env var
    pub secret: SecureString,
    pub timeout_secs: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            node_id: String::new(),
            secret: SecureString::default(),
            timeout_secs: 30,
        }
    }
}

impl ControlPlaneConfig {
    /// Get the effective secret, checking the env var first.
    /// Returns a SecureString that will be zeroed when dropped
    pub fn get_secret(&self) -> SecureString {
        if let Ok(val) = env::var(SECRET_ENV) {
            return SecureString::new(val);
        }
        self.secret.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    /// Items requested per page
    pub page_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            page_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DdosConfig {
    pub enabled: bool,
    pub tcp: TcpConfig,
    /// Addresses or CIDRs exempt from rate limiting
    pub allow_ips: Vec<String>,
}

/// Rate-limit options. Unset values take built-in defaults; zero disables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub ports: Vec<u16>,
    pub max_connections: Option<u64>,
    pub max_connections_per_ip: Option<u64>,
    pub new_connections_minutely_rate: Option<u64>,
    pub new_connections_minutely_block_secs: Option<u64>,
    pub new_connections_secondly_rate: Option<u64>,
    pub new_connections_secondly_block_secs: Option<u64>,
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let cp = &self.control_plane;
        if cp.endpoint.is_empty() {
            return Err(AclError::Config("control_plane.endpoint is required".to_string()).into());
        }
        // Node secrets travel in headers; never send them in clear text
        // except to a local endpoint.
        let local = cp.endpoint.starts_with("http://127.0.0.1")
            || cp.endpoint.starts_with("http://localhost");
        if !cp.endpoint.starts_with("https://") && !local {
            return Err(AclError::Config(format!(
                "control_plane.endpoint must use HTTPS: {}",
                cp.endpoint
            ))
            .into());
        }
        if cp.node_id.is_empty() {
            return Err(AclError::Config("control_plane.node_id is required".to_string()).into());
        }
        if cp.timeout_secs == 0 {
            return Err(AclError::Config("control_plane.timeout_secs must be > 0".to_string()).into());
        }
        if self.sync.interval_secs == 0 {
            return Err(AclError::Config("sync.interval_secs must be > 0".to_string()).into());
        }
        if self.sync.page_size == 0 {
            return Err(AclError::Config("sync.page_size must be > 0".to_string()).into());
        }
        if self.command_timeout_secs == 0 {
            return Err(AclError::Config("command_timeout_secs must be > 0".to_string()).into());
        }
        if self.ddos.tcp.ports.contains(&0) {
            return Err(AclError::Config("ddos.tcp.ports must not contain 0".to_string()).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            control_plane: ControlPlaneConfig {
                endpoint: "https://cp.example.com/api".to_string(),
                node_id: "edge-01".to_string(),
                secret: "s3cret".into(),
                timeout_secs: 30,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sync.interval_secs, 10);
        assert_eq!(config.command_timeout_secs, 10);
        assert!(!config.ddos.enabled);
        // No endpoint configured yet
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_config_validation_http_endpoint_rejected() {
        let mut config = valid();
        config.control_plane.endpoint = "http://cp.example.com".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("HTTPS"));

        config.control_plane.endpoint = "http://127.0.0.1:8080".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_values() {
        let mut config = valid();
        config.sync.page_size = 0;
        assert!(config.validate().unwrap_err().to_string().contains("page_size"));

        let mut config = valid();
        config.ddos.tcp.ports = vec![80, 0];
        assert!(config.validate().unwrap_err().to_string().contains("ports"));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
control_plane:
  endpoint: https://cp.example.com/api
  node_id: edge-01
  secret: abc
sync:
  interval_secs: 5
ddos:
  enabled: true
  tcp:
    ports: [443]
    max_connections_per_ip: 0
  allow_ips:
    - 10.0.0.0/8
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.interval_secs, 5);
        assert_eq!(config.sync.page_size, 1000);
        assert_eq!(config.ddos.tcp.ports, vec![443]);
        assert_eq!(config.ddos.tcp.max_connections_per_ip, Some(0));
        assert_eq!(config.ddos.tcp.max_connections, None);
        assert_eq!(config.ddos.allow_ips, vec!["10.0.0.0/8"]);
        assert_eq!(config.control_plane.secret.as_str(), "abc");
    }

    #[test]
    fn test_secure_string_debug_redacted() {
        let secret = SecureString::new("my-secret-token".to_string());
        let debug = format!("{:?}", secret);
        assert_eq!(debug, "[REDACTED]");
        assert!(!format!("{:?}", valid()).contains("s3cret"));
    }

    #[test]
    fn test_secure_string_default_empty() {
        assert!(SecureString::default().is_empty());
    }
}
