use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub mod policy;

pub use policy::{Action, ParseActionError, PolicySet, RawPolicy, WildcardRule};

/// Errors produced while loading proxy or policy configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// On-disk syntax of a configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    /// Picks the syntax from the file extension; anything but `.json` is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
            _ => Format::Yaml,
        }
    }
}

pub(crate) fn read_file(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn deserialize<T: DeserializeOwned>(
    contents: &str,
    format: Format,
) -> Result<T, ConfigError> {
    match format {
        Format::Yaml => Ok(serde_yaml_ng::from_str(contents)?),
        Format::Json => Ok(serde_json::from_str(contents)?),
    }
}

/// Regolith proxy configuration.
///
/// Defines where the proxy listens, where the permission policy lives,
/// outbound timeouts and the optional metrics endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// List of addresses to listen on (e.g., "127.0.0.1:3128", "[::1]:3128")
    pub listen_addrs: Vec<String>,
    /// Path of the permission policy file (default: "perm.json")
    #[serde(default = "default_permissions")]
    pub permissions: PathBuf,
    /// Outbound timeout configuration
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Prometheus metrics configuration
    #[serde(default)]
    pub metrics: Metrics,
    /// Nameserver used for every outbound lookup instead of the system
    /// resolver (e.g., "127.0.0.1:53")
    #[serde(default, alias = "DNSResolver")]
    pub dns_resolver: Option<SocketAddr>,
}

fn default_permissions() -> PathBuf {
    PathBuf::from("perm.json")
}

/// Timeout settings for outbound operations (all values in seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Maximum time to establish a CONNECT tunnel to the origin (default: 10s)
    #[serde(default = "default_timeout")]
    pub connect: u64,
    /// Maximum time for a forwarded request, response body included (default: 10s)
    #[serde(default = "default_timeout")]
    pub request: u64,
}

fn default_timeout() -> u64 {
    10
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: default_timeout(),
            request: default_timeout(),
        }
    }
}

impl Timeouts {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request)
    }
}

/// Prometheus metrics server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Whether to enable metrics collection
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind metrics HTTP server (e.g., "127.0.0.1:9000")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

fn default_metrics_address() -> String {
    "127.0.0.1:9000".to_string()
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

impl Config {
    /// Loads and validates configuration from a YAML or JSON file.
    ///
    /// The syntax is picked from the extension, see [`Format::from_path`].
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use regolith_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::from_file(Path::new("config.yaml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = read_file(path)?;
        let config: Config = deserialize(&contents, Format::from_path(path))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from a YAML string without validating it.
    ///
    /// # Examples
    ///
    /// ```
    /// use regolith_config::Config;
    ///
    /// let yaml = r#"
    /// listen_addrs:
    ///   - "127.0.0.1:3128"
    /// permissions: "/etc/regolith/perm.json"
    /// "#;
    ///
    /// let config = Config::parse(yaml).unwrap();
    /// assert_eq!(config.listen_addrs[0], "127.0.0.1:3128");
    /// assert_eq!(config.timeouts.connect, 10);
    /// ```
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        deserialize(contents, Format::Yaml)
    }

    /// Checks the values serde cannot: listen addresses and timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addrs.is_empty() {
            return Err(ConfigError::Invalid(
                "listen_addrs must contain at least one address".to_string(),
            ));
        }
        for addr in &self.listen_addrs {
            addr.parse::<SocketAddr>().map_err(|e| {
                ConfigError::Invalid(format!("listen address {:?}: {}", addr, e))
            })?;
        }
        if self.timeouts.connect == 0 || self.timeouts.request == 0 {
            return Err(ConfigError::Invalid(
                "timeouts must be at least one second".to_string(),
            ));
        }
        if self.metrics.enabled {
            self.metrics.address.parse::<SocketAddr>().map_err(|e| {
                ConfigError::Invalid(format!(
                    "metrics address {:?}: {}",
                    self.metrics.address, e
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config_parsing() {
        let yaml = r#"
listen_addrs:
  - "127.0.0.1:3128"
  - "[::1]:3128"
permissions: "/etc/regolith/perm.yaml"
timeouts:
  connect: 5
  request: 30
metrics:
  enabled: true
  address: "127.0.0.1:9000"
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.listen_addrs.len(), 2);
        assert_eq!(config.listen_addrs[1], "[::1]:3128");
        assert_eq!(config.permissions, PathBuf::from("/etc/regolith/perm.yaml"));
        assert_eq!(config.timeouts.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.timeouts.request_timeout(), Duration::from_secs(30));
        assert!(config.metrics.enabled);
        assert!(config.dns_resolver.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dns_resolver_parsing() {
        let config = Config::parse(
            "listen_addrs: [\"127.0.0.1:3128\"]\ndns_resolver: \"[2001:db8::53]:5353\"\n",
        )
        .unwrap();
        let resolver = config.dns_resolver.unwrap();
        assert_eq!(resolver.port(), 5353);
        assert!(resolver.is_ipv6());

        // A bare host is not a nameserver address
        assert!(Config::parse("listen_addrs: [\"127.0.0.1:3128\"]\ndns_resolver: dns.local\n").is_err());
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::parse("listen_addrs: [\"127.0.0.1:3128\"]").unwrap();
        assert_eq!(config.permissions, PathBuf::from("perm.json"));
        assert_eq!(config.timeouts.connect, 10);
        assert_eq!(config.timeouts.request, 10);
        assert!(!config.metrics.enabled);
        assert_eq!(config.metrics.address, "127.0.0.1:9000");
    }

    #[test]
    fn test_missing_listen_addrs() {
        assert!(Config::parse("permissions: perm.json").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let empty = Config::parse("listen_addrs: []").unwrap();
        assert!(matches!(empty.validate(), Err(ConfigError::Invalid(_))));

        let bad_addr = Config::parse("listen_addrs: [\"localhost\"]").unwrap();
        assert!(bad_addr.validate().is_err());

        let zero = Config::parse(
            "listen_addrs: [\"127.0.0.1:3128\"]\ntimeouts:\n  connect: 0\n  request: 10\n",
        )
        .unwrap();
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_invalid_yaml() {
        let result = Config::parse("invalid: yaml: content: ::::");
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(Format::from_path(Path::new("perm.json")), Format::Json);
        assert_eq!(Format::from_path(Path::new("PERM.JSON")), Format::Json);
        assert_eq!(Format::from_path(Path::new("perm.yaml")), Format::Yaml);
        assert_eq!(Format::from_path(Path::new("perm")), Format::Yaml);
    }
}
