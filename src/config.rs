//! Configuration surface (§4.1): loaded from YAML via serde, validated
//! before the engine starts.

use crate::common::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_connect_retry_attempts() -> usize {
    0
}

fn default_connect_retry_interval_ms() -> u64 {
    1_000
}

fn default_cert_ttl_days() -> u32 {
    30
}

fn default_cert_cache_max_entries() -> usize {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default, rename = "use-https")]
    pub use_https: bool,
    #[serde(default, rename = "connect-headers")]
    pub connect_headers: HashMap<String, String>,
}

impl From<UpstreamConfig> for crate::upstream::Upstream {
    fn from(c: UpstreamConfig) -> Self {
        let mut upstream = crate::upstream::Upstream::new(c.host).with_https(c.use_https);
        if let (Some(user), Some(pass)) = (c.username, c.password) {
            upstream = upstream.with_credentials(user, pass);
        }
        for (name, value) in c.connect_headers {
            upstream = upstream.with_connect_header(name, value);
        }
        upstream
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub label: String,
    #[serde(rename = "host-pattern")]
    pub host_pattern: String,
    pub upstream: Option<UpstreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertStoreFileConfig {
    #[serde(rename = "ca-cert-path")]
    pub ca_cert_path: String,
    #[serde(rename = "ca-key-path")]
    pub ca_key_path: String,
    #[serde(rename = "leaf-key-path")]
    pub leaf_key_path: Option<String>,
    #[serde(default = "default_cert_ttl_days", rename = "cert-ttl-days")]
    pub cert_ttl_days: u32,
    #[serde(
        default = "default_cert_cache_max_entries",
        rename = "cert-cache-max-entries"
    )]
    pub cert_cache_max_entries: usize,
}

impl CertStoreFileConfig {
    /// Build a cert-store config with the declarative defaults, for CLI
    /// overrides (`--ca-cert`/`--ca-key`) that supply no YAML `cert-store`
    /// block of their own.
    pub fn new(ca_cert_path: String, ca_key_path: String) -> Self {
        CertStoreFileConfig {
            ca_cert_path,
            ca_key_path,
            leaf_key_path: None,
            cert_ttl_days: default_cert_ttl_days(),
            cert_cache_max_entries: default_cert_cache_max_entries(),
        }
    }
}

/// Top-level engine configuration, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Plain HTTP/CONNECT listener address.
    pub listen: SocketAddr,
    /// SSL-bump listener address; absent disables bumping.
    #[serde(rename = "bump-listen")]
    pub bump_listen: Option<SocketAddr>,

    pub auth: Option<AuthConfig>,

    #[serde(rename = "default-upstream")]
    pub default_upstream: Option<UpstreamConfig>,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    #[serde(rename = "cert-store")]
    pub cert_store: Option<CertStoreFileConfig>,

    #[serde(default = "default_connect_timeout_ms", rename = "connect-timeout-ms")]
    pub connect_timeout_ms: u64,
    #[serde(
        default = "default_connect_retry_attempts",
        rename = "connect-retry-attempts"
    )]
    pub connect_retry_attempts: usize,
    #[serde(
        default = "default_connect_retry_interval_ms",
        rename = "connect-retry-interval-ms"
    )]
    pub connect_retry_interval_ms: u64,

    #[serde(default = "default_log_level", rename = "log-level")]
    pub log_level: String,
}

impl Default for FileConfig {
    fn default() -> Self {
        FileConfig {
            listen: "127.0.0.1:8080".parse().unwrap(),
            bump_listen: None,
            auth: None,
            default_upstream: None,
            routes: Vec::new(),
            cert_store: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_retry_attempts: default_connect_retry_attempts(),
            connect_retry_interval_ms: default_connect_retry_interval_ms(),
            log_level: default_log_level(),
        }
    }
}

impl FileConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FileConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: FileConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(bump_listen) = self.bump_listen {
            if bump_listen == self.listen {
                return Err(Error::config(
                    "listen and bump-listen must be different addresses",
                ));
            }
            if self.cert_store.is_none() {
                return Err(Error::config(
                    "bump-listen requires a cert-store configuration",
                ));
            }
        }

        for route in &self.routes {
            if route.host_pattern.is_empty() {
                return Err(Error::config("route host-pattern must not be empty"));
            }
            regex::RegexBuilder::new(&route.host_pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    Error::config(format!(
                        "invalid host-pattern '{}': {}",
                        route.host_pattern, e
                    ))
                })?;
        }

        if self.connect_timeout_ms == 0 {
            return Err(Error::config("connect-timeout-ms must be greater than 0"));
        }
        if self.connect_retry_interval_ms == 0 {
            return Err(Error::config(
                "connect-retry-interval-ms must be greater than 0",
            ));
        }

        if let Some(cert_store) = &self.cert_store {
            if cert_store.cert_ttl_days == 0 {
                return Err(Error::config("cert-ttl-days must be greater than 0"));
            }
            if cert_store.cert_cache_max_entries == 0 {
                return Err(Error::config(
                    "cert-cache-max-entries must be greater than 0",
                ));
            }
        }

        Ok(())
    }
}
