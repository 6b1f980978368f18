//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! `BACKEND_URL` overrides `gateway.backend_url` so one config file can be
//! reused across environments.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use token_auth::CookieOptions;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub cookies: CookieOptions,
    #[serde(default)]
    pub refresh: RefreshConfig,
}

/// Listener and backend settings
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub backend_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Token refresh behaviour
#[derive(Debug, Default, Deserialize)]
pub struct RefreshConfig {
    /// Refreshes allowed per request before giving up. Unbounded when unset.
    #[serde(default)]
    pub max_replays: Option<u32>,
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(url) = std::env::var("BACKEND_URL") {
            config.gateway.backend_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.gateway.backend_url.starts_with("http://")
            && !self.gateway.backend_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "backend_url must start with http:// or https://, got: {}",
                self.gateway.backend_url
            )));
        }

        if self.gateway.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.gateway.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if !self.cookies.path.starts_with('/') {
            return Err(common::Error::Config(format!(
                "cookies.path must start with '/', got: {}",
                self.cookies.path
            )));
        }

        if self.refresh.max_replays == Some(0) {
            return Err(common::Error::Config(
                "refresh.max_replays must be greater than 0 (omit it for no limit)".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-gateway.toml")
    }
}
