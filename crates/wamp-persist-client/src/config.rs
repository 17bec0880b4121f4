use std::{env, fs, path::Path};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::link::{Endpoint, ReconnectConfig};

pub const URL_ENV: &str = "WAMP_PERSIST_URL";
pub const REALM_ENV: &str = "WAMP_PERSIST_REALM";
pub const MAX_PENDING_ENV: &str = "WAMP_PERSIST_MAX_PENDING";

const DEFAULT_REALM: &str = "realm1";

fn default_realm() -> String {
    DEFAULT_REALM.to_owned()
}

/// Client configuration
///
/// Only `url` is required. A façade built from it opens a router link to
/// that address.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// `tcp://host:port` or `unix:///path/to.sock`
    pub url: String,
    #[serde(default = "default_realm")]
    pub realm: String,
    /// Bound on queued operations, unbounded when absent
    #[serde(default)]
    pub max_pending: Option<usize>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            realm: default_realm(),
            max_pending: None,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse client config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))?;
        config.apply_env_overrides()?;
        config.validate()?;

        log::debug!("Loaded client config from {}", path.display());
        Ok(config)
    }

    /// Build from `WAMP_PERSIST_*` variables, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            log::debug!("No .env file loaded: {e}");
        }

        let url = env::var(URL_ENV).with_context(|| format!("{URL_ENV} is not set"))?;
        let mut config = Self::new(url);
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(url) = env::var(URL_ENV) {
            self.url = url;
        }
        if let Ok(realm) = env::var(REALM_ENV) {
            self.realm = realm;
        }
        if let Ok(max_pending) = env::var(MAX_PENDING_ENV) {
            let max_pending = max_pending
                .parse()
                .with_context(|| format!("{MAX_PENDING_ENV} must be a number, got {max_pending}"))?;
            self.max_pending = Some(max_pending);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        Endpoint::parse(&self.url).with_context(|| format!("Invalid router url: {}", self.url))?;

        if self.realm.is_empty() {
            anyhow::bail!("Realm must not be empty");
        }
        if self.max_pending == Some(0) {
            anyhow::bail!("max_pending must be at least 1 when set");
        }
        self.reconnect.validate()
    }
}
