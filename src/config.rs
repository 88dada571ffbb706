//! Client configuration.
//!
//! Values come from built-in defaults, optionally a JSON file, and finally
//! `CALL_*` environment variables.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::media::{JsonFilePreferences, MemoryPreferences, PreferenceStore};

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_GUEST_NAME: &str = "Guest";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub relay_url: Url,
    pub ice_servers: Vec<IceServer>,
    /// Identity used when `join` is called without a user name.
    pub guest_name: String,
    /// Start local capture as soon as the relay connects.
    pub capture_on_join: bool,
    pub reconnect: ReconnectPolicy,
    /// JSON file holding saved device choices. Kept in memory when unset.
    pub preferences_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            ice_servers: vec![IceServer {
                urls: vec![DEFAULT_STUN_SERVER.to_owned()],
                ..Default::default()
            }],
            guest_name: DEFAULT_GUEST_NAME.to_owned(),
            capture_on_join: true,
            reconnect: ReconnectPolicy::default(),
            preferences_path: None,
        }
    }
}

fn default_relay_url() -> Url {
    match Url::parse(DEFAULT_RELAY_URL) {
        Ok(url) => url,
        Err(_) => unreachable!("default relay URL is valid"),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Automatic reconnection of the relay channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub multiplier: f32,
    pub max_delay_ms: u64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Whether another attempt is allowed after `attempts` failed ones.
    pub fn allows(&self, attempts: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempts < max)
    }
}

impl ClientConfig {
    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&raw).map_err(|e| Error::config(format!("{}: {}", path.display(), e)))
    }

    /// Defaults overlaid with `CALL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_string("CALL_RELAY_URL") {
            self.relay_url =
                Url::parse(&url).map_err(|e| Error::config(format!("CALL_RELAY_URL: {}", e)))?;
        }
        if let Some(servers) = env_string("CALL_ICE_SERVERS") {
            self.ice_servers = parse_ice_servers(&servers);
        }
        if let Some(name) = env_string("CALL_GUEST_NAME") {
            self.guest_name = name;
        }
        self.capture_on_join = env_bool("CALL_CAPTURE_ON_JOIN", self.capture_on_join);
        self.reconnect.enabled = env_bool("CALL_RECONNECT", self.reconnect.enabled);
        if let Some(path) = env_string("CALL_PREFERENCES") {
            self.preferences_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Device preference storage backing the capture manager.
    pub fn preference_store(&self) -> Arc<dyn PreferenceStore> {
        match &self.preferences_path {
            Some(path) => Arc::new(JsonFilePreferences::open(path)),
            None => Arc::new(MemoryPreferences::new()),
        }
    }
}

fn parse_ice_servers(raw: &str) -> Vec<IceServer> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(|url| IceServer {
            urls: vec![url.to_owned()],
            ..Default::default()
        })
        .collect()
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
