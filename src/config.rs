//! YAML configuration.
//!
//! A missing config file is written out with the documented defaults before
//! loading, so a first run leaves an editable template behind.

use std::path::Path;

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::snmp::{UsmUser, Version};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Serial device name (`/dev/ttyUSB0`, `COM8`, ...).
    pub com_port: String,

    /// SNMP listen address.
    pub address: String,
    /// SNMP listen port.
    pub port: u16,

    pub snmp: SnmpConfig,

    /// Silence the UPS buzzer whenever a status frame reports it active.
    pub disable_buzz: bool,

    /// Application log level.
    pub log_level: String,
    /// INFO events whose message contains one of these words are dropped.
    pub log_filter: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SnmpConfig {
    /// Read community.
    pub public: String,
    /// Write community; equal to `public` collapses both onto one
    /// community with read-write access.
    pub private: String,

    /// SNMPv3 users. Any entry here switches the agent to v3-only.
    pub user: Vec<UserConfig>,

    /// Trap destinations.
    pub trap: Vec<TrapConfig>,

    /// SNMP stack log level.
    pub log_level: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct UserConfig {
    pub username: String,
    pub authpass: String,
    pub privpass: String,
    /// MD5, SHA, SHA224, SHA256, SHA384 or SHA512.
    pub authproto: String,
    /// DES, AES, AES192, AES192C, AES256 or AES256C.
    pub privproto: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TrapConfig {
    pub enable: bool,
    pub host: String,
    pub port: u16,
    pub community: String,
    /// `1`, `2c` or `3`.
    pub version: TrapVersion,
    pub user: UserConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrapVersion {
    #[serde(rename = "1")]
    V1,
    #[serde(rename = "2c")]
    V2c,
    #[serde(rename = "3")]
    V3,
}

impl From<TrapVersion> for Version {
    fn from(v: TrapVersion) -> Version {
        match v {
            TrapVersion::V1 => Version::V1,
            TrapVersion::V2c => Version::V2c,
            TrapVersion::V3 => Version::V3,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            com_port: "/dev/ttyUSB0".into(),
            address: "0.0.0.0".into(),
            port: 161,
            snmp: SnmpConfig::default(),
            disable_buzz: false,
            log_level: "info".into(),
            log_filter: Vec::new(),
        }
    }
}

impl Default for SnmpConfig {
    fn default() -> Self {
        Self {
            public: "public".into(),
            private: "private".into(),
            user: Vec::new(),
            trap: Vec::new(),
            log_level: "error".into(),
        }
    }
}

impl Default for TrapConfig {
    fn default() -> Self {
        Self {
            enable: true,
            host: "127.0.0.1".into(),
            port: 162,
            community: "public".into(),
            version: TrapVersion::V2c,
            user: UserConfig::default(),
        }
    }
}

impl UserConfig {
    /// Build the USM user this entry describes, or `None` for an entry
    /// without a username. Passphrase-less entries come out noAuthNoPriv;
    /// privacy requires authentication.
    pub fn to_usm_user(&self) -> anyhow::Result<Option<UsmUser>> {
        if self.username.is_empty() {
            return Ok(None);
        }

        let auth = if self.authpass.is_empty() {
            None
        } else {
            let protocol = self
                .authproto
                .parse()
                .with_context(|| format!("user '{}': authproto '{}'", self.username, self.authproto))?;
            Some((protocol, self.authpass.clone().into_bytes()))
        };

        let privacy = if self.privpass.is_empty() {
            None
        } else {
            if auth.is_none() {
                anyhow::bail!("user '{}': privacy requires authentication", self.username);
            }
            let protocol = self
                .privproto
                .parse()
                .with_context(|| format!("user '{}': privproto '{}'", self.username, self.privproto))?;
            Some((protocol, self.privpass.clone().into_bytes()))
        };

        Ok(Some(UsmUser {
            username: Bytes::from(self.username.clone().into_bytes()),
            auth,
            privacy,
        }))
    }
}

impl Config {
    /// Load the file, materialising it with defaults first when missing.
    pub fn load_or_create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let defaults = Config::default();
            let rendered = serde_yaml::to_string(&defaults)
                .context("failed to render default configuration")?;
            std::fs::write(path, rendered)
                .with_context(|| format!("failed to write default config to {}", path.display()))?;
            tracing::info!(config = %path.display(), "default configuration written");
            return Ok(defaults);
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// The configured v3 users as USM users.
    pub fn usm_users(&self) -> anyhow::Result<Vec<UsmUser>> {
        self.snmp
            .user
            .iter()
            .filter_map(|entry| entry.to_usm_user().transpose())
            .collect()
    }

    pub fn listen_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        let addr: std::net::IpAddr = self
            .address
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.address))?;
        Ok(std::net::SocketAddr::new(addr, self.port))
    }

    /// Normalised filter word list: blanks dropped, whitespace trimmed.
    pub fn filter_words(&self) -> Vec<String> {
        self.log_filter
            .iter()
            .map(|word| word.trim().to_string())
            .filter(|word| !word.is_empty())
            .collect()
    }
}
