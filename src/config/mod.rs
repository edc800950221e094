//! Client configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::session::{ConnectOptions, FeeMode};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub referral: ReferralConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Endpoints of the external wallet capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Passkey portal that hosts the biometric prompt
    #[serde(default = "default_portal_url")]
    pub portal_url: String,

    /// Relayer that sponsors fees
    #[serde(default = "default_paymaster_url")]
    pub paymaster_url: String,

    #[serde(default)]
    pub fee_mode: FeeMode,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            portal_url: default_portal_url(),
            paymaster_url: default_paymaster_url(),
            fee_mode: FeeMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralConfig {
    /// Origin that referral links are built on
    #[serde(default = "default_origin")]
    pub origin: String,
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Device-local data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Name of the tab whose pending capture is used
    #[serde(default = "default_tab")]
    pub tab: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            tab: default_tab(),
        }
    }
}

fn default_rpc_url() -> String { "https://api.devnet.solana.com".to_string() }
fn default_portal_url() -> String { "https://portal.lazor.sh".to_string() }
fn default_paymaster_url() -> String { "https://kora.devnet.lazorkit.com".to_string() }
fn default_origin() -> String { "http://localhost:5173".to_string() }
fn default_data_dir() -> PathBuf { PathBuf::from(".refkit") }
fn default_tab() -> String { "default".to_string() }

impl Config {
    /// Missing file means defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            fee_mode: self.wallet.fee_mode,
        }
    }

    /// Durable (device-wide) storage directory.
    pub fn durable_dir(&self) -> PathBuf {
        self.storage.data_dir.join("durable")
    }

    /// Tab-scoped storage directory.
    pub fn tab_dir(&self) -> PathBuf {
        self.storage.data_dir.join("tabs").join(&self.storage.tab)
    }
}
