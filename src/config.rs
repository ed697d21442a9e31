//! Signer configuration - built by the binary from the environment, or by
//! embedders through the builder methods.

use std::path::PathBuf;

use bitcoin::bip32::DerivationPath;
use bitcoin::Network;
use thiserror::Error;

use crate::keys::parse_path;
use crate::policy::PolicyConfig;

pub const ENV_NETWORK: &str = "KEYWARDEN_NETWORK";
pub const ENV_ACCOUNT_PATH: &str = "KEYWARDEN_ACCOUNT_PATH";
pub const ENV_DATA_DIR: &str = "KEYWARDEN_DATA_DIR";
pub const ENV_PORT: &str = "KEYWARDEN_PORT";
pub const ENV_MAX_SPEND: &str = "KEYWARDEN_MAX_SPEND_SAT";
pub const ENV_HALT_ALL: &str = "KEYWARDEN_HALT_ALL";
pub const ENV_LOOKAHEAD: &str = "KEYWARDEN_POLICY_LOOKAHEAD";

const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown network: {0}")]
    Network(String),
    #[error("invalid derivation path {0}: {1}")]
    Path(String, String),
    #[error("invalid value for {0}: {1}")]
    Value(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct SignerConfig {
    pub network: Network,
    /// Account-level path whose xpub is shared with cosigners.
    pub account_path: DerivationPath,
    pub data_dir: PathBuf,
    pub port: u16,
    pub policy: PolicyConfig,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self::new(Network::Bitcoin)
    }
}

impl SignerConfig {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            account_path: default_account_path(network),
            data_dir: default_data_dir(),
            port: DEFAULT_PORT,
            policy: PolicyConfig::default(),
        }
    }

    /// Switches network and resets the account path to that network's default.
    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self.account_path = default_account_path(network);
        self
    }

    pub fn with_account_path(mut self, path: DerivationPath) -> Self {
        self.account_path = path;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_policy(mut self, policy: PolicyConfig) -> Self {
        self.policy = policy;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let network = match lookup(ENV_NETWORK) {
            Some(raw) => parse_network(&raw).ok_or(ConfigError::Network(raw))?,
            None => Network::Bitcoin,
        };
        let mut config = Self::new(network);

        if let Some(raw) = lookup(ENV_ACCOUNT_PATH) {
            let path = parse_path(&raw).map_err(|e| ConfigError::Path(raw.clone(), e.to_string()))?;
            config.account_path = path;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(ENV_PORT) {
            config.port = raw.trim().parse().map_err(|_| ConfigError::Value(ENV_PORT, raw))?;
        }
        if let Some(raw) = lookup(ENV_MAX_SPEND) {
            let sats = raw.trim().parse().map_err(|_| ConfigError::Value(ENV_MAX_SPEND, raw))?;
            config.policy.max_spend_per_tx = Some(sats);
        }
        if let Some(raw) = lookup(ENV_HALT_ALL) {
            config.policy.halt_all = parse_flag(&raw).ok_or(ConfigError::Value(ENV_HALT_ALL, raw))?;
        }
        if let Some(raw) = lookup(ENV_LOOKAHEAD) {
            config.policy.lookahead = raw.trim().parse().map_err(|_| ConfigError::Value(ENV_LOOKAHEAD, raw))?;
        }
        Ok(config)
    }
}

pub fn parse_network(value: &str) -> Option<Network> {
    match value.trim().to_ascii_lowercase().as_str() {
        "bitcoin" | "mainnet" | "main" => Some(Network::Bitcoin),
        "testnet" | "test" => Some(Network::Testnet),
        "signet" => Some(Network::Signet),
        "regtest" => Some(Network::Regtest),
        _ => None,
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// BIP48 P2WSH multisig account 0.
pub fn default_account_path(network: Network) -> DerivationPath {
    let coin = if network == Network::Bitcoin { 0 } else { 1 };
    parse_path(&format!("m/48'/{coin}'/0'/2'")).unwrap_or_else(|_| DerivationPath::master())
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("keywarden")
        .join("keys")
}
