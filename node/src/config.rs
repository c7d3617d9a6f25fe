use conduit_core::types::{Address, NetworkContext};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum NodeConfigValidationError {
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid signer key: {0}")]
    InvalidSignerKey(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct NodeConfig {
    pub node: GeneralConfig,
    pub network: ChainConfig,
    pub lock: LockConfig,
    pub router: RouterConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Hex-encoded secp256k1 secret key. A fresh random identity is
    /// generated when absent; fine for development, not for operation.
    pub signer_key: Option<String>,
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            signer_key: None,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub adjudicator: String,
    pub channel_factory: String,
    pub mastercopy: String,
    pub provider_url: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: 1337,
            adjudicator: Address::zero().to_string(),
            channel_factory: Address::zero().to_string(),
            mastercopy: Address::zero().to_string(),
            provider_url: String::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LockConfig {
    pub ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { ttl_secs: 30 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouterConfig {
    /// Run the forwarding service alongside the protocol engine.
    pub enabled: bool,
    /// Extra collateral deposited beyond the immediate shortfall.
    pub collateral_target: u64,
    /// Balance above which reclaiming collateral becomes worthwhile.
    pub reclaim_threshold: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            collateral_target: 0,
            reclaim_threshold: u64::MAX,
        }
    }
}

impl NodeConfig {
    /// Load configuration: defaults, then the config file (when present),
    /// then `CONDUIT_*` environment overrides. Validation is fail-fast; a
    /// partially valid configuration never reaches the wiring.
    pub fn load(path: Option<&PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        match path {
            Some(path) if path.exists() => {
                info!("Loading configuration from: {:?}", path);
                builder = builder.add_source(File::from(path.clone()));
            }
            Some(path) => {
                return Err(ConfigError::Message(format!(
                    "config file not found: {path:?}"
                )));
            }
            None => {
                let default_path = PathBuf::from("conduit.toml");
                if default_path.exists() {
                    info!("Loading configuration from: {:?}", default_path);
                    builder = builder.add_source(File::from(default_path));
                } else {
                    warn!("No configuration file found, using defaults");
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("CONDUIT")
                .separator("__")
                .try_parsing(true),
        );

        let config: NodeConfig = builder.build()?.try_deserialize()?;
        config
            .validate()
            .map_err(|e| ConfigError::Message(format!("Configuration validation error: {e}")))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NodeConfigValidationError> {
        if self.network.chain_id == 0 {
            return Err(NodeConfigValidationError::InvalidValue(
                "network.chain_id must be non-zero".to_string(),
            ));
        }
        if self.lock.ttl_secs == 0 {
            return Err(NodeConfigValidationError::InvalidValue(
                "lock.ttl_secs must be non-zero".to_string(),
            ));
        }
        for (field, value) in [
            ("network.adjudicator", &self.network.adjudicator),
            ("network.channel_factory", &self.network.channel_factory),
            ("network.mastercopy", &self.network.mastercopy),
        ] {
            value.parse::<Address>().map_err(|e| {
                NodeConfigValidationError::InvalidAddress(format!("{field}: {e}"))
            })?;
        }
        if let Some(key) = &self.node.signer_key {
            let raw = key.strip_prefix("0x").unwrap_or(key);
            let bytes = hex::decode(raw)
                .map_err(|e| NodeConfigValidationError::InvalidSignerKey(e.to_string()))?;
            if bytes.len() != 32 {
                return Err(NodeConfigValidationError::InvalidSignerKey(format!(
                    "expected 32 bytes, got {}",
                    bytes.len()
                )));
            }
        }
        if self.router.enabled && self.router.reclaim_threshold < self.router.collateral_target {
            return Err(NodeConfigValidationError::InvalidValue(
                "router.reclaim_threshold must not be below router.collateral_target".to_string(),
            ));
        }
        Ok(())
    }

    /// The on-chain context channels opened by this node will use.
    pub fn network_context(&self) -> Result<NetworkContext, NodeConfigValidationError> {
        Ok(NetworkContext {
            chain_id: self.network.chain_id,
            adjudicator: self.parse_address(&self.network.adjudicator)?,
            channel_factory: self.parse_address(&self.network.channel_factory)?,
            mastercopy: self.parse_address(&self.network.mastercopy)?,
            provider_url: self.network.provider_url.clone(),
        })
    }

    fn parse_address(&self, value: &str) -> Result<Address, NodeConfigValidationError> {
        value
            .parse()
            .map_err(|e| NodeConfigValidationError::InvalidAddress(format!("{value}: {e}")))
    }
}
