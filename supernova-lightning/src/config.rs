// SuperNova Lightning Network - Configuration
//
// Defaults, then an optional TOML file, then SUPERNOVA_LIGHTNING_*
// environment variables.

use crate::channel::ChannelConfig;
use crate::graph::ChannelPolicy;
use crate::invoice::{Currency, DEFAULT_EXPIRY_SECS, DEFAULT_MIN_FINAL_CLTV_EXPIRY};
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Lightning node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightningConfig {
    /// Currency used for issued invoices
    pub network: Currency,

    /// Forwarding policy advertised for our channels
    pub cltv_expiry_delta: u16,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub htlc_minimum_msat: u64,
    pub htlc_maximum_msat: u64,

    pub max_accepted_htlcs: u16,

    pub invoice_expiry_secs: u64,
    pub min_final_cltv_expiry: u32,

    /// Path-finding budgets
    pub max_route_cltv_delta: u32,
    pub max_fee_base_msat: u64,
    pub max_fee_proportional_millionths: u64,

    /// Blocks before expiry at which received HTLCs are failed back
    pub htlc_fail_back_margin: u32,

    pub handshake_timeout_secs: u64,
    pub closing_fee_satoshis: u64,
}

impl Default for LightningConfig {
    fn default() -> Self {
        Self {
            network: Currency::Supernova,
            cltv_expiry_delta: 40,
            fee_base_msat: 1_000,
            fee_proportional_millionths: 1,
            htlc_minimum_msat: 1,
            htlc_maximum_msat: 5_000_000_000,
            max_accepted_htlcs: 30,
            invoice_expiry_secs: DEFAULT_EXPIRY_SECS,
            min_final_cltv_expiry: DEFAULT_MIN_FINAL_CLTV_EXPIRY,
            max_route_cltv_delta: 2_016,
            max_fee_base_msat: 5_000,
            max_fee_proportional_millionths: 10_000,
            htlc_fail_back_margin: 3,
            handshake_timeout_secs: 30,
            closing_fee_satoshis: 1_000,
        }
    }
}

impl LightningConfig {
    /// Load configuration, layering an optional TOML file and the
    /// environment over the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        match path {
            Some(path) if path.exists() => {
                info!("Loading lightning configuration from: {:?}", path);
                builder = builder.add_source(File::from(path).format(FileFormat::Toml));
            }
            Some(path) => warn!("Configuration file {:?} not found, using defaults", path),
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix("SUPERNOVA_LIGHTNING")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: LightningConfig = builder.build()?.try_deserialize()?;
        if let Err(e) = config.validate() {
            return Err(ConfigError::Message(format!(
                "Configuration validation error: {e}"
            )));
        }
        Ok(config)
    }

    /// Write the default configuration as TOML.
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let toml = toml::to_string_pretty(&Self::default())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, toml)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.cltv_expiry_delta == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "cltv_expiry_delta must be > 0".to_string(),
            ));
        }
        if self.htlc_minimum_msat == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "htlc_minimum_msat must be > 0".to_string(),
            ));
        }
        if self.htlc_maximum_msat < self.htlc_minimum_msat {
            return Err(ConfigValidationError::InvalidValue(
                "htlc_maximum_msat cannot be below htlc_minimum_msat".to_string(),
            ));
        }
        if self.max_accepted_htlcs == 0 || self.max_accepted_htlcs > 483 {
            return Err(ConfigValidationError::InvalidValue(
                "max_accepted_htlcs must be between 1 and 483".to_string(),
            ));
        }
        if self.invoice_expiry_secs == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "invoice_expiry_secs must be > 0".to_string(),
            ));
        }
        if self.max_route_cltv_delta < self.min_final_cltv_expiry {
            return Err(ConfigValidationError::InvalidValue(
                "max_route_cltv_delta cannot be below min_final_cltv_expiry".to_string(),
            ));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "handshake_timeout_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            max_accepted_htlcs: self.max_accepted_htlcs,
            htlc_minimum_msat: self.htlc_minimum_msat,
        }
    }

    /// Policy advertised for the direction leaving this node.
    pub fn local_policy(&self, timestamp: u32) -> ChannelPolicy {
        ChannelPolicy {
            fee_base_msat: self.fee_base_msat,
            fee_proportional_millionths: self.fee_proportional_millionths,
            cltv_expiry_delta: self.cltv_expiry_delta,
            htlc_minimum_msat: self.htlc_minimum_msat,
            htlc_maximum_msat: self.htlc_maximum_msat,
            disabled: false,
            last_update: timestamp,
        }
    }

    /// Largest fee accepted when paying `amount_msat`.
    pub fn max_fee_msat(&self, amount_msat: u64) -> u64 {
        let proportional =
            u128::from(amount_msat) * u128::from(self.max_fee_proportional_millionths) / 1_000_000;
        self.max_fee_base_msat
            .saturating_add(u64::try_from(proportional).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        assert!(LightningConfig::default().validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "fee_base_msat = 2500\nnetwork = \"regtest\"").unwrap();

        let config = LightningConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.fee_base_msat, 2_500);
        assert_eq!(config.network, Currency::Regtest);
        assert_eq!(config.cltv_expiry_delta, 40);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "htlc_minimum_msat = 0").unwrap();
        assert!(LightningConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_written_default_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lightning.toml");
        LightningConfig::write_default(&path).unwrap();
        assert_eq!(
            LightningConfig::load(Some(&path)).unwrap(),
            LightningConfig::default()
        );
    }

    #[test]
    fn test_max_fee_budget() {
        let config = LightningConfig::default();
        assert_eq!(config.max_fee_msat(1_000_000), 5_000 + 10_000);
    }
}
