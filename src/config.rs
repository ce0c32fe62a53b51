//! Ledger configuration

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::Deserialize;
use thiserror::Error;

use crate::blockchain::pow::DEFAULT_DIFFICULTY_BITS;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Settings for one ledger. Every field falls back to its default when
/// absent from the file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Directory of the sled database
    pub data_dir: PathBuf,

    /// Proof-of-work difficulty
    pub difficulty_bits: u32,

    /// Coinbase reward
    pub subsidy: u64,

    /// Data carried by the genesis coinbase input
    pub genesis_coinbase_data: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            data_dir: default_data_dir(),
            difficulty_bits: DEFAULT_DIFFICULTY_BITS,
            subsidy: 10,
            genesis_coinbase_data: "The first ever coinbase transaction".to_string(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/blockchain")
}

impl LedgerConfig {
    /// Loads configuration from a TOML file, using defaults when the file
    /// does not exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(LedgerConfig::default());
        }

        let config = Self::from_toml_str(&fs::read_to_string(path)?)?;
        info!("Loaded config from {}", path.display());

        Ok(config)
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: LedgerConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data_dir must be set".to_string()));
        }

        if !(1..=256).contains(&self.difficulty_bits) {
            return Err(ConfigError::Invalid(format!(
                "difficulty_bits must be between 1 and 256, got {}",
                self.difficulty_bits
            )));
        }

        if self.subsidy == 0 {
            return Err(ConfigError::Invalid("subsidy must be positive".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.difficulty_bits, 24);
        assert_eq!(config.subsidy, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = LedgerConfig::from_toml_str("difficulty_bits = 12\ndata_dir = \"/tmp/ledger\"").unwrap();

        assert_eq!(config.difficulty_bits, 12);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/ledger"));
        assert_eq!(config.subsidy, LedgerConfig::default().subsidy);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            LedgerConfig::from_toml_str("difficulty_bits = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            LedgerConfig::from_toml_str("subsidy = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            LedgerConfig::from_toml_str("subsidy = \"ten\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = LedgerConfig::load(dir.path().join("ledger.toml")).unwrap();
        assert_eq!(config, LedgerConfig::default());
    }
}
