//! Configuration for the settlement engine.
//!
//! Loaded from a TOML file with environment variable overrides and
//! validated once at startup. Defaults mirror the production table limits.

use crate::errors::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub betting: BettingConfig,
    #[serde(default)]
    pub odds: OddsConfig,
    #[serde(default)]
    pub payouts: PayoutConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Stake bounds and the operator's own ledger account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BettingConfig {
    pub min_bet: u64,
    pub max_bet: u64,
    /// Account the net house edge is routed to.
    pub house_account: u64,
}

impl Default for BettingConfig {
    fn default() -> Self {
        Self {
            min_bet: 100,
            max_bet: 5000,
            house_account: 0,
        }
    }
}

/// Outcome probabilities. Tails takes the residual so the three always sum
/// to exactly 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OddsConfig {
    pub p_heads: f64,
    pub p_edge: f64,
}

impl Default for OddsConfig {
    fn default() -> Self {
        Self {
            p_heads: 0.495,
            p_edge: 0.010,
        }
    }
}

/// Payout multipliers. Policy parameters, not derived from the odds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutConfig {
    pub side_multiplier: f64,
    pub edge_multiplier: f64,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            side_multiplier: 1.75,
            edge_multiplier: 8.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./monetka_data".to_string(),
        }
    }
}

/// Configuration loader with environment variable support.
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path.
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables.
    pub fn load(&self) -> EngineResult<EngineConfig> {
        let mut config = if let Some(ref path) = self.config_path {
            self.load_from_file(path)?
        } else {
            EngineConfig::default()
        };

        self.apply_env_overrides(&mut config)?;
        validate(&config)?;

        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> EngineResult<EngineConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::Configuration {
            field: "config".to_string(),
            value: path.to_string(),
            reason: format!("failed to read: {}", e),
        })?;

        toml::from_str(&content).map_err(|e| EngineError::Configuration {
            field: "config".to_string(),
            value: path.to_string(),
            reason: format!("failed to parse TOML: {}", e),
        })
    }

    fn apply_env_overrides(&self, config: &mut EngineConfig) -> EngineResult<()> {
        if let Ok(dir) = env::var("MONETKA_DATA_DIR") {
            config.storage.data_dir = dir;
        }
        if let Ok(min) = env::var("MONETKA_MIN_BET") {
            config.betting.min_bet = min.parse().map_err(|_| EngineError::Configuration {
                field: "MONETKA_MIN_BET".to_string(),
                value: min,
                reason: "invalid integer".to_string(),
            })?;
        }
        if let Ok(max) = env::var("MONETKA_MAX_BET") {
            config.betting.max_bet = max.parse().map_err(|_| EngineError::Configuration {
                field: "MONETKA_MAX_BET".to_string(),
                value: max,
                reason: "invalid integer".to_string(),
            })?;
        }

        Ok(())
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, config: &EngineConfig, path: &str) -> EngineResult<()> {
        let toml_string =
            toml::to_string_pretty(config).map_err(|e| EngineError::Configuration {
                field: "config".to_string(),
                value: path.to_string(),
                reason: format!("failed to serialize: {}", e),
            })?;

        std::fs::write(path, toml_string).map_err(|e| EngineError::Configuration {
            field: "config".to_string(),
            value: path.to_string(),
            reason: format!("failed to write: {}", e),
        })
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> EngineError {
    EngineError::Configuration {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Validate a configuration. Also applied to loaded files.
pub fn validate(config: &EngineConfig) -> EngineResult<()> {
    if config.betting.min_bet == 0 {
        return Err(invalid("betting.min_bet", 0, "must be at least 1"));
    }
    if config.betting.max_bet < config.betting.min_bet {
        return Err(invalid(
            "betting.max_bet",
            config.betting.max_bet,
            "must be >= min_bet",
        ));
    }

    let p_heads = config.odds.p_heads;
    let p_edge = config.odds.p_edge;
    if !(p_heads > 0.0 && p_heads < 1.0) {
        return Err(invalid("odds.p_heads", p_heads, "must be in (0, 1)"));
    }
    if !(p_edge > 0.0 && p_edge < 1.0) {
        return Err(invalid("odds.p_edge", p_edge, "must be in (0, 1)"));
    }
    if p_heads + p_edge >= 1.0 {
        return Err(invalid(
            "odds",
            p_heads + p_edge,
            "heads + edge must leave a positive tails residual",
        ));
    }

    if config.payouts.side_multiplier <= 0.0 {
        return Err(invalid(
            "payouts.side_multiplier",
            config.payouts.side_multiplier,
            "must be positive",
        ));
    }
    if config.payouts.edge_multiplier <= 0.0 {
        return Err(invalid(
            "payouts.edge_multiplier",
            config.payouts.edge_multiplier,
            "must be positive",
        ));
    }

    if config.storage.data_dir.is_empty() {
        return Err(invalid("storage.data_dir", "", "must not be empty"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(validate(&config).is_ok());
        assert_eq!(config.betting.min_bet, 100);
        assert_eq!(config.betting.max_bet, 5000);
        assert_eq!(config.odds.p_heads, 0.495);
        assert_eq!(config.odds.p_edge, 0.010);
        assert_eq!(config.payouts.side_multiplier, 1.75);
        assert_eq!(config.payouts.edge_multiplier, 8.0);
    }

    #[test]
    fn test_rejects_inverted_stake_bounds() {
        let mut config = EngineConfig::default();
        config.betting.max_bet = 50;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rejects_overcommitted_probabilities() {
        let mut config = EngineConfig::default();
        config.odds.p_heads = 0.995;
        config.odds.p_edge = 0.010;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rejects_zero_multiplier() {
        let mut config = EngineConfig::default();
        config.payouts.edge_multiplier = 0.0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() -> EngineResult<()> {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut original = EngineConfig::default();
        original.betting.max_bet = 9000;

        let loader = ConfigLoader::new();
        loader.save(&original, path)?;

        let loaded = ConfigLoader::new().with_path(path).load()?;
        assert_eq!(loaded.betting.max_bet, 9000);
        assert_eq!(loaded.odds.p_edge, original.odds.p_edge);

        Ok(())
    }
}
