//! Engine configuration
//!
//! One struct resolved once at startup. Every section carries serde defaults,
//! so a file only needs the values it changes:
//!
//! ```json
//! {
//!   "symbols": ["BTCUSDT"],
//!   "aggregation": { "weights": { "rsi": "1.0", "macd": "1.0" } },
//!   "retry": { "max_attempts": 5 }
//! }
//! ```

use crate::error::ConfigError;
use kestrel_order_manager::{AggregationConfig, RetryPolicy, RiskConfig};
use kestrel_risk_manager::HealthConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub symbols: Vec<String>,
    pub aggregation: AggregationConfig,
    pub risk: RiskConfig,
    pub retry: RetryPolicy,
    pub health: HealthConfig,
    pub queue_capacity: usize,
    pub shutdown_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string()],
            aggregation: AggregationConfig::default(),
            risk: RiskConfig::default(),
            retry: RetryPolicy::default(),
            health: HealthConfig::default(),
            queue_capacity: 256,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::Invalid("at least one symbol is required".into()));
        }
        let mut seen = HashSet::new();
        for symbol in &self.symbols {
            if symbol.trim().is_empty() || !seen.insert(symbol.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "symbol {:?} is empty or duplicated",
                    symbol
                )));
            }
        }

        let agg = &self.aggregation;
        for (name, value) in [
            ("conflict_threshold", agg.conflict_threshold),
            ("min_confidence", agg.min_confidence),
            ("min_total_score", agg.min_total_score),
        ] {
            if value < Decimal::ZERO || value > Decimal::ONE {
                return Err(ConfigError::Invalid(format!(
                    "aggregation.{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if let Some(bz) = &agg.blind_zone {
            for (name, value) in [
                ("long_penalty", bz.long_penalty),
                ("short_penalty", bz.short_penalty),
            ] {
                if value <= Decimal::ZERO || value > Decimal::ONE {
                    return Err(ConfigError::Invalid(format!(
                        "aggregation.blind_zone.{} must be within (0, 1], got {}",
                        name, value
                    )));
                }
            }
        }

        self.risk
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("risk: {}", e)))?;
        self.health
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("health: {}", e)))?;

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.call_timeout_ms == 0 || self.retry.action_timeout_ms == 0 {
            return Err(ConfigError::Invalid("retry timeouts must be positive".into()));
        }
        // An order call must be able to exhaust its retries inside the action deadline
        let budget = self.retry.call_budget();
        if self.retry.action_timeout() < budget {
            return Err(ConfigError::Invalid(format!(
                "retry.action_timeout_ms {} is shorter than one call's retry budget {:?}",
                self.retry.action_timeout_ms, budget
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be positive".into()));
        }
        Ok(())
    }
}

/// Load and validate a JSON config file
pub fn load_config(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    load_config_from_str(&raw)
}

/// Parse and validate a JSON config document
pub fn load_config_from_str(json: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
}
