//! Position health scoring
//!
//! A score from 100 (nothing wrong) down to 0, built from three bounded
//! penalties:
//!
//! | Component  | Max | Input                                               |
//! |------------|-----|-----------------------------------------------------|
//! | Drawdown   | 50  | adverse move × leverage vs `max_drawdown_pct`        |
//! | Duration   | 20  | candles held vs `max_duration_candles`              |
//! | Volatility | 30  | last candle range vs `volatility_ceiling_pct`        |

use crate::error::{Result, RiskError};
use chrono::{DateTime, Utc};
use kestrel_core::{HealthLevel, Position};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

const DRAWDOWN_WEIGHT: Decimal = dec!(50);
const DURATION_WEIGHT: Decimal = dec!(20);
const VOLATILITY_WEIGHT: Decimal = dec!(30);
const MAX_SCORE: Decimal = dec!(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Candle closes between re-evaluations
    pub evaluation_interval_candles: u64,
    /// Below this the position is Critical (and may be closed)
    pub emergency_threshold: Decimal,
    /// Below this the position is Warning
    pub warning_threshold: Decimal,
    pub emergency_close_enabled: bool,
    /// Leveraged adverse move (fraction of margin) that costs the full drawdown penalty
    pub max_drawdown_pct: Decimal,
    pub max_duration_candles: u64,
    /// Candle range (fraction of close) that costs the full volatility penalty
    pub volatility_ceiling_pct: Decimal,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_candles: 3,
            emergency_threshold: dec!(30),
            warning_threshold: dec!(50),
            emergency_close_enabled: true,
            max_drawdown_pct: dec!(0.5),
            max_duration_candles: 96,
            volatility_ceiling_pct: dec!(0.05),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<()> {
        if self.evaluation_interval_candles == 0 {
            return Err(RiskError::InvalidConfig(
                "evaluation_interval_candles must be at least 1".to_string(),
            ));
        }
        if self.warning_threshold < Decimal::ZERO || self.warning_threshold > MAX_SCORE {
            return Err(RiskError::InvalidConfig(format!(
                "warning_threshold must be within [0, 100], got {}",
                self.warning_threshold
            )));
        }
        if self.emergency_threshold < Decimal::ZERO || self.emergency_threshold > self.warning_threshold {
            return Err(RiskError::InvalidConfig(format!(
                "emergency_threshold must be within [0, warning_threshold], got {}",
                self.emergency_threshold
            )));
        }
        if self.max_drawdown_pct <= Decimal::ZERO
            || self.volatility_ceiling_pct <= Decimal::ZERO
            || self.max_duration_candles == 0
        {
            return Err(RiskError::InvalidConfig(
                "health penalty limits must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn level_for(&self, score: Decimal) -> HealthLevel {
        if score < self.emergency_threshold {
            HealthLevel::Critical
        } else if score < self.warning_threshold {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }
}

/// One evaluation of a position's health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthScore {
    pub score: Decimal,
    pub level: HealthLevel,
    pub drawdown_penalty: Decimal,
    pub duration_penalty: Decimal,
    pub volatility_penalty: Decimal,
    pub computed_at: DateTime<Utc>,
}

impl HealthScore {
    pub fn compute(
        config: &HealthConfig,
        position: &Position,
        mark_price: Decimal,
        candle_range_pct: Decimal,
        candles_held: u64,
    ) -> Self {
        let leveraged_drawdown = position.adverse_move_pct(mark_price) * position.leverage;
        let drawdown_penalty =
            ratio(leveraged_drawdown, config.max_drawdown_pct) * DRAWDOWN_WEIGHT;
        let duration_penalty = ratio(
            Decimal::from(candles_held),
            Decimal::from(config.max_duration_candles),
        ) * DURATION_WEIGHT;
        let volatility_penalty =
            ratio(candle_range_pct, config.volatility_ceiling_pct) * VOLATILITY_WEIGHT;

        let score = (MAX_SCORE - drawdown_penalty - duration_penalty - volatility_penalty)
            .clamp(Decimal::ZERO, MAX_SCORE);

        Self {
            score,
            level: config.level_for(score),
            drawdown_penalty,
            duration_penalty,
            volatility_penalty,
            computed_at: Utc::now(),
        }
    }
}

/// `value / limit` bounded to [0, 1]
fn ratio(value: Decimal, limit: Decimal) -> Decimal {
    if limit <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (value / limit).clamp(Decimal::ZERO, Decimal::ONE)
}
