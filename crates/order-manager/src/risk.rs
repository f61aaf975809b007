//! Entry risk parameters
//!
//! Turns an accepted direction and entry price into a concrete order plan:
//! position size from balance and leverage, a protective stop, and the
//! take-profit ladder. Stateless; the RealTimeRiskMonitor (separate crate)
//! watches positions once they are open.

use crate::error::{Error, Result};
use kestrel_core::{Direction, TakeProfitLevel};
use log::debug;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// One rung of the take-profit ladder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitConfig {
    /// Distance from entry as a fraction of entry (0.02 = 2%)
    pub distance_pct: Decimal,
    /// Share of the initial quantity closed at this level
    pub close_fraction: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub leverage: Decimal,
    /// Fraction of balance committed as margin per trade
    pub risk_per_trade_pct: Decimal,
    /// Stop distance from entry as a fraction of entry
    pub stop_loss_pct: Decimal,
    pub take_profits: Vec<TakeProfitConfig>,
    pub min_quantity: Decimal,
    pub quantity_step: Decimal,
    /// Move the stop to entry once the first take-profit fills
    pub breakeven_after_first_tp: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            leverage: dec!(10),
            risk_per_trade_pct: dec!(0.02),
            stop_loss_pct: dec!(0.02),
            take_profits: vec![
                TakeProfitConfig {
                    distance_pct: dec!(0.02),
                    close_fraction: dec!(0.5),
                },
                TakeProfitConfig {
                    distance_pct: dec!(0.04),
                    close_fraction: dec!(0.5),
                },
            ],
            min_quantity: dec!(0.001),
            quantity_step: dec!(0.001),
            breakeven_after_first_tp: true,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        if self.leverage <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "leverage must be positive, got {}",
                self.leverage
            )));
        }
        if self.risk_per_trade_pct <= Decimal::ZERO || self.risk_per_trade_pct > Decimal::ONE {
            return Err(Error::Validation(format!(
                "risk_per_trade_pct must be within (0, 1], got {}",
                self.risk_per_trade_pct
            )));
        }
        if self.stop_loss_pct <= Decimal::ZERO || self.stop_loss_pct >= Decimal::ONE {
            return Err(Error::Validation(format!(
                "stop_loss_pct must be within (0, 1), got {}",
                self.stop_loss_pct
            )));
        }
        let mut fractions = Decimal::ZERO;
        for tp in &self.take_profits {
            if tp.distance_pct <= Decimal::ZERO || tp.close_fraction <= Decimal::ZERO {
                return Err(Error::Validation(
                    "take-profit distance and fraction must be positive".to_string(),
                ));
            }
            fractions += tp.close_fraction;
        }
        if fractions > Decimal::ONE {
            return Err(Error::Validation(format!(
                "take-profit fractions sum to {}, more than the whole position",
                fractions
            )));
        }
        if self.min_quantity < Decimal::ZERO || self.quantity_step < Decimal::ZERO {
            return Err(Error::Validation(
                "quantity limits must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Round `quantity` down to the exchange step
    pub fn floor_to_step(&self, quantity: Decimal) -> Decimal {
        if self.quantity_step <= Decimal::ZERO {
            return quantity;
        }
        (quantity / self.quantity_step).floor() * self.quantity_step
    }

    /// Stop price `stop_loss_pct` against the position
    pub fn stop_loss_for(&self, direction: Direction, entry_price: Decimal) -> Decimal {
        entry_price * (Decimal::ONE - direction.sign() * self.stop_loss_pct)
    }
}

/// Concrete entry derived from a decision
#[derive(Debug, Clone, PartialEq)]
pub struct EntryPlan {
    pub direction: Direction,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub stop_loss: Decimal,
    pub take_profits: Vec<TakeProfitLevel>,
}

/// Size the position and lay out its protective orders
///
/// quantity = balance × risk_per_trade_pct × leverage / entry_price, floored
/// to the quantity step.
pub fn plan_entry(
    config: &RiskConfig,
    direction: Direction,
    entry_price: Decimal,
    balance: Decimal,
) -> Result<EntryPlan> {
    if entry_price <= Decimal::ZERO {
        return Err(Error::Validation(format!(
            "entry price must be positive, got {}",
            entry_price
        )));
    }

    let raw = balance * config.risk_per_trade_pct * config.leverage / entry_price;
    let quantity = config.floor_to_step(raw);
    if quantity <= Decimal::ZERO || quantity < config.min_quantity {
        return Err(Error::Validation(format!(
            "position size {} below minimum {} (balance {})",
            quantity, config.min_quantity, balance
        )));
    }

    Ok(EntryPlan {
        direction,
        entry_price,
        quantity,
        stop_loss: config.stop_loss_for(direction, entry_price),
        take_profits: take_profit_ladder(config, direction, entry_price, quantity),
    })
}

/// Split `quantity` across the configured take-profit rungs
///
/// Rungs below the minimum order size are skipped. A ladder covering the
/// whole position gives the rounding remainder to the last rung.
pub fn take_profit_ladder(
    config: &RiskConfig,
    direction: Direction,
    entry_price: Decimal,
    quantity: Decimal,
) -> Vec<TakeProfitLevel> {
    let sign = direction.sign();
    let mut take_profits = Vec::with_capacity(config.take_profits.len());
    let mut allocated = Decimal::ZERO;
    let mut cumulative_fraction = Decimal::ZERO;

    for (idx, tp) in config.take_profits.iter().enumerate() {
        cumulative_fraction += tp.close_fraction;
        let is_last = idx + 1 == config.take_profits.len();
        let target = if is_last && cumulative_fraction >= Decimal::ONE {
            quantity - allocated
        } else {
            config.floor_to_step(quantity * tp.close_fraction)
        };
        let level_qty = target.min(quantity - allocated);

        if level_qty <= Decimal::ZERO || level_qty < config.min_quantity {
            debug!(
                "[LIFECYCLE] take-profit {} skipped, size {} below minimum",
                idx + 1,
                level_qty
            );
            continue;
        }

        let price = entry_price * (Decimal::ONE + sign * tp.distance_pct);
        take_profits.push(TakeProfitLevel::new(price, level_qty));
        allocated += level_qty;
    }

    take_profits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_plan() {
        let config = RiskConfig::default();
        // 10000 * 0.02 * 10 / 100 = 20
        let plan = plan_entry(&config, Direction::Long, dec!(100), dec!(10000)).unwrap();
        assert_eq!(plan.quantity, dec!(20));
        assert_eq!(plan.stop_loss, dec!(98));
        assert_eq!(plan.take_profits.len(), 2);
        assert_eq!(plan.take_profits[0].price, dec!(102));
        assert_eq!(plan.take_profits[0].quantity, dec!(10));
        assert_eq!(plan.take_profits[1].price, dec!(104));
        assert_eq!(plan.take_profits[1].quantity, dec!(10));
    }

    #[test]
    fn test_ladder_resized_for_partial_fill() {
        let config = RiskConfig {
            quantity_step: dec!(1),
            min_quantity: dec!(1),
            ..Default::default()
        };
        let ladder = take_profit_ladder(&config, Direction::Long, dec!(100), dec!(7));
        assert_eq!(ladder.len(), 2);
        assert_eq!(ladder[0].price, dec!(102));
        assert_eq!(ladder[0].quantity, dec!(3));
        // Remainder lands on the last rung
        assert_eq!(ladder[1].quantity, dec!(4));
    }

    #[test]
    fn test_short_plan_mirrors_levels() {
        let config = RiskConfig::default();
        let plan = plan_entry(&config, Direction::Short, dec!(100), dec!(10000)).unwrap();
        assert_eq!(plan.stop_loss, dec!(102));
        assert_eq!(plan.take_profits[0].price, dec!(98));
        assert_eq!(plan.take_profits[1].price, dec!(96));
    }

    #[test]
    fn test_quantity_floored_to_step() {
        let config = RiskConfig {
            quantity_step: dec!(0.01),
            ..Default::default()
        };
        // 1000 * 0.02 * 10 / 3 = 66.666..
        let plan = plan_entry(&config, Direction::Long, dec!(3), dec!(1000)).unwrap();
        assert_eq!(plan.quantity, dec!(66.66));
        let tp_total: Decimal = plan.take_profits.iter().map(|tp| tp.quantity).sum();
        assert_eq!(tp_total, plan.quantity);
    }

    #[test]
    fn test_below_minimum_rejected() {
        let config = RiskConfig {
            min_quantity: dec!(1),
            ..Default::default()
        };
        let result = plan_entry(&config, Direction::Long, dec!(50000), dec!(100));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_partial_ladder_leaves_runner() {
        let config = RiskConfig {
            take_profits: vec![TakeProfitConfig {
                distance_pct: dec!(0.03),
                close_fraction: dec!(0.5),
            }],
            ..Default::default()
        };
        let plan = plan_entry(&config, Direction::Long, dec!(100), dec!(10000)).unwrap();
        assert_eq!(plan.take_profits.len(), 1);
        assert_eq!(plan.take_profits[0].quantity, dec!(10));
    }

    #[test]
    fn test_validate() {
        assert!(RiskConfig::default().validate().is_ok());
        let bad = RiskConfig {
            stop_loss_pct: Decimal::ZERO,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let overfull = RiskConfig {
            take_profits: vec![
                TakeProfitConfig {
                    distance_pct: dec!(0.01),
                    close_fraction: dec!(0.7),
                },
                TakeProfitConfig {
                    distance_pct: dec!(0.02),
                    close_fraction: dec!(0.7),
                },
            ],
            ..Default::default()
        };
        assert!(overfull.validate().is_err());
    }
}
