//! Analyzer Signal - What analyzers output
//!
//! Analyzers never trade directly. Each one emits a directional opinion with a
//! confidence; the aggregator weighs these opinions into a single decision.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::side::Direction;

/// Relative importance an analyzer attaches to its own signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum SignalPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// One analyzer's directional opinion for the current evaluation cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerSignal {
    /// Analyzer identifier (e.g. "RSI", "MACD")
    pub source: String,
    /// LONG or SHORT
    pub direction: Direction,
    /// Confidence, either on a 0-1 or a 0-100 scale
    pub confidence: Decimal,
    /// Caller-supplied weight, used when the aggregation config has no entry for `source`
    pub weight: Option<Decimal>,
    /// Analyzer-assigned priority
    pub priority: SignalPriority,
    /// When the signal was produced
    pub timestamp: DateTime<Utc>,
}

impl AnalyzerSignal {
    /// Create a new signal
    pub fn new(source: impl Into<String>, direction: Direction, confidence: Decimal) -> Self {
        Self {
            source: source.into(),
            direction,
            confidence,
            weight: None,
            priority: SignalPriority::Normal,
            timestamp: Utc::now(),
        }
    }

    /// Shorthand for a LONG signal
    pub fn long(source: impl Into<String>, confidence: Decimal) -> Self {
        Self::new(source, Direction::Long, confidence)
    }

    /// Shorthand for a SHORT signal
    pub fn short(source: impl Into<String>, confidence: Decimal) -> Self {
        Self::new(source, Direction::Short, confidence)
    }

    /// Builder: Set caller-supplied weight
    pub fn with_weight(mut self, weight: Decimal) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Builder: Set priority
    pub fn with_priority(mut self, priority: SignalPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Confidence on a 0-1 scale
    ///
    /// Values above 1 are read as percentages.
    pub fn normalized_confidence(&self) -> Decimal {
        let value = if self.confidence > Decimal::ONE {
            self.confidence / dec!(100)
        } else {
            self.confidence
        };
        value.clamp(Decimal::ZERO, Decimal::ONE)
    }

    pub fn is_long(&self) -> bool {
        self.direction == Direction::Long
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_creation() {
        let signal = AnalyzerSignal::long("RSI", dec!(0.8))
            .with_weight(dec!(1.5))
            .with_priority(SignalPriority::High);

        assert_eq!(signal.source, "RSI");
        assert!(signal.is_long());
        assert_eq!(signal.weight, Some(dec!(1.5)));
        assert_eq!(signal.priority, SignalPriority::High);
    }

    #[test]
    fn test_percent_confidence_normalized() {
        assert_eq!(
            AnalyzerSignal::long("MACD", dec!(80)).normalized_confidence(),
            dec!(0.8)
        );
        assert_eq!(
            AnalyzerSignal::long("MACD", dec!(100)).normalized_confidence(),
            Decimal::ONE
        );
        assert_eq!(
            AnalyzerSignal::short("EMA", dec!(0.65)).normalized_confidence(),
            dec!(0.65)
        );
    }

    #[test]
    fn test_confidence_clamping() {
        assert_eq!(
            AnalyzerSignal::long("X", dec!(250)).normalized_confidence(),
            Decimal::ONE
        );
        assert_eq!(
            AnalyzerSignal::long("X", dec!(-0.2)).normalized_confidence(),
            Decimal::ZERO
        );
    }
}
