//! Signal Aggregation
//!
//! Turns one evaluation cycle's analyzer signals into a single directional
//! decision.
//!
//! ## Algorithm
//!
//! 1. Signals are split by direction; each side gets a weighted score.
//!    Signals whose effective weight is missing, zero or negative are dropped
//!    from both numerator and denominator (and from the breakdown).
//! 2. Conflict analysis on vote counts: equal counts mean no consensus, a
//!    minority share strictly above `conflict_threshold` means conflict.
//! 3. Otherwise the majority side wins, its average is scaled by the
//!    blind-zone penalty, and the decision is accepted only if both the score
//!    and the adjusted confidence clear their minimums.
//!
//! Aggregation is pure: same signals and config, same result.

use kestrel_core::{AnalyzerSignal, Direction};
use log::debug;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Low-signal-count penalty settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlindZoneConfig {
    pub min_signals_for_long: usize,
    pub min_signals_for_short: usize,
    pub long_penalty: Decimal,
    pub short_penalty: Decimal,
}

impl Default for BlindZoneConfig {
    fn default() -> Self {
        Self {
            min_signals_for_long: 3,
            min_signals_for_short: 2,
            long_penalty: dec!(0.85),
            short_penalty: dec!(0.90),
        }
    }
}

impl BlindZoneConfig {
    /// Penalty factor for a winning side with `count` signals
    pub fn penalty(&self, direction: Direction, count: usize) -> Decimal {
        let (min, penalty) = match direction {
            Direction::Long => (self.min_signals_for_long, self.long_penalty),
            Direction::Short => (self.min_signals_for_short, self.short_penalty),
        };
        if count < min { penalty } else { Decimal::ONE }
    }
}

/// Configuration for signal aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Weight per analyzer source; overrides the signal's own weight
    pub weights: HashMap<String, Decimal>,
    /// Minimum winning-side weighted average (0-1)
    pub min_total_score: Decimal,
    /// Minimum penalty-adjusted confidence (0-1)
    pub min_confidence: Decimal,
    /// Minority share above which the cycle waits
    pub conflict_threshold: Decimal,
    pub blind_zone: Option<BlindZoneConfig>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            weights: HashMap::new(),
            min_total_score: dec!(0.5),
            min_confidence: dec!(0.6),
            conflict_threshold: dec!(0.4),
            blind_zone: None,
        }
    }
}

impl AggregationConfig {
    /// Effective weight for a signal, None when it must be excluded
    fn weight_for(&self, signal: &AnalyzerSignal) -> Option<Decimal> {
        let weight = self
            .weights
            .get(&signal.source)
            .copied()
            .or(signal.weight)?;
        (weight > Decimal::ZERO).then_some(weight)
    }

    /// Blind-zone penalty for the winning side (1.0 without a blind zone)
    pub fn blind_zone_penalty(&self, direction: Direction, count: usize) -> Decimal {
        self.blind_zone
            .as_ref()
            .map(|bz| bz.penalty(direction, count))
            .unwrap_or(Decimal::ONE)
    }
}

/// Weighted score for one side
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightedScore {
    /// Σ(confidence × weight)
    pub total: Decimal,
    /// Σ(confidence × weight) / Σ(weight)
    pub average: Decimal,
    /// Signals that contributed
    pub count: usize,
    /// source -> confidence × weight
    pub breakdown: HashMap<String, Decimal>,
}

impl WeightedScore {
    fn compute<'a>(
        signals: impl Iterator<Item = &'a AnalyzerSignal>,
        config: &AggregationConfig,
    ) -> Self {
        let mut score = WeightedScore::default();
        let mut weight_sum = Decimal::ZERO;

        for signal in signals {
            let Some(weight) = config.weight_for(signal) else {
                continue;
            };
            let contribution = signal.normalized_confidence() * weight;
            score.total += contribution;
            weight_sum += weight;
            score.count += 1;
            *score
                .breakdown
                .entry(signal.source.clone())
                .or_insert(Decimal::ZERO) += contribution;
        }

        if !weight_sum.is_zero() {
            score.average = score.total / weight_sum;
        }
        score
    }
}

/// Vote-count agreement between the two sides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictAnalysis {
    /// Minority share of the votes (0-1)
    pub conflict_level: Decimal,
    /// Majority share of the votes (0-1)
    pub consensus_strength: Decimal,
    pub direction: Option<Direction>,
    pub should_wait: bool,
    pub reasoning: String,
}

impl ConflictAnalysis {
    fn no_signals() -> Self {
        Self {
            conflict_level: Decimal::ZERO,
            consensus_strength: Decimal::ZERO,
            direction: None,
            should_wait: true,
            reasoning: "no signals".to_string(),
        }
    }

    fn analyze(long_count: usize, short_count: usize, threshold: Decimal) -> Self {
        if long_count == 0 && short_count == 0 {
            return Self::no_signals();
        }

        let total = Decimal::from(long_count + short_count);
        let conflict_level = Decimal::from(long_count.min(short_count)) / total;
        let consensus_strength = Decimal::from(long_count.max(short_count)) / total;

        // Equal counts are checked before the threshold
        if long_count == short_count {
            return Self {
                conflict_level,
                consensus_strength,
                direction: None,
                should_wait: true,
                reasoning: format!("NO CONSENSUS ({} LONG vs {} SHORT)", long_count, short_count),
            };
        }

        if conflict_level > threshold {
            return Self {
                conflict_level,
                consensus_strength,
                direction: None,
                should_wait: true,
                reasoning: format!(
                    "CONFLICT DETECTED (level {} > threshold {})",
                    conflict_level.round_dp(4),
                    threshold
                ),
            };
        }

        let direction = if long_count > short_count {
            Direction::Long
        } else {
            Direction::Short
        };
        Self {
            conflict_level,
            consensus_strength,
            direction: Some(direction),
            should_wait: false,
            reasoning: format!(
                "{} consensus {} ({} LONG vs {} SHORT)",
                direction,
                consensus_strength.round_dp(4),
                long_count,
                short_count
            ),
        }
    }
}

/// Output of one aggregation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    /// Accepted direction, None when waiting or below thresholds
    pub direction: Option<Direction>,
    /// Weighted average of the winning side (0-1)
    pub total_score: Decimal,
    /// Penalty-adjusted confidence, capped at 1
    pub confidence: Decimal,
    /// Signals with a positive effective weight
    pub signal_count: usize,
    pub applied_penalty: Decimal,
    /// source -> net contribution, LONG positive and SHORT negative
    ///
    /// A source on both sides that nets to zero is left out; the per-side
    /// figures stay in `long_score` and `short_score`.
    pub analyzer_breakdown: HashMap<String, Decimal>,
    pub conflict_analysis: ConflictAnalysis,
    pub long_score: WeightedScore,
    pub short_score: WeightedScore,
}

impl AggregationResult {
    fn empty() -> Self {
        Self {
            direction: None,
            total_score: Decimal::ZERO,
            confidence: Decimal::ZERO,
            signal_count: 0,
            applied_penalty: Decimal::ONE,
            analyzer_breakdown: HashMap::new(),
            conflict_analysis: ConflictAnalysis::no_signals(),
            long_score: WeightedScore::default(),
            short_score: WeightedScore::default(),
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.direction.is_some()
    }

    /// Score of the given side
    pub fn score_for(&self, direction: Direction) -> &WeightedScore {
        match direction {
            Direction::Long => &self.long_score,
            Direction::Short => &self.short_score,
        }
    }
}

/// Aggregate signals into a decision
pub fn aggregate(signals: &[AnalyzerSignal], config: &AggregationConfig) -> AggregationResult {
    if signals.is_empty() {
        return AggregationResult::empty();
    }

    let long_score = WeightedScore::compute(signals.iter().filter(|s| s.is_long()), config);
    let short_score = WeightedScore::compute(signals.iter().filter(|s| !s.is_long()), config);

    let mut analyzer_breakdown = long_score.breakdown.clone();
    for (source, contribution) in &short_score.breakdown {
        *analyzer_breakdown
            .entry(source.clone())
            .or_insert(Decimal::ZERO) -= *contribution;
    }
    analyzer_breakdown.retain(|_, net| !net.is_zero());

    // Score comparison: ties favour LONG
    let score_winner = if long_score.average >= short_score.average {
        Direction::Long
    } else {
        Direction::Short
    };

    let conflict_analysis =
        ConflictAnalysis::analyze(long_score.count, short_score.count, config.conflict_threshold);
    let signal_count = long_score.count + short_score.count;

    let mut result = AggregationResult {
        direction: None,
        total_score: Decimal::ZERO,
        confidence: Decimal::ZERO,
        signal_count,
        applied_penalty: Decimal::ONE,
        analyzer_breakdown,
        conflict_analysis,
        long_score,
        short_score,
    };

    let Some(direction) = result.conflict_analysis.direction else {
        // Waiting: report the score winner's raw numbers for observability
        let raw = result.score_for(score_winner).average;
        result.total_score = raw;
        result.confidence = raw;
        debug!("[AGG] wait: {}", result.conflict_analysis.reasoning);
        return result;
    };

    let winner = result.score_for(direction);
    let total_score = winner.average;
    let penalty = config.blind_zone_penalty(direction, winner.count);
    let confidence = (total_score * penalty).min(Decimal::ONE);

    result.total_score = total_score;
    result.confidence = confidence;
    result.applied_penalty = penalty;

    if total_score >= config.min_total_score && confidence >= config.min_confidence {
        result.direction = Some(direction);
        debug!(
            "[AGG] {} accepted score={} confidence={} penalty={}",
            direction, total_score, confidence, penalty
        );
    } else {
        debug!(
            "[AGG] {} below thresholds score={} (min {}) confidence={} (min {})",
            direction, total_score, config.min_total_score, confidence, config.min_confidence
        );
    }

    result
}

/// Aggregator bound to one configuration
#[derive(Debug, Clone, Default)]
pub struct SignalAggregator {
    config: AggregationConfig,
}

impl SignalAggregator {
    pub fn new(config: AggregationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    pub fn aggregate(&self, signals: &[AnalyzerSignal]) -> AggregationResult {
        aggregate(signals, &self.config)
    }
}
