use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarse health band derived from a health score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

/// Health level change of an open position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthTransition {
    pub symbol: String,
    pub position_id: Uuid,
    pub from: HealthLevel,
    pub to: HealthLevel,
    pub score: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    /// Needs an operator
    Critical,
}

/// User-visible alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub symbol: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn critical(symbol: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Critical,
            symbol: Some(symbol.into()),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn warning(symbol: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Warning,
            symbol: Some(symbol.into()),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}
