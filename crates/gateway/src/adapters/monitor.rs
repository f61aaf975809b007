//! Monitoring sinks
//!
//! `LogMonitor` forwards everything to the `log` facade. `CollectingMonitor`
//! keeps what it receives so tests and operators can inspect it afterwards.

use kestrel_core::{ActionResult, Alert, AlertSeverity, HealthTransition, PositionEvent};
use kestrel_ports::MonitoringSink;
use log::{error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};

/// Sink that writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMonitor;

impl MonitoringSink for LogMonitor {
    fn on_action_result(&self, result: &ActionResult) {
        match &result.error {
            None => info!(
                "[MONITOR] {} {} ok {:?}",
                result.action_type, result.symbol, result.metadata
            ),
            Some(err) => warn!(
                "[MONITOR] {} {} failed: {}",
                result.action_type, result.symbol, err
            ),
        }
    }

    fn on_position_event(&self, event: &PositionEvent) {
        match event {
            PositionEvent::Opened(p) => info!(
                "[MONITOR] opened {} {} qty={} entry={} stop={}",
                p.symbol, p.side, p.quantity, p.entry_price, p.stop_loss
            ),
            PositionEvent::Updated(p) => info!(
                "[MONITOR] updated {} qty={} stop={}",
                p.symbol, p.quantity, p.stop_loss
            ),
            PositionEvent::Closed {
                position,
                exit_price,
                reason,
            } => info!(
                "[MONITOR] closed {} at {} ({:?}) pnl={}",
                position.symbol, exit_price, reason, position.realized_pnl
            ),
        }
    }

    fn on_health_transition(&self, transition: &HealthTransition) {
        info!(
            "[MONITOR] health {} {:?} -> {:?} (score {})",
            transition.symbol, transition.from, transition.to, transition.score
        );
    }

    fn on_alert(&self, alert: &Alert) {
        let symbol = alert.symbol.as_deref().unwrap_or("-");
        match alert.severity {
            AlertSeverity::Critical => error!("[ALERT] {} {}", symbol, alert.message),
            AlertSeverity::Warning => warn!("[ALERT] {} {}", symbol, alert.message),
            AlertSeverity::Info => info!("[ALERT] {} {}", symbol, alert.message),
        }
    }
}

#[derive(Debug, Default)]
struct Collected {
    results: Vec<ActionResult>,
    events: Vec<PositionEvent>,
    transitions: Vec<HealthTransition>,
    alerts: Vec<Alert>,
}

/// Sink that records everything it receives
///
/// Clones share the same buffers.
#[derive(Debug, Default, Clone)]
pub struct CollectingMonitor {
    inner: Arc<Mutex<Collected>>,
}

impl CollectingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    // Calls never panic while holding the lock, recover the data if one did
    fn lock(&self) -> MutexGuard<'_, Collected> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn results(&self) -> Vec<ActionResult> {
        self.lock().results.clone()
    }

    pub fn position_events(&self) -> Vec<PositionEvent> {
        self.lock().events.clone()
    }

    pub fn health_transitions(&self) -> Vec<HealthTransition> {
        self.lock().transitions.clone()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.lock().alerts.clone()
    }

    pub fn critical_alerts(&self) -> Vec<Alert> {
        self.lock()
            .alerts
            .iter()
            .filter(|a| a.severity == AlertSeverity::Critical)
            .cloned()
            .collect()
    }
}

impl MonitoringSink for CollectingMonitor {
    fn on_action_result(&self, result: &ActionResult) {
        self.lock().results.push(result.clone());
    }

    fn on_position_event(&self, event: &PositionEvent) {
        self.lock().events.push(event.clone());
    }

    fn on_health_transition(&self, transition: &HealthTransition) {
        self.lock().transitions.push(transition.clone());
    }

    fn on_alert(&self, alert: &Alert) {
        self.lock().alerts.push(alert.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_monitor_shares_buffers() {
        let monitor = CollectingMonitor::new();
        let clone = monitor.clone();

        clone.on_alert(&Alert::critical("BTCUSDT", "manual reconciliation required"));
        clone.on_alert(&Alert::warning("BTCUSDT", "late fill"));

        assert_eq!(monitor.alerts().len(), 2);
        assert_eq!(monitor.critical_alerts().len(), 1);
        assert!(monitor.results().is_empty());
    }

    #[test]
    fn test_log_monitor_accepts_everything() {
        let _ = env_logger::try_init();
        LogMonitor.on_alert(&Alert::warning("ETHUSDT", "test"));
    }
}
