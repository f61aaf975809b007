use kestrel_core::{ActionResult, Alert, HealthTransition, PositionEvent};

/// Port for observability
///
/// Calls are fire-and-forget: implementations must return promptly and never
/// block the caller.
pub trait MonitoringSink: Send + Sync {
    fn on_action_result(&self, result: &ActionResult);

    fn on_position_event(&self, event: &PositionEvent);

    fn on_health_transition(&self, transition: &HealthTransition);

    fn on_alert(&self, alert: &Alert);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMonitor;

impl MonitoringSink for NullMonitor {
    fn on_action_result(&self, _result: &ActionResult) {}

    fn on_position_event(&self, _event: &PositionEvent) {}

    fn on_health_transition(&self, _transition: &HealthTransition) {}

    fn on_alert(&self, _alert: &Alert) {}
}
