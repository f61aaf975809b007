//! Graceful shutdown
//!
//! Shutdown runs in four phases:
//!
//! 1. Close the action queue (new entries and actions are refused)
//! 2. Wait, up to the shutdown timeout, for queued actions to be answered
//!    and for every action task (timed-out ones included) to end
//! 3. Persist the position snapshot and the session record
//! 4. Release every symbol lock
//!
//! A timeout still persists and releases, then reports the failure.

use crate::error::ShutdownError;
use kestrel_order_manager::{ActionQueue, PositionLifecycle};
use kestrel_ports::{Repository, keys};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Process-wide "please stop" flag
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            info!("[SHUTDOWN] shutdown requested");
        }
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the signal has been triggered
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }

    /// Trigger on Ctrl-C
    pub fn listen_for_ctrl_c(&self) -> JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => signal.trigger(),
                Err(e) => error!("[SHUTDOWN] cannot listen for Ctrl-C: {}", e),
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShutdownReport {
    /// Every queued action was answered in time
    pub drained: bool,
    pub pending_actions: usize,
    /// Action tasks still executing when the drain gave up
    pub in_flight_actions: usize,
    pub snapshot_positions: usize,
    pub released_locks: usize,
    pub elapsed: Duration,
}

pub struct GracefulShutdownManager {
    queue: ActionQueue,
    lifecycle: Arc<PositionLifecycle>,
    repository: Arc<dyn Repository>,
    timeout: Duration,
}

impl GracefulShutdownManager {
    pub fn new(
        queue: ActionQueue,
        lifecycle: Arc<PositionLifecycle>,
        repository: Arc<dyn Repository>,
        timeout: Duration,
    ) -> Self {
        Self {
            queue,
            lifecycle,
            repository,
            timeout,
        }
    }

    pub async fn shutdown(&self) -> Result<ShutdownReport, ShutdownError> {
        let started = Instant::now();

        info!("[SHUTDOWN] phase 1: refusing new actions");
        self.queue.close();

        info!(
            "[SHUTDOWN] phase 2: draining {} action(s), up to {:?}",
            self.queue.pending(),
            self.timeout
        );
        let drained = tokio::time::timeout(self.timeout, self.queue.wait_drained())
            .await
            .is_ok();
        let pending_actions = self.queue.pending();
        let in_flight_actions = self.queue.in_flight();
        if !drained {
            warn!(
                "[SHUTDOWN] drain timed out, {} action(s) pending, {} still executing",
                pending_actions, in_flight_actions
            );
        }

        info!("[SHUTDOWN] phase 3: persisting final state");
        let snapshot = self.lifecycle.snapshot();
        let persisted = self.persist(&snapshot).await;

        info!("[SHUTDOWN] phase 4: releasing symbol locks");
        let released_locks = self.lifecycle.locks().release_all();

        let report = ShutdownReport {
            drained,
            pending_actions,
            in_flight_actions,
            snapshot_positions: snapshot.len(),
            released_locks,
            elapsed: started.elapsed(),
        };

        if let Err(e) = persisted {
            error!("[SHUTDOWN] final state not persisted: {}", e);
            return Err(e.into());
        }
        if !drained {
            return Err(ShutdownError::Timeout(report));
        }

        info!(
            "[SHUTDOWN] complete in {:?}: {} position(s) snapshotted",
            report.elapsed, report.snapshot_positions
        );
        Ok(report)
    }

    async fn persist(
        &self,
        snapshot: &[kestrel_core::Position],
    ) -> Result<(), kestrel_ports::RepositoryError> {
        let value = serde_json::to_value(snapshot)?;
        self.repository
            .put_value(keys::POSITIONS_SNAPSHOT, value)
            .await?;

        let mut session = self.lifecycle.session();
        session.finish();
        self.repository.update_session(&session).await?;
        info!(
            "[SHUTDOWN] session {}: {} trade(s), win rate {}, net pnl {}",
            session.id,
            session.trades,
            session.win_rate(),
            session.net_pnl
        );
        Ok(())
    }
}
