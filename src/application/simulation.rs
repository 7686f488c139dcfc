use super::callback::GatewayCallback;
use super::engine::PaymentRetryEngine;
use crate::domain::ports::TransactionNotification;
use crate::error::{PaymentError, Result};
use crate::infrastructure::clock::ManualClock;
use chrono::TimeDelta;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimulationReport {
    pub passes: usize,
    pub callbacks: usize,
    pub notifications: usize,
    pub dispatched: usize,
    /// `false` when the pass limit was hit with work still open.
    pub settled: bool,
}

/// Drives the engine on a virtual clock until every transaction is resolved.
///
/// Each step delivers queued callbacks, consumes the notifications they
/// produced, moves the clock forward by one poll period and runs the stale
/// sweep and a scheduling pass at the new time.
pub struct Simulation<'a> {
    engine: &'a PaymentRetryEngine,
    clock: ManualClock,
    callbacks: mpsc::UnboundedReceiver<GatewayCallback>,
    notifications: mpsc::UnboundedReceiver<TransactionNotification>,
    step: TimeDelta,
    max_passes: usize,
}

impl<'a> Simulation<'a> {
    pub fn new(
        engine: &'a PaymentRetryEngine,
        clock: ManualClock,
        callbacks: mpsc::UnboundedReceiver<GatewayCallback>,
        notifications: mpsc::UnboundedReceiver<TransactionNotification>,
        max_passes: usize,
    ) -> Result<Self> {
        let step = TimeDelta::from_std(engine.config().poll_period).map_err(|e| {
            PaymentError::ValidationError(format!("poll period out of range: {}", e))
        })?;
        Ok(Self {
            engine,
            clock,
            callbacks,
            notifications,
            step,
            max_passes,
        })
    }

    pub async fn run(&mut self) -> Result<SimulationReport> {
        let mut report = SimulationReport::default();
        loop {
            self.engine.drain().await;
            report.callbacks += self
                .engine
                .callbacks()
                .drain_pending(&mut self.callbacks)
                .await;
            while let Ok(notification) = self.notifications.try_recv() {
                debug!(
                    transaction_id = %notification.transaction_id,
                    status = %notification.status,
                    "transaction notification"
                );
                report.notifications += 1;
            }

            if !self.engine.has_open_work().await? {
                report.settled = true;
                break;
            }
            if report.passes >= self.max_passes {
                break;
            }

            let now = self.clock.advance(self.step);
            let scheduler = self.engine.scheduler();
            scheduler.sweep_stale(now).await?;
            let pass = scheduler.run_once(now).await?;
            report.dispatched += pass.dispatched;
            report.passes += 1;
            debug!(pass = report.passes, %now, dispatched = pass.dispatched, "simulation step");
        }

        info!(
            passes = report.passes,
            callbacks = report.callbacks,
            notifications = report.notifications,
            dispatched = report.dispatched,
            settled = report.settled,
            "simulation finished"
        );
        Ok(report)
    }
}
