use crate::application::callback::GatewayCallback;
use crate::domain::classifier::GATEWAY_TIMEOUT;
use crate::domain::ports::{ClockHandle, PaymentGateway};
use crate::domain::transaction::Transaction;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

pub const DEFAULT_SUCCESS_RATE: f64 = 0.7;
pub const DEFAULT_FAILURE_CODES: [&str; 3] =
    ["NETWORK_ERROR", "INSUFFICIENT_FUNDS", GATEWAY_TIMEOUT];

/// A gateway that decides every attempt at random and answers through the
/// callback channel, the way a real gateway answers through its webhook.
pub struct SimulatedGateway {
    callbacks: mpsc::UnboundedSender<GatewayCallback>,
    clock: ClockHandle,
    success_rate: f64,
    failure_codes: Vec<String>,
    rng: Mutex<StdRng>,
}

impl SimulatedGateway {
    /// A `seed` makes the sequence of outcomes reproducible.
    pub fn new(
        callbacks: mpsc::UnboundedSender<GatewayCallback>,
        clock: ClockHandle,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            callbacks,
            clock,
            success_rate: DEFAULT_SUCCESS_RATE,
            failure_codes: DEFAULT_FAILURE_CODES.iter().map(|c| c.to_string()).collect(),
            rng: Mutex::new(rng),
        }
    }

    pub fn with_success_rate(mut self, success_rate: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&success_rate) {
            return Err(PaymentError::ValidationError(format!(
                "success rate must be between 0 and 1, got {}",
                success_rate
            )));
        }
        self.success_rate = success_rate;
        Ok(self)
    }

    pub fn with_failure_codes(mut self, codes: Vec<String>) -> Result<Self> {
        if codes.is_empty() || codes.iter().any(|c| c.trim().is_empty()) {
            return Err(PaymentError::ValidationError(
                "at least one non-empty failure code is required".to_string(),
            ));
        }
        self.failure_codes = codes;
        Ok(self)
    }

    /// `None` means the attempt succeeds.
    fn draw_failure(&self) -> Option<String> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        if rng.gen_bool(self.success_rate) {
            None
        } else {
            self.failure_codes.choose(&mut *rng).cloned()
        }
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn submit_payment(&self, tx: &Transaction) -> Result<()> {
        let reference = tx.external_reference_id.clone().ok_or_else(|| {
            PaymentError::ValidationError(format!(
                "Transaction {} has no external reference",
                tx.id
            ))
        })?;

        let now = self.clock.now();
        let callback = match self.draw_failure() {
            None => GatewayCallback::success(reference, now),
            Some(code) => {
                let message = Some(format!("Simulated failure: {}", code));
                GatewayCallback::failure(reference, code, message, now)
            }
        };
        debug!(transaction_id = %tx.id, callback = ?callback.status, "simulated gateway answered");

        self.callbacks
            .send(callback)
            .map_err(|_| PaymentError::internal("gateway callback channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::callback::CallbackStatus;
    use crate::domain::transaction::Amount;
    use crate::infrastructure::clock::SystemClock;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn submitted() -> Transaction {
        let now = Utc::now();
        let amount = Amount::new(dec!(3.0)).unwrap();
        let mut tx = Transaction::new("user-1", amount, "USD", "DEFAULT_GATEWAY", now).unwrap();
        tx.assign_external_reference("ref-1", now).unwrap();
        tx
    }

    #[tokio::test]
    async fn test_always_succeeds_at_full_rate() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gateway = SimulatedGateway::new(tx, Arc::new(SystemClock), Some(7))
            .with_success_rate(1.0)
            .unwrap();

        gateway.submit_payment(&submitted()).await.unwrap();

        let callback = rx.try_recv().unwrap();
        assert_eq!(callback.status, CallbackStatus::Success);
        assert_eq!(callback.external_reference_id, "ref-1");
    }

    #[tokio::test]
    async fn test_failures_use_configured_codes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gateway = SimulatedGateway::new(tx, Arc::new(SystemClock), Some(7))
            .with_success_rate(0.0)
            .unwrap()
            .with_failure_codes(vec!["CARD_DECLINED".to_string()])
            .unwrap();

        for _ in 0..5 {
            gateway.submit_payment(&submitted()).await.unwrap();
            let callback = rx.try_recv().unwrap();
            assert_eq!(callback.status, CallbackStatus::Failed);
            assert_eq!(callback.error_code.as_deref(), Some("CARD_DECLINED"));
        }
    }

    #[tokio::test]
    async fn test_same_seed_same_outcomes() {
        let outcomes = |seed| async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let gateway = SimulatedGateway::new(tx, Arc::new(SystemClock), Some(seed));
            let mut statuses = Vec::new();
            for _ in 0..20 {
                gateway.submit_payment(&submitted()).await.unwrap();
                statuses.push(rx.try_recv().unwrap().error_code);
            }
            statuses
        };

        assert_eq!(outcomes(42).await, outcomes(42).await);
    }

    #[tokio::test]
    async fn test_closed_channel_is_an_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let gateway = SimulatedGateway::new(tx, Arc::new(SystemClock), None);

        let err = gateway.submit_payment(&submitted()).await.unwrap_err();
        assert!(matches!(err, PaymentError::InternalError(_)));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let gateway = SimulatedGateway::new(tx, Arc::new(SystemClock), None);
        assert!(gateway.with_success_rate(1.5).is_err());

        let (tx, _rx) = mpsc::unbounded_channel();
        let gateway = SimulatedGateway::new(tx, Arc::new(SystemClock), None);
        assert!(gateway.with_failure_codes(vec![]).is_err());
    }
}
