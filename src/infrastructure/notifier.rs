use crate::domain::ports::{TransactionNotification, TransactionNotifier};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

/// Publishes notifications on an in-process queue.
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<TransactionNotification>,
}

impl ChannelNotifier {
    pub fn new(sender: mpsc::UnboundedSender<TransactionNotification>) -> Self {
        Self { sender }
    }

    /// A notifier together with the receiving end of its queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransactionNotification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

#[async_trait]
impl TransactionNotifier for ChannelNotifier {
    async fn notify(&self, notification: TransactionNotification) -> Result<()> {
        debug!(
            transaction_id = %notification.transaction_id,
            status = %notification.status,
            "publishing transaction notification"
        );
        self.sender
            .send(notification)
            .map_err(|_| PaymentError::internal("notification channel closed"))
    }
}
