use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::payments::types::PaymentRecord;
use crate::verification::types::VerificationRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NotificationType {
    ChallengeIssued,
    VerificationRequired,
    PaymentSettled,
    PaymentFailed,
}

/// Outbound user notifications. Delivery channels sit outside this service,
/// so for now every notification is a structured log line.
#[derive(Default)]
pub struct NotificationService;

impl NotificationService {
    pub fn new() -> Self {
        Self
    }

    /// Announce that a challenge was sent for `record`. The secret itself
    /// goes only to the delivery channel and is never logged.
    pub async fn challenge_issued(&self, record: &VerificationRecord, channel: &str) {
        info!(
            notification = ?NotificationType::ChallengeIssued,
            verification_id = %record.id,
            instrument_id = %record.instrument_id,
            verification_type = %record.verification_type,
            channel = %channel,
            "NOTIFICATION: verification challenge dispatched"
        );
    }

    pub async fn payment_notification(
        &self,
        payment: &PaymentRecord,
        notification_type: NotificationType,
        message: &str,
    ) {
        match notification_type {
            NotificationType::PaymentFailed => {
                warn!(
                    notification = ?notification_type,
                    payment_id = %payment.id,
                    order_id = %payment.order_id,
                    user_id = %payment.user_id,
                    reason = payment.failure_reason.as_deref().unwrap_or("unknown"),
                    "NOTIFICATION: {}", message
                );
            }
            _ => {
                info!(
                    notification = ?notification_type,
                    payment_id = %payment.id,
                    order_id = %payment.order_id,
                    user_id = %payment.user_id,
                    amount = payment.amount,
                    currency = %payment.currency,
                    "NOTIFICATION: {}", message
                );
            }
        }
    }
}
