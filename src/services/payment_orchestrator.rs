//! Payment Orchestrator Service
//!
//! Carries each `PaymentRecord` through
//! `created → initiated → awaiting_verification? → awaiting_gateway_confirmation`
//! and on to exactly one of `settled`, `failed` or `cancelled`. The
//! orchestrator talks to rails only through `GatewayAdapter`, pauses payments
//! whose instrument lacks trust for the amount, and emits a single
//! `payment_settlement` ledger event per settled payment, keyed by the
//! payment id.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::database::error::DatabaseError;
use crate::error::{
    AppError, AppErrorKind, DomainError, InfrastructureError, ValidationError,
};
use crate::ledger::{LedgerStore, TransactionSource, TransactionStatus};
use crate::payments::error::GatewayError;
use crate::payments::registry::GatewayRegistry;
use crate::payments::store::PaymentStore;
use crate::payments::types::{
    CancelAck, FailureCode, GatewayCallback, GatewayOutcome, GatewayRail, PaymentMethodType,
    PaymentRecord, PaymentState, PaymentTransition,
};
use crate::services::notification::{NotificationService, NotificationType};
use crate::services::payment_method_resolver::PaymentMethodResolver;
use crate::services::reward_ingestion::{IngestionError, RewardEvent, RewardIngestionService};
use crate::verification::risk::{verification_type_for, RiskSignals};
use crate::verification::{
    ReviewDecision, StartVerificationRequest, VerificationError, VerificationEvidence,
    VerificationRecord, VerificationService, VerificationStatus, VerificationType,
};

// ============================================================================
// Configuration Types
// ============================================================================

/// Configuration for the payment orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Wait for gateway confirmation on most rails (30 minutes)
    pub confirmation_timeout_secs: i64,
    /// Wait for cash on delivery confirmation (7 days)
    pub cod_confirmation_timeout_secs: i64,
    /// Wait for bank transfer confirmation (3 days)
    pub bank_confirmation_timeout_secs: i64,
    /// Wait for verification when the record carries no expiry of its own
    pub verification_timeout_secs: i64,
    /// Longest a payment may sit in `initiated` (10 minutes)
    pub initiation_timeout_secs: i64,
    /// How often the timeout sweeper runs
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: usize,
    /// Ledger account credited when a request names no merchant
    pub merchant_account: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_secs: 30 * 60,
            cod_confirmation_timeout_secs: 7 * 24 * 3600,
            bank_confirmation_timeout_secs: 3 * 24 * 3600,
            verification_timeout_secs: 30 * 60,
            initiation_timeout_secs: 10 * 60,
            sweep_interval_secs: 60,
            sweep_batch_size: 100,
            merchant_account: "merchant_settlement".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            confirmation_timeout_secs: std::env::var("PAYMENT_CONFIRMATION_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.confirmation_timeout_secs),
            cod_confirmation_timeout_secs: std::env::var("PAYMENT_COD_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.cod_confirmation_timeout_secs),
            bank_confirmation_timeout_secs: std::env::var("PAYMENT_BANK_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bank_confirmation_timeout_secs),
            verification_timeout_secs: std::env::var("PAYMENT_VERIFICATION_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.verification_timeout_secs),
            initiation_timeout_secs: std::env::var("PAYMENT_INITIATION_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.initiation_timeout_secs),
            sweep_interval_secs: std::env::var("PAYMENT_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.sweep_interval_secs),
            sweep_batch_size: std::env::var("PAYMENT_SWEEP_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.sweep_batch_size),
            merchant_account: std::env::var("MERCHANT_LEDGER_ACCOUNT")
                .unwrap_or(defaults.merchant_account),
        }
    }

    pub fn confirmation_timeout_for(&self, rail: GatewayRail) -> Duration {
        let secs = match rail {
            GatewayRail::Cod => self.cod_confirmation_timeout_secs,
            GatewayRail::Bank => self.bank_confirmation_timeout_secs,
            _ => self.confirmation_timeout_secs,
        };
        Duration::seconds(secs)
    }
}

// ============================================================================
// Request / Result Types
// ============================================================================

/// Payment initiation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiatePaymentRequest {
    pub order_id: String,
    pub user_id: String,
    pub amount: i64,
    pub currency: String,
    pub method: PaymentMethodType,
    #[serde(default)]
    pub merchant_id: Option<String>,
    /// Card, account or VPA the risk decision is keyed on.
    #[serde(default)]
    pub instrument_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// UPI address, used if a UPI verification is needed.
    #[serde(default)]
    pub vpa: Option<String>,
    #[serde(default)]
    pub risk_signals: RiskSignals,
}

impl InitiatePaymentRequest {
    pub fn new(
        order_id: impl Into<String>,
        user_id: impl Into<String>,
        amount: i64,
        currency: impl Into<String>,
        method: PaymentMethodType,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            user_id: user_id.into(),
            amount,
            currency: currency.into(),
            method,
            merchant_id: None,
            instrument_id: None,
            idempotency_key: None,
            vpa: None,
            risk_signals: RiskSignals::default(),
        }
    }
}

/// What happened when a gateway outcome reached a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeAction {
    Settled,
    Failed,
    Cancelled,
    StillPending,
    /// Success arrived before the payment could accept it; picked up by a
    /// later poll.
    Deferred,
    /// Payment already terminal; the outcome was dropped.
    Discarded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeDisposition {
    pub payment: PaymentRecord,
    pub action: OutcomeAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationResult {
    pub payment: PaymentRecord,
    /// Present when the request was forwarded to the gateway instead of
    /// being applied locally.
    pub gateway_ack: Option<CancelAck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationProgress {
    pub verification: VerificationRecord,
    pub payments: Vec<PaymentRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub verifications_expired: usize,
    pub verification_timeouts: usize,
    pub gateway_timeouts: usize,
    pub initiation_timeouts: usize,
    /// Payments whose settlement was already in the ledger.
    pub settled_late: usize,
    /// Terminal payments whose settlement ledger entry was resolved here.
    pub ledger_entries_resolved: usize,
}

// ============================================================================
// Orchestrator Error Types
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("payment method {method} unavailable: {reason}")]
    MethodUnavailable { method: String, reason: String },

    #[error("payment {payment_id} not found")]
    PaymentNotFound { payment_id: String },

    #[error("payment {payment_id} cannot move from {from} to {to}")]
    InvalidTransition {
        payment_id: String,
        from: PaymentState,
        to: PaymentState,
    },

    #[error("idempotency key {key} was used for a different payment")]
    IdempotencyConflict { key: String },

    #[error("payment {payment_id} was modified concurrently")]
    Conflict { payment_id: String },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        let kind = match err {
            OrchestratorError::Validation { field, reason } => {
                AppErrorKind::Validation(ValidationError::InvalidField { field, reason })
            }
            OrchestratorError::MethodUnavailable { method, reason } => {
                AppErrorKind::Domain(DomainError::PaymentMethodUnavailable { method, reason })
            }
            OrchestratorError::PaymentNotFound { payment_id } => {
                AppErrorKind::Domain(DomainError::PaymentNotFound { payment_id })
            }
            OrchestratorError::InvalidTransition {
                payment_id,
                from,
                to,
            } => AppErrorKind::Domain(DomainError::InvalidTransition {
                entity: "Payment".to_string(),
                id: payment_id,
                from: from.to_string(),
                to: to.to_string(),
            }),
            OrchestratorError::IdempotencyConflict { key } => {
                AppErrorKind::Domain(DomainError::IdempotencyConflict { key })
            }
            OrchestratorError::Conflict { payment_id } => {
                AppErrorKind::Infrastructure(InfrastructureError::Database {
                    message: format!("payment {} was modified concurrently", payment_id),
                    is_retryable: true,
                })
            }
            OrchestratorError::Gateway(inner) => return inner.into(),
            OrchestratorError::Verification(inner) => return inner.into(),
            OrchestratorError::Ingestion(inner) => return inner.into(),
            OrchestratorError::Storage(inner) => return inner.into(),
        };
        AppError::new(kind)
    }
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

// ============================================================================
// Main Payment Orchestrator
// ============================================================================

pub struct PaymentOrchestrator {
    store: Arc<dyn PaymentStore>,
    registry: Arc<GatewayRegistry>,
    resolver: Arc<PaymentMethodResolver>,
    verification: Arc<VerificationService>,
    ingestion: Arc<RewardIngestionService>,
    ledger: Arc<dyn LedgerStore>,
    notifier: Arc<NotificationService>,
    config: OrchestratorConfig,
}

impl PaymentOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn PaymentStore>,
        registry: Arc<GatewayRegistry>,
        resolver: Arc<PaymentMethodResolver>,
        verification: Arc<VerificationService>,
        ingestion: Arc<RewardIngestionService>,
        ledger: Arc<dyn LedgerStore>,
        notifier: Arc<NotificationService>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            resolver,
            verification,
            ingestion,
            ledger,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn get_payment(&self, payment_id: &str) -> OrchestratorResult<PaymentRecord> {
        self.store
            .get(payment_id)
            .await?
            .ok_or_else(|| OrchestratorError::PaymentNotFound {
                payment_id: payment_id.to_string(),
            })
    }

    pub async fn payments_awaiting_confirmation(
        &self,
        limit: usize,
    ) -> OrchestratorResult<Vec<PaymentRecord>> {
        Ok(self.store.list_awaiting_confirmation(limit).await?)
    }

    // =========================================================================
    // Initiation
    // =========================================================================

    /// Create a payment and hand it to its rail.
    ///
    /// A gateway error during initiation leaves the record in `created` and
    /// is returned to the caller as is. Once the gateway has accepted the
    /// payment, any later error fails the record instead of leaving it in
    /// `initiated`; the `initiated` deadline covers errors that also prevent
    /// that.
    pub async fn initiate_payment(
        &self,
        request: InitiatePaymentRequest,
    ) -> OrchestratorResult<PaymentRecord> {
        validate_request(&request)?;

        let descriptor = self
            .resolver
            .describe(request.method, request.amount, &request.currency)
            .ok_or_else(|| OrchestratorError::MethodUnavailable {
                method: request.method.to_string(),
                reason: format!(
                    "not offered for {}",
                    request.currency.trim().to_uppercase()
                ),
            })?;
        if !descriptor.is_available {
            return Err(OrchestratorError::MethodUnavailable {
                method: request.method.to_string(),
                reason: descriptor
                    .unavailable_reason
                    .unwrap_or_else(|| "currently unavailable".to_string()),
            });
        }

        let adapter = self.registry.adapter_for(request.method)?;

        let record = match self.find_reusable(&request).await? {
            // Initiation never succeeded; retry it on the same record.
            Some(existing) if existing.state == PaymentState::Created => existing,
            Some(existing) => return Ok(existing),
            None => {
                let mut record = PaymentRecord::new(
                    request.order_id.trim(),
                    request.user_id.trim(),
                    request
                        .merchant_id
                        .clone()
                        .unwrap_or_else(|| self.config.merchant_account.clone()),
                    request.amount,
                    request.currency.trim(),
                    request.method,
                );
                record.instrument_id = request.instrument_id.clone();
                record.idempotency_key = request.idempotency_key.clone();
                self.store.insert(&record).await?;

                info!(
                    payment_id = %record.id,
                    order_id = %record.order_id,
                    method = %record.method,
                    rail = %record.rail,
                    amount = record.amount,
                    currency = %record.currency,
                    "Payment created"
                );
                record
            }
        };

        let initiation = match adapter.initiate(&record).await {
            Ok(initiation) => initiation,
            Err(e) => {
                warn!(
                    payment_id = %record.id,
                    rail = %record.rail,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Gateway initiation failed, payment left in created"
                );
                return Err(e.into());
            }
        };

        let reference = initiation.reference.clone();
        let deadline = Utc::now() + Duration::seconds(self.config.initiation_timeout_secs);
        let record = self
            .transition(record, PaymentState::Initiated, None, |r| {
                r.gateway_reference = Some(reference);
                r.deadline_at = Some(deadline);
            })
            .await?;

        let payment_id = record.id.clone();
        match self.route_initiated(record, &request).await {
            Ok(payment) => Ok(payment),
            Err(e) => {
                self.abandon_initiation(&payment_id, &e).await;
                Err(e)
            }
        }
    }

    /// Decide between verification and gateway confirmation for a payment
    /// the gateway has accepted.
    async fn route_initiated(
        &self,
        record: PaymentRecord,
        request: &InitiatePaymentRequest,
    ) -> OrchestratorResult<PaymentRecord> {
        let assessment = self
            .verification
            .assess(&record.effective_instrument(), record.amount, &request.risk_signals)
            .await?;

        if assessment.requires_verification {
            info!(
                payment_id = %record.id,
                instrument_id = %record.effective_instrument(),
                required = %assessment.required,
                current = %assessment.current,
                reasons = ?assessment.reasons,
                "Instrument trust below requirement, verification needed"
            );
            let verification_type = match verification_type_for(record.rail, assessment.required) {
                VerificationType::Upi if request.vpa.is_none() => {
                    verification_type_for(GatewayRail::Internal, assessment.required)
                }
                other => other,
            };
            return self
                .await_verification(record, verification_type, request.vpa.clone())
                .await;
        }

        self.await_confirmation(record, None).await
    }

    /// Fail a payment that an error stranded in `initiated`. Payments that
    /// already moved on keep their own deadline.
    async fn abandon_initiation(&self, payment_id: &str, cause: &OrchestratorError) {
        let record = match self.get_payment(payment_id).await {
            Ok(record) if record.state == PaymentState::Initiated => record,
            Ok(_) => return,
            Err(e) => {
                warn!(
                    payment_id = %payment_id,
                    error = %e,
                    "Could not reload payment after initiation error, left to deadline sweep"
                );
                return;
            }
        };
        let reason = format!("initiation did not complete: {}", cause);
        if let Err(e) = self
            .fail_initiated(record, FailureCode::InitiationIncomplete, reason)
            .await
        {
            warn!(
                payment_id = %payment_id,
                error = %e,
                "Could not fail stranded payment, left to deadline sweep"
            );
        }
    }

    /// Fail a payment the gateway holds but that never reached a waiting
    /// state, then ask the gateway to drop it.
    async fn fail_initiated(
        &self,
        record: PaymentRecord,
        code: FailureCode,
        reason: String,
    ) -> OrchestratorResult<PaymentRecord> {
        let reference = record.gateway_reference.clone();
        let rail = record.rail;
        let payment = self.fail(record, code, reason).await?;

        if let Some(reference) = reference {
            if let Ok(adapter) = self.registry.adapter_for_rail(rail) {
                if let Err(e) = adapter.cancel(&reference).await {
                    warn!(
                        payment_id = %payment.id,
                        reference = %reference,
                        error = %e,
                        "Gateway did not accept cancellation of failed payment"
                    );
                }
            }
        }
        Ok(payment)
    }

    /// Returns the payment already made under the request's idempotency key,
    /// unless that one failed or was cancelled.
    async fn find_reusable(
        &self,
        request: &InitiatePaymentRequest,
    ) -> OrchestratorResult<Option<PaymentRecord>> {
        let Some(key) = request.idempotency_key.as_deref() else {
            return Ok(None);
        };
        let Some(existing) = self.store.find_by_idempotency_key(key).await? else {
            return Ok(None);
        };

        if existing.order_id != request.order_id.trim()
            || existing.amount != request.amount
            || existing.method != request.method
        {
            return Err(OrchestratorError::IdempotencyConflict {
                key: key.to_string(),
            });
        }
        if matches!(existing.state, PaymentState::Failed | PaymentState::Cancelled) {
            info!(
                idempotency_key = %key,
                previous_payment_id = %existing.id,
                previous_state = %existing.state,
                "Previous attempt ended, creating a new payment"
            );
            return Ok(None);
        }

        info!(
            idempotency_key = %key,
            payment_id = %existing.id,
            state = %existing.state,
            "Returning existing payment for idempotency key"
        );
        Ok(Some(existing))
    }

    async fn await_verification(
        &self,
        record: PaymentRecord,
        verification_type: VerificationType,
        vpa: Option<String>,
    ) -> OrchestratorResult<PaymentRecord> {
        let mut start =
            StartVerificationRequest::new(record.effective_instrument(), verification_type)
                .for_payment(record.id.clone());
        start.vpa = vpa;

        let verification = match self.verification.start_verification(start, Utc::now()).await {
            Ok(verification) => verification,
            Err(e) => {
                let reason = format!("could not start verification: {}", e);
                self.fail(record, FailureCode::VerificationFailed, reason).await?;
                return Err(e.into());
            }
        };

        let deadline = verification.expires_at.unwrap_or_else(|| {
            Utc::now() + Duration::seconds(self.config.verification_timeout_secs)
        });
        let verification_id = verification.id.clone();
        let record = self
            .transition(
                record,
                PaymentState::AwaitingVerification,
                Some(format!("{} verification required", verification_type)),
                |r| {
                    r.verification_id = Some(verification_id);
                    r.deadline_at = Some(deadline);
                },
            )
            .await?;

        self.notifier
            .payment_notification(
                &record,
                NotificationType::VerificationRequired,
                "Payment is waiting for instrument verification",
            )
            .await;
        Ok(record)
    }

    /// Move to `awaiting_gateway_confirmation`, then check the rail once in
    /// case the outcome is already known.
    async fn await_confirmation(
        &self,
        record: PaymentRecord,
        reason: Option<String>,
    ) -> OrchestratorResult<PaymentRecord> {
        let deadline = Utc::now() + self.config.confirmation_timeout_for(record.rail);
        let record = self
            .transition(record, PaymentState::AwaitingGatewayConfirmation, reason, |r| {
                r.deadline_at = Some(deadline);
            })
            .await?;

        let adapter = self.registry.adapter_for_rail(record.rail)?;
        let Some(reference) = record.gateway_reference.clone() else {
            return Ok(record);
        };

        match adapter.poll_status(&reference).await {
            Ok(outcome) if outcome.is_final() => {
                Ok(self.apply_outcome(record, outcome).await?.payment)
            }
            Ok(_) => Ok(record),
            Err(e) if adapter.settles_synchronously() => Err(e.into()),
            Err(e) => {
                warn!(
                    payment_id = %record.id,
                    error = %e,
                    "Initial gateway status check failed, awaiting callback"
                );
                Ok(record)
            }
        }
    }

    // =========================================================================
    // Gateway outcomes
    // =========================================================================

    /// Apply a verified gateway callback.
    pub async fn handle_gateway_callback(
        &self,
        callback: GatewayCallback,
    ) -> OrchestratorResult<OutcomeDisposition> {
        let record = self
            .store
            .find_by_gateway_reference(&callback.reference)
            .await?
            .ok_or_else(|| OrchestratorError::PaymentNotFound {
                payment_id: callback.reference.clone(),
            })?;

        info!(
            payment_id = %record.id,
            event_id = %callback.event_id,
            reference = %callback.reference,
            outcome = ?callback.outcome,
            "Gateway callback received"
        );
        self.apply_outcome(record, callback.outcome).await
    }

    /// Ask the rail for the current outcome and apply it.
    pub async fn refresh_from_gateway(
        &self,
        payment_id: &str,
    ) -> OrchestratorResult<OutcomeDisposition> {
        let record = self.get_payment(payment_id).await?;
        if record.state.is_terminal() {
            return self.discard_terminal(record).await;
        }
        let Some(reference) = record.gateway_reference.clone() else {
            return Ok(OutcomeDisposition {
                payment: record,
                action: OutcomeAction::StillPending,
            });
        };

        let adapter = self.registry.adapter_for_rail(record.rail)?;
        let polled = adapter.poll_status(&reference).await;

        let mut touched = record.clone();
        touched.poll_attempts += 1;
        touched.last_polled_at = Some(Utc::now());
        let record = if self.store.compare_and_swap(record.state, &touched).await? {
            touched
        } else {
            self.get_payment(payment_id).await?
        };

        self.apply_outcome(record, polled?).await
    }

    async fn apply_outcome(
        &self,
        record: PaymentRecord,
        outcome: GatewayOutcome,
    ) -> OrchestratorResult<OutcomeDisposition> {
        if record.state.is_terminal() {
            warn!(
                payment_id = %record.id,
                state = %record.state,
                outcome = ?outcome,
                "Gateway outcome for terminal payment discarded"
            );
            return self.discard_terminal(record).await;
        }

        match outcome {
            GatewayOutcome::Pending => Ok(OutcomeDisposition {
                payment: record,
                action: OutcomeAction::StillPending,
            }),
            GatewayOutcome::Succeeded => {
                if record.state != PaymentState::AwaitingGatewayConfirmation {
                    info!(
                        payment_id = %record.id,
                        state = %record.state,
                        "Gateway success deferred until payment awaits confirmation"
                    );
                    return Ok(OutcomeDisposition {
                        payment: record,
                        action: OutcomeAction::Deferred,
                    });
                }
                self.settle(record).await
            }
            GatewayOutcome::Failed { reason } => {
                let payment = self.fail(record, FailureCode::GatewayDeclined, reason).await?;
                Ok(OutcomeDisposition {
                    payment,
                    action: OutcomeAction::Failed,
                })
            }
            GatewayOutcome::Cancelled { reason } => {
                let payment = self
                    .transition(record, PaymentState::Cancelled, Some(reason.clone()), |r| {
                        r.failure_reason = Some(reason);
                        r.failure_code = Some(FailureCode::GatewayCancelled);
                        r.deadline_at = None;
                    })
                    .await?;
                Ok(OutcomeDisposition {
                    payment,
                    action: OutcomeAction::Cancelled,
                })
            }
        }
    }

    /// Settle a payment the gateway confirmed.
    ///
    /// The ledger effect is first written as a pending entry keyed by the
    /// payment id. Only the writer that moves the record to `settled`
    /// completes it; if a failure or cancellation wins instead the entry is
    /// cancelled, so a payment never keeps a settlement it did not reach.
    async fn settle(&self, record: PaymentRecord) -> OrchestratorResult<OutcomeDisposition> {
        let metadata = json!({
            "payment_id": record.id,
            "order_id": record.order_id,
            "method": record.method,
            "gateway_reference": record.gateway_reference,
        });
        let event = if record.rail == GatewayRail::Internal {
            RewardEvent::spend(&record.user_id, record.amount, TransactionSource::PaymentSettlement)
        } else {
            RewardEvent::earn(
                &record.merchant_id,
                record.amount,
                TransactionSource::PaymentSettlement,
            )
        };
        let event = event
            .with_idempotency_key(record.id.clone())
            .with_metadata(metadata)
            .as_pending();

        let hold = match self.ingestion.ingest(event).await {
            Ok(tx) => tx,
            Err(IngestionError::InsufficientFunds { shortfall, .. }) => {
                let payment = self
                    .fail(
                        record,
                        FailureCode::InsufficientFunds,
                        format!("insufficient wallet balance, short by {}", shortfall),
                    )
                    .await?;
                return Ok(OutcomeDisposition {
                    payment,
                    action: OutcomeAction::Failed,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let payment_id = record.id.clone();
        if matches!(
            hold.status,
            TransactionStatus::Cancelled | TransactionStatus::Expired
        ) {
            // An earlier attempt already lost to a failure or cancellation.
            let current = self.get_payment(&payment_id).await?;
            if current.state.is_terminal() {
                return self.discard_lost_settlement(current).await;
            }
            error!(
                payment_id = %payment_id,
                state = %current.state,
                ledger_status = %hold.status,
                "Settlement entry released while payment still open"
            );
            return Err(OrchestratorError::Conflict { payment_id });
        }

        let payment = match self
            .transition(record, PaymentState::Settled, None, |r| {
                r.deadline_at = None;
            })
            .await
        {
            Ok(payment) => payment,
            Err(OrchestratorError::Conflict { .. }) => {
                let current = self.get_payment(&payment_id).await?;
                if current.state.is_terminal() {
                    info!(
                        payment_id = %payment_id,
                        state = %current.state,
                        "Payment reached a terminal state first, settlement entry resolved to match"
                    );
                    return self.discard_lost_settlement(current).await;
                }
                return Err(OrchestratorError::Conflict { payment_id });
            }
            Err(e) => return Err(e),
        };

        info!(
            payment_id = %payment.id,
            ledger_transaction_id = %hold.id,
            ledger_account = %hold.user_id,
            direction = %hold.direction,
            amount = hold.amount,
            "Payment settled"
        );
        self.notifier
            .payment_notification(&payment, NotificationType::PaymentSettled, "Payment settled")
            .await;

        Ok(OutcomeDisposition {
            payment,
            action: OutcomeAction::Settled,
        })
    }

    /// The terminal writer may have synced before this settlement wrote its
    /// entry, so the entry is resolved here whether or not the flag is set.
    async fn discard_lost_settlement(
        &self,
        record: PaymentRecord,
    ) -> OrchestratorResult<OutcomeDisposition> {
        let payment = self.sync_settlement_entry(record).await?;
        Ok(OutcomeDisposition {
            payment,
            action: OutcomeAction::Discarded,
        })
    }

    async fn discard_terminal(&self, record: PaymentRecord) -> OrchestratorResult<OutcomeDisposition> {
        let payment = if record.ledger_sync_pending {
            self.sync_settlement_entry(record).await?
        } else {
            record
        };
        Ok(OutcomeDisposition {
            payment,
            action: OutcomeAction::Discarded,
        })
    }

    /// Bring a terminal payment's settlement ledger entry in line with its
    /// state: completed when settled, cancelled otherwise. Clears
    /// `ledger_sync_pending` once nothing is left pending.
    async fn sync_settlement_entry(&self, record: PaymentRecord) -> OrchestratorResult<PaymentRecord> {
        let entry = self
            .ledger
            .find_transaction(&record.id)
            .await
            .map_err(IngestionError::from)?;

        if let Some(entry) = entry {
            match (record.state, entry.status) {
                (PaymentState::Settled, TransactionStatus::Pending) => {
                    self.ingestion.settle_event(&entry.id).await?;
                    info!(payment_id = %record.id, "Settlement ledger entry completed");
                }
                (PaymentState::Failed | PaymentState::Cancelled, TransactionStatus::Pending) => {
                    self.ingestion.cancel_event(&entry.id).await?;
                    info!(
                        payment_id = %record.id,
                        state = %record.state,
                        "Settlement ledger entry released"
                    );
                }
                (PaymentState::Settled, TransactionStatus::Completed)
                | (
                    PaymentState::Failed | PaymentState::Cancelled,
                    TransactionStatus::Cancelled | TransactionStatus::Expired,
                ) => {}
                (state, status) => {
                    error!(
                        payment_id = %record.id,
                        state = %state,
                        ledger_status = %status,
                        "Settlement ledger entry disagrees with payment state"
                    );
                }
            }
        }

        if !record.ledger_sync_pending {
            return Ok(record);
        }
        let mut synced = record.clone();
        synced.ledger_sync_pending = false;
        synced.updated_at = Utc::now();
        if self.store.compare_and_swap(record.state, &synced).await? {
            Ok(synced)
        } else {
            self.get_payment(&record.id).await
        }
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancel locally before the gateway holds the payment; afterwards the
    /// request is only forwarded and local state waits for the gateway.
    pub async fn cancel_payment(
        &self,
        payment_id: &str,
        reason: Option<String>,
    ) -> OrchestratorResult<CancellationResult> {
        let record = self.get_payment(payment_id).await?;
        let reason = reason.unwrap_or_else(|| "cancelled by user".to_string());

        match record.state {
            PaymentState::Cancelled => Ok(CancellationResult {
                payment: record,
                gateway_ack: None,
            }),
            PaymentState::Settled | PaymentState::Failed => {
                error!(
                    payment_id = %record.id,
                    from_state = %record.state,
                    to_state = %PaymentState::Cancelled,
                    "Invalid payment transition"
                );
                Err(OrchestratorError::InvalidTransition {
                    payment_id: record.id,
                    from: record.state,
                    to: PaymentState::Cancelled,
                })
            }
            PaymentState::AwaitingGatewayConfirmation => {
                let ack = self.forward_cancel(&record).await?;
                info!(
                    payment_id = %record.id,
                    accepted = ack.as_ref().map(|a| a.accepted).unwrap_or(false),
                    "Cancellation forwarded to gateway"
                );
                Ok(CancellationResult {
                    payment: record,
                    gateway_ack: ack,
                })
            }
            PaymentState::Created | PaymentState::Initiated | PaymentState::AwaitingVerification => {
                let reference = record.gateway_reference.clone();
                let rail = record.rail;
                let payment = self
                    .transition(record, PaymentState::Cancelled, Some(reason.clone()), |r| {
                        r.failure_reason = Some(reason);
                        r.failure_code = Some(FailureCode::UserCancelled);
                        r.deadline_at = None;
                    })
                    .await?;

                if let Some(reference) = reference {
                    if let Ok(adapter) = self.registry.adapter_for_rail(rail) {
                        if let Err(e) = adapter.cancel(&reference).await {
                            warn!(
                                payment_id = %payment.id,
                                reference = %reference,
                                error = %e,
                                "Gateway did not accept cancellation of locally cancelled payment"
                            );
                        }
                    }
                }
                Ok(CancellationResult {
                    payment,
                    gateway_ack: None,
                })
            }
        }
    }

    async fn forward_cancel(&self, record: &PaymentRecord) -> OrchestratorResult<Option<CancelAck>> {
        let Some(reference) = record.gateway_reference.as_deref() else {
            return Ok(None);
        };
        let adapter = self.registry.adapter_for_rail(record.rail)?;
        Ok(Some(adapter.cancel(reference).await?))
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Submit evidence for a verification and advance the payments waiting on it.
    pub async fn confirm_verification(
        &self,
        verification_id: &str,
        evidence: VerificationEvidence,
    ) -> OrchestratorResult<VerificationProgress> {
        let result = self
            .verification
            .confirm_verification(verification_id, evidence, Utc::now())
            .await;
        self.after_verification(verification_id, result).await
    }

    /// Apply a KYC reviewer decision and advance the payments waiting on it.
    pub async fn resolve_verification(
        &self,
        verification_id: &str,
        decision: ReviewDecision,
    ) -> OrchestratorResult<VerificationProgress> {
        let result = self
            .verification
            .resolve_review(verification_id, decision, Utc::now())
            .await;
        self.after_verification(verification_id, result).await
    }

    async fn after_verification(
        &self,
        verification_id: &str,
        result: Result<VerificationRecord, VerificationError>,
    ) -> OrchestratorResult<VerificationProgress> {
        let verification = match result {
            Ok(verification) => verification,
            Err(e @ VerificationError::Expired { .. }) | Err(e @ VerificationError::Failed { .. }) => {
                if let Ok(record) = self.verification.get(verification_id).await {
                    self.release_payments(&record).await?;
                }
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let payments = self.release_payments(&verification).await?;
        Ok(VerificationProgress {
            verification,
            payments,
        })
    }

    /// Move payments paused on `verification` according to its status.
    async fn release_payments(
        &self,
        verification: &VerificationRecord,
    ) -> OrchestratorResult<Vec<PaymentRecord>> {
        let waiting = self.store.find_by_verification(&verification.id).await?;
        let mut updated = Vec::with_capacity(waiting.len());

        for record in waiting {
            if record.state != PaymentState::AwaitingVerification {
                updated.push(record);
                continue;
            }
            let record = match verification.status {
                VerificationStatus::Verified => {
                    self.await_confirmation(
                        record,
                        Some(format!("{} verification passed", verification.verification_type)),
                    )
                    .await?
                }
                VerificationStatus::Failed => {
                    let reason = verification
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "verification failed".to_string());
                    self.fail(record, FailureCode::VerificationFailed, reason).await?
                }
                VerificationStatus::Expired => {
                    self.fail(
                        record,
                        FailureCode::VerificationTimeout,
                        "verification expired before completion".to_string(),
                    )
                    .await?
                }
                _ => record,
            };
            updated.push(record);
        }
        Ok(updated)
    }

    // =========================================================================
    // Deadlines
    // =========================================================================

    /// Fail every payment whose waiting state outlived its deadline.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> OrchestratorResult<SweepReport> {
        let mut report = SweepReport::default();
        let limit = self.config.sweep_batch_size.max(1);

        for verification in self.verification.expire_stale(now, limit).await? {
            report.verifications_expired += 1;
            for payment in self.release_payments(&verification).await? {
                if payment.failure_code == Some(FailureCode::VerificationTimeout) {
                    report.verification_timeouts += 1;
                }
            }
        }

        for record in self.store.list_expired(now, limit).await? {
            let payment_id = record.id.clone();
            let result = self.expire_payment(record, &mut report).await;
            if let Err(e) = result {
                warn!(payment_id = %payment_id, error = %e, "Failed to expire payment");
            }
        }

        for record in self.store.list_ledger_sync_pending(limit).await? {
            let payment_id = record.id.clone();
            match self.sync_settlement_entry(record).await {
                Ok(_) => report.ledger_entries_resolved += 1,
                Err(e) => {
                    warn!(payment_id = %payment_id, error = %e, "Failed to resolve settlement ledger entry");
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                verifications_expired = report.verifications_expired,
                verification_timeouts = report.verification_timeouts,
                gateway_timeouts = report.gateway_timeouts,
                initiation_timeouts = report.initiation_timeouts,
                settled_late = report.settled_late,
                ledger_entries_resolved = report.ledger_entries_resolved,
                "Payment deadline sweep finished"
            );
        }
        Ok(report)
    }

    async fn expire_payment(
        &self,
        record: PaymentRecord,
        report: &mut SweepReport,
    ) -> OrchestratorResult<()> {
        match record.state {
            PaymentState::Initiated => {
                self.fail_initiated(
                    record,
                    FailureCode::InitiationIncomplete,
                    "payment never left initiated before the deadline".to_string(),
                )
                .await?;
                report.initiation_timeouts += 1;
            }
            PaymentState::AwaitingGatewayConfirmation => {
                // A settlement that reached the ledger wins over the deadline.
                let entry = self
                    .ledger
                    .find_transaction(&record.id)
                    .await
                    .map_err(IngestionError::from)?;
                if entry.is_some_and(|tx| {
                    matches!(tx.status, TransactionStatus::Pending | TransactionStatus::Completed)
                }) {
                    self.settle(record).await?;
                    report.settled_late += 1;
                    return Ok(());
                }
                let reason = format!(
                    "no gateway confirmation within {} minutes",
                    self.config.confirmation_timeout_for(record.rail).num_minutes()
                );
                self.fail(record, FailureCode::GatewayTimeout, reason).await?;
                report.gateway_timeouts += 1;
            }
            PaymentState::AwaitingVerification => {
                self.fail(
                    record,
                    FailureCode::VerificationTimeout,
                    "verification not completed before the deadline".to_string(),
                )
                .await?;
                report.verification_timeouts += 1;
            }
            _ => {}
        }
        Ok(())
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    async fn fail(
        &self,
        record: PaymentRecord,
        code: FailureCode,
        reason: String,
    ) -> OrchestratorResult<PaymentRecord> {
        let payment = self
            .transition(record, PaymentState::Failed, Some(reason.clone()), |r| {
                r.failure_reason = Some(reason);
                r.failure_code = Some(code);
                r.deadline_at = None;
            })
            .await?;
        self.notifier
            .payment_notification(&payment, NotificationType::PaymentFailed, "Payment failed")
            .await;
        Ok(payment)
    }

    /// Single writer for payment state: checks the state machine, appends the
    /// audit entry and persists with compare-and-swap on the previous state.
    async fn transition<F>(
        &self,
        record: PaymentRecord,
        to: PaymentState,
        reason: Option<String>,
        mutate: F,
    ) -> OrchestratorResult<PaymentRecord>
    where
        F: FnOnce(&mut PaymentRecord),
    {
        let from = record.state;
        if !from.can_transition_to(to) {
            error!(
                payment_id = %record.id,
                from_state = %from,
                to_state = %to,
                "Invalid payment transition"
            );
            return Err(OrchestratorError::InvalidTransition {
                payment_id: record.id,
                from,
                to,
            });
        }

        let now = Utc::now();
        let mut next = record;
        mutate(&mut next);
        next.state = to;
        next.updated_at = now;
        // Settlement entries are only written while awaiting confirmation.
        if from == PaymentState::AwaitingGatewayConfirmation && to.is_terminal() {
            next.ledger_sync_pending = true;
        }
        next.transitions.push(PaymentTransition {
            from,
            to,
            at: now,
            reason: reason.clone(),
        });

        if !self.store.compare_and_swap(from, &next).await? {
            warn!(
                payment_id = %next.id,
                from_state = %from,
                to_state = %to,
                "Payment changed concurrently, transition abandoned"
            );
            return Err(OrchestratorError::Conflict {
                payment_id: next.id,
            });
        }

        info!(
            payment_id = %next.id,
            from_state = %from,
            to_state = %to,
            reason = reason.as_deref().unwrap_or(""),
            "Payment state transition"
        );

        if next.ledger_sync_pending {
            let payment_id = next.id.clone();
            match self.sync_settlement_entry(next.clone()).await {
                Ok(synced) => return Ok(synced),
                Err(e) => warn!(
                    payment_id = %payment_id,
                    error = %e,
                    "Settlement ledger entry left for the sweeper"
                ),
            }
        }
        Ok(next)
    }
}

fn validate_request(request: &InitiatePaymentRequest) -> OrchestratorResult<()> {
    if request.order_id.trim().is_empty() {
        return Err(OrchestratorError::Validation {
            field: "order_id".to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    if request.user_id.trim().is_empty() {
        return Err(OrchestratorError::Validation {
            field: "user_id".to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    if request.amount <= 0 {
        return Err(OrchestratorError::Validation {
            field: "amount".to_string(),
            reason: format!("must be greater than zero, got {}", request.amount),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::config::Environment;
    use crate::database::error::DatabaseErrorKind;
    use crate::ledger::{InMemoryLedgerStore, InMemoryProjectionStore, NewTransaction};
    use crate::payments::gateways::{CashOnDeliveryGateway, InternalWalletGateway, SandboxGateway};
    use crate::payments::store::InMemoryPaymentStore;
    use crate::services::payment_method_resolver::ResolverConfig;
    use crate::services::reward_ingestion::IngestionConfig;
    use crate::verification::challenge::SandboxChallengeIssuer;
    use crate::verification::{
        InMemoryVerificationStore, RiskConfig, VerificationConfig, VerificationStore,
    };

    struct Harness {
        orchestrator: PaymentOrchestrator,
        store: Arc<InMemoryPaymentStore>,
        ledger: Arc<InMemoryLedgerStore>,
        upi: Arc<SandboxGateway>,
        card: Arc<SandboxGateway>,
    }

    /// Verification storage that is down.
    struct UnavailableVerificationStore;

    fn offline() -> DatabaseError {
        DatabaseError::new(DatabaseErrorKind::ConnectionFailed {
            message: "verification store offline".to_string(),
        })
    }

    #[async_trait]
    impl VerificationStore for UnavailableVerificationStore {
        async fn insert(&self, _record: &VerificationRecord) -> Result<(), DatabaseError> {
            Err(offline())
        }

        async fn get(&self, _verification_id: &str) -> Result<Option<VerificationRecord>, DatabaseError> {
            Err(offline())
        }

        async fn compare_and_swap(
            &self,
            _expected: VerificationStatus,
            _record: &VerificationRecord,
        ) -> Result<bool, DatabaseError> {
            Err(offline())
        }

        async fn history(&self, _instrument_id: &str) -> Result<Vec<VerificationRecord>, DatabaseError> {
            Err(offline())
        }

        async fn list_expired(
            &self,
            _now: DateTime<Utc>,
            _limit: usize,
        ) -> Result<Vec<VerificationRecord>, DatabaseError> {
            Err(offline())
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(InMemoryVerificationStore::new()))
    }

    fn harness_with(verifications: Arc<dyn VerificationStore>) -> Harness {
        let inr = vec!["INR".to_string()];
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let upi = Arc::new(SandboxGateway::new(GatewayRail::Upi, inr.clone(), "secret"));
        let card = Arc::new(SandboxGateway::new(GatewayRail::Card3ds, inr.clone(), "secret"));
        let registry = Arc::new(
            GatewayRegistry::new(Environment::Sandbox)
                .with_adapter(Arc::new(InternalWalletGateway::new(ledger.clone(), inr.clone())))
                .with_adapter(Arc::new(CashOnDeliveryGateway::new(inr.clone(), None)))
                .with_adapter(upi.clone())
                .with_adapter(card.clone()),
        );
        let notifier = Arc::new(NotificationService::new());
        let verification = Arc::new(VerificationService::new(
            verifications,
            Arc::new(SandboxChallengeIssuer),
            notifier.clone(),
            VerificationConfig::default(),
            RiskConfig::default(),
        ));
        let ingestion = Arc::new(RewardIngestionService::new(
            ledger.clone(),
            Arc::new(InMemoryProjectionStore::new()),
            IngestionConfig::default(),
        ));
        let store = Arc::new(InMemoryPaymentStore::new());
        let orchestrator = PaymentOrchestrator::new(
            store.clone(),
            registry.clone(),
            Arc::new(PaymentMethodResolver::new(registry, ResolverConfig::default())),
            verification,
            ingestion,
            ledger.clone(),
            notifier,
            OrchestratorConfig::default(),
        );
        Harness {
            orchestrator,
            store,
            ledger,
            upi,
            card,
        }
    }

    #[tokio::test]
    async fn test_upi_payment_settles_once() {
        let h = harness();
        let payment = h
            .orchestrator
            .initiate_payment(InitiatePaymentRequest::new("O1", "u1", 500, "INR", PaymentMethodType::Upi))
            .await
            .unwrap();
        assert_eq!(payment.state, PaymentState::AwaitingGatewayConfirmation);
        assert!(payment.has_entered(PaymentState::Initiated));
        let reference = payment.gateway_reference.clone().unwrap();

        h.upi.complete(&reference, GatewayOutcome::Succeeded);
        let first = h.orchestrator.refresh_from_gateway(&payment.id).await.unwrap();
        assert_eq!(first.action, OutcomeAction::Settled);
        assert_eq!(first.payment.state, PaymentState::Settled);

        let second = h.orchestrator.refresh_from_gateway(&payment.id).await.unwrap();
        assert_eq!(second.action, OutcomeAction::Discarded);

        let log = h.ledger.transaction_log("merchant_settlement").await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].id, payment.id);
        assert_eq!(log[0].amount, 500);
        assert_eq!(log[0].source, TransactionSource::PaymentSettlement);
    }

    #[tokio::test]
    async fn test_gateway_error_leaves_payment_created() {
        let h = harness();
        h.upi.fail_next_initiation();
        let mut request = InitiatePaymentRequest::new("O2", "u1", 500, "INR", PaymentMethodType::Upi);
        request.idempotency_key = Some("idem-o2".to_string());
        let err = h.orchestrator.initiate_payment(request.clone()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Gateway(GatewayError::NetworkError { .. })));

        // The retry resumes the record left in created instead of making another.
        let retried = h.orchestrator.initiate_payment(request.clone()).await.unwrap();
        assert_eq!(retried.transitions[0].from, PaymentState::Created);

        let again = h.orchestrator.initiate_payment(request).await.unwrap();
        assert_eq!(again.id, retried.id);
        assert_eq!(again.state, PaymentState::AwaitingGatewayConfirmation);
    }

    #[tokio::test]
    async fn test_internal_wallet_payment_debits_payer() {
        let h = harness();
        h.ledger
            .apply(NewTransaction::credit("seed-1", "u1", 1_000, TransactionSource::Bonus))
            .await
            .unwrap();

        let payment = h
            .orchestrator
            .initiate_payment(InitiatePaymentRequest::new(
                "O3",
                "u1",
                400,
                "INR",
                PaymentMethodType::Paybill,
            ))
            .await
            .unwrap();
        assert_eq!(payment.state, PaymentState::Settled);
        assert_eq!(h.ledger.get_balance("u1").await.unwrap().available, 600);

        let err = h
            .orchestrator
            .initiate_payment(InitiatePaymentRequest::new(
                "O4",
                "u1",
                700,
                "INR",
                PaymentMethodType::Paybill,
            ))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Gateway(GatewayError::InsufficientFunds { .. })
        ));
    }

    #[tokio::test]
    async fn test_large_card_payment_waits_for_verification() {
        let h = harness();
        let mut request =
            InitiatePaymentRequest::new("O5", "u1", 20_000, "INR", PaymentMethodType::Card);
        request.instrument_id = Some("card_4242".to_string());
        let payment = h.orchestrator.initiate_payment(request).await.unwrap();
        assert_eq!(payment.state, PaymentState::AwaitingVerification);
        let verification_id = payment.verification_id.clone().unwrap();

        let progress = h
            .orchestrator
            .confirm_verification(
                &verification_id,
                VerificationEvidence::Card3ds {
                    result: "Y".to_string(),
                    transaction_id: Some("ds_1".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(progress.verification.status, VerificationStatus::Verified);
        assert_eq!(progress.payments[0].state, PaymentState::AwaitingGatewayConfirmation);

        // Gateway success before verification would have been deferred; now it settles.
        let reference = progress.payments[0].gateway_reference.clone().unwrap();
        h.card.complete(&reference, GatewayOutcome::Succeeded);
        let settled = h.orchestrator.refresh_from_gateway(&payment.id).await.unwrap();
        assert_eq!(settled.payment.state, PaymentState::Settled);
    }

    #[tokio::test]
    async fn test_rejected_verification_fails_payment() {
        let h = harness();
        let payment = h
            .orchestrator
            .initiate_payment(InitiatePaymentRequest::new(
                "O6",
                "u1",
                20_000,
                "INR",
                PaymentMethodType::Card,
            ))
            .await
            .unwrap();
        let progress = h
            .orchestrator
            .confirm_verification(
                payment.verification_id.as_deref().unwrap(),
                VerificationEvidence::Card3ds {
                    result: "R".to_string(),
                    transaction_id: None,
                },
            )
            .await
            .unwrap();
        let failed = &progress.payments[0];
        assert_eq!(failed.state, PaymentState::Failed);
        assert_eq!(failed.failure_code, Some(FailureCode::VerificationFailed));
        assert!(failed.failure_reason.is_some());
    }

    #[tokio::test]
    async fn test_cancel_rules() {
        let h = harness();
        let payment = h
            .orchestrator
            .initiate_payment(InitiatePaymentRequest::new("O7", "u1", 500, "INR", PaymentMethodType::Upi))
            .await
            .unwrap();

        // After the gateway holds it, cancel is only forwarded.
        let forwarded = h.orchestrator.cancel_payment(&payment.id, None).await.unwrap();
        assert_eq!(forwarded.payment.state, PaymentState::AwaitingGatewayConfirmation);
        assert!(forwarded.gateway_ack.unwrap().accepted);

        let refreshed = h.orchestrator.refresh_from_gateway(&payment.id).await.unwrap();
        assert_eq!(refreshed.action, OutcomeAction::Cancelled);
        assert_eq!(refreshed.payment.failure_code, Some(FailureCode::GatewayCancelled));

        let again = h.orchestrator.cancel_payment(&payment.id, None).await.unwrap();
        assert_eq!(again.payment.state, PaymentState::Cancelled);
    }

    #[tokio::test]
    async fn test_sweep_times_out_waiting_payments() {
        let h = harness();
        let payment = h
            .orchestrator
            .initiate_payment(InitiatePaymentRequest::new("O8", "u1", 500, "INR", PaymentMethodType::Upi))
            .await
            .unwrap();

        let report = h
            .orchestrator
            .sweep_expired(Utc::now() + Duration::minutes(31))
            .await
            .unwrap();
        assert_eq!(report.gateway_timeouts, 1);

        let failed = h.orchestrator.get_payment(&payment.id).await.unwrap();
        assert_eq!(failed.state, PaymentState::Failed);
        assert_eq!(failed.failure_code, Some(FailureCode::GatewayTimeout));

        // A late success is discarded.
        h.upi
            .complete(payment.gateway_reference.as_deref().unwrap(), GatewayOutcome::Succeeded);
        let late = h.orchestrator.refresh_from_gateway(&payment.id).await.unwrap();
        assert_eq!(late.action, OutcomeAction::Discarded);
        assert!(h.ledger.find_transaction(&payment.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cod_limits_are_enforced() {
        let h = harness();
        let err = h
            .orchestrator
            .initiate_payment(InitiatePaymentRequest::new(
                "O9",
                "u1",
                90_000,
                "INR",
                PaymentMethodType::Cod,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::MethodUnavailable { .. }));
    }

    async fn awaiting_upi(h: &Harness, order_id: &str) -> PaymentRecord {
        let payment = h
            .orchestrator
            .initiate_payment(InitiatePaymentRequest::new(order_id, "u1", 500, "INR", PaymentMethodType::Upi))
            .await
            .unwrap();
        assert_eq!(payment.state, PaymentState::AwaitingGatewayConfirmation);
        payment
    }

    async fn hold_settlement(h: &Harness, payment: &PaymentRecord) {
        h.orchestrator
            .ingestion
            .ingest(
                RewardEvent::earn("merchant_settlement", payment.amount, TransactionSource::PaymentSettlement)
                    .with_idempotency_key(payment.id.clone())
                    .as_pending(),
            )
            .await
            .unwrap();
    }

    async fn assert_no_settlement_effect(h: &Harness, payment_id: &str) {
        let entry = h.ledger.find_transaction(payment_id).await.unwrap().unwrap();
        assert_eq!(entry.status, TransactionStatus::Cancelled);
        let balance = h.ledger.get_balance("merchant_settlement").await.unwrap();
        assert_eq!(balance.available, 0);
        assert_eq!(balance.pending, 0);
    }

    #[tokio::test]
    async fn test_settlement_after_cancellation_won_is_released() {
        let h = harness();
        let payment = awaiting_upi(&h, "O10").await;
        let stale = payment.clone();

        h.upi.complete(
            payment.gateway_reference.as_deref().unwrap(),
            GatewayOutcome::Cancelled {
                reason: "user abandoned checkout".to_string(),
            },
        );
        let cancelled = h.orchestrator.refresh_from_gateway(&payment.id).await.unwrap();
        assert_eq!(cancelled.action, OutcomeAction::Cancelled);
        assert!(!cancelled.payment.ledger_sync_pending);

        // A success handler that loaded the record before the cancellation.
        let late = h.orchestrator.settle(stale).await.unwrap();
        assert_eq!(late.action, OutcomeAction::Discarded);
        assert_eq!(late.payment.state, PaymentState::Cancelled);
        assert_no_settlement_effect(&h, &payment.id).await;
    }

    #[tokio::test]
    async fn test_failure_winning_over_written_settlement_releases_it() {
        let h = harness();
        let payment = awaiting_upi(&h, "O11").await;
        let stale = payment.clone();

        // The settling writer got as far as its ledger entry.
        hold_settlement(&h, &payment).await;
        assert_eq!(h.ledger.get_balance("merchant_settlement").await.unwrap().pending, 500);

        h.upi.complete(
            payment.gateway_reference.as_deref().unwrap(),
            GatewayOutcome::Failed {
                reason: "issuer declined".to_string(),
            },
        );
        let failed = h.orchestrator.refresh_from_gateway(&payment.id).await.unwrap();
        assert_eq!(failed.action, OutcomeAction::Failed);
        assert!(!failed.payment.ledger_sync_pending);
        assert_no_settlement_effect(&h, &payment.id).await;

        let late = h.orchestrator.settle(stale).await.unwrap();
        assert_eq!(late.action, OutcomeAction::Discarded);
        assert_eq!(late.payment.state, PaymentState::Failed);
        assert_no_settlement_effect(&h, &payment.id).await;
    }

    #[tokio::test]
    async fn test_concurrent_success_and_cancel_leave_one_outcome() {
        let h = Arc::new(harness());
        let payment = awaiting_upi(&h, "O12").await;

        let settling = {
            let h = h.clone();
            let record = payment.clone();
            tokio::spawn(async move { h.orchestrator.settle(record).await })
        };
        let cancelling = {
            let h = h.clone();
            let record = payment.clone();
            tokio::spawn(async move {
                h.orchestrator
                    .apply_outcome(
                        record,
                        GatewayOutcome::Cancelled {
                            reason: "user abandoned checkout".to_string(),
                        },
                    )
                    .await
            })
        };
        let settled = settling.await.unwrap();
        let cancelled = cancelling.await.unwrap();

        let stored = h.orchestrator.get_payment(&payment.id).await.unwrap();
        assert!(stored.state.is_terminal());
        assert!(!stored.ledger_sync_pending);
        let entry = h.ledger.find_transaction(&payment.id).await.unwrap().unwrap();
        let balance = h.ledger.get_balance("merchant_settlement").await.unwrap();
        assert_eq!(balance.pending, 0);
        if stored.state == PaymentState::Settled {
            assert_eq!(settled.unwrap().action, OutcomeAction::Settled);
            assert_eq!(entry.status, TransactionStatus::Completed);
            assert_eq!(balance.available, 500);
        } else {
            assert_eq!(cancelled.unwrap().action, OutcomeAction::Cancelled);
            assert_eq!(entry.status, TransactionStatus::Cancelled);
            assert_eq!(balance.available, 0);
        }
    }

    #[tokio::test]
    async fn test_sweep_resolves_entry_of_interrupted_transition() {
        let h = harness();
        let payment = awaiting_upi(&h, "O13").await;
        hold_settlement(&h, &payment).await;

        // Failed and flagged, but the process stopped before the ledger follow-up.
        let mut interrupted = payment.clone();
        interrupted.state = PaymentState::Failed;
        interrupted.failure_code = Some(FailureCode::GatewayTimeout);
        interrupted.deadline_at = None;
        interrupted.ledger_sync_pending = true;
        assert!(h
            .store
            .compare_and_swap(PaymentState::AwaitingGatewayConfirmation, &interrupted)
            .await
            .unwrap());

        let report = h.orchestrator.sweep_expired(Utc::now()).await.unwrap();
        assert_eq!(report.ledger_entries_resolved, 1);
        assert_no_settlement_effect(&h, &payment.id).await;
        assert!(!h.orchestrator.get_payment(&payment.id).await.unwrap().ledger_sync_pending);

        let again = h.orchestrator.sweep_expired(Utc::now()).await.unwrap();
        assert_eq!(again.ledger_entries_resolved, 0);
    }

    #[tokio::test]
    async fn test_verification_outage_after_initiation_fails_payment() {
        let h = harness_with(Arc::new(UnavailableVerificationStore));
        let mut request = InitiatePaymentRequest::new("O14", "u1", 500, "INR", PaymentMethodType::Upi);
        request.idempotency_key = Some("idem-o14".to_string());

        let err = h.orchestrator.initiate_payment(request).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Verification(_)));

        let payment = h.store.find_by_idempotency_key("idem-o14").await.unwrap().unwrap();
        assert_eq!(payment.state, PaymentState::Failed);
        assert!(payment.has_entered(PaymentState::Initiated));
        assert_eq!(payment.failure_code, Some(FailureCode::InitiationIncomplete));
        assert!(payment.deadline_at.is_none());
    }

    #[tokio::test]
    async fn test_sweep_fails_payment_stranded_in_initiated() {
        let h = harness();
        let now = Utc::now();
        let mut stranded = PaymentRecord::new("O15", "u1", "merchant_settlement", 500, "INR", PaymentMethodType::Upi);
        stranded.state = PaymentState::Initiated;
        stranded.gateway_reference = Some("upi_stranded".to_string());
        stranded.deadline_at = Some(now - Duration::minutes(1));
        h.store.insert(&stranded).await.unwrap();

        let report = h.orchestrator.sweep_expired(now).await.unwrap();
        assert_eq!(report.initiation_timeouts, 1);

        let failed = h.orchestrator.get_payment(&stranded.id).await.unwrap();
        assert_eq!(failed.state, PaymentState::Failed);
        assert_eq!(failed.failure_code, Some(FailureCode::InitiationIncomplete));
    }

    #[tokio::test]
    async fn test_initiated_payment_carries_deadline() {
        let h = harness();
        let payment = awaiting_upi(&h, "O16").await;
        let initiated = payment
            .transitions
            .iter()
            .find(|t| t.to == PaymentState::Initiated)
            .unwrap();
        assert_eq!(initiated.from, PaymentState::Created);
        // The waiting state replaces the initiation deadline with its own.
        assert!(payment.deadline_at.unwrap() > Utc::now() + Duration::minutes(20));
    }
}
