//! End-to-end payment flows through the wired application state: initiation,
//! gateway webhooks, verification and settlement into the ledger.

use std::sync::Arc;

use rezpay_backend::api::AppState;
use rezpay_backend::app::{build_state_with_registry, Stores};
use rezpay_backend::config::{AppConfig, Environment};
use rezpay_backend::ledger::{LedgerStore, TransactionSource};
use rezpay_backend::payments::gateways::{
    CashOnDeliveryGateway, InternalWalletGateway, SandboxGateway,
};
use rezpay_backend::payments::registry::GatewayRegistry;
use rezpay_backend::payments::types::{GatewayOutcome, GatewayRail, PaymentMethodType, PaymentState};
use rezpay_backend::services::payment_orchestrator::{InitiatePaymentRequest, OutcomeAction};
use rezpay_backend::services::webhook_processor::WebhookProcessorError;
use rezpay_backend::verification::{VerificationEvidence, VerificationStatus};

struct Harness {
    state: AppState,
    upi: Arc<SandboxGateway>,
    card: Arc<SandboxGateway>,
}

fn harness() -> Harness {
    let config = AppConfig::sandbox();
    let stores = Stores::in_memory();
    let inr = vec!["INR".to_string()];

    let upi = Arc::new(SandboxGateway::new(GatewayRail::Upi, inr.clone(), "upi-secret"));
    let card = Arc::new(SandboxGateway::new(GatewayRail::Card3ds, inr.clone(), "card-secret"));
    let registry = Arc::new(
        GatewayRegistry::new(Environment::Sandbox)
            .with_adapter(Arc::new(InternalWalletGateway::new(
                stores.ledger.clone(),
                inr.clone(),
            )))
            .with_adapter(Arc::new(CashOnDeliveryGateway::new(inr, None)))
            .with_adapter(upi.clone())
            .with_adapter(card.clone()),
    );

    Harness {
        state: build_state_with_registry(&config, stores, registry),
        upi,
        card,
    }
}

async fn settlements_for(state: &AppState, payment_id: &str) -> usize {
    state
        .ledger
        .transaction_log("merchant_settlement")
        .await
        .unwrap()
        .iter()
        .filter(|tx| tx.id == payment_id && tx.source == TransactionSource::PaymentSettlement)
        .count()
}

#[tokio::test]
async fn test_upi_payment_settles_from_gateway_webhook() {
    let h = harness();
    let payment = h
        .state
        .orchestrator
        .initiate_payment(InitiatePaymentRequest::new("O1", "u1", 500, "INR", PaymentMethodType::Upi))
        .await
        .unwrap();
    assert!(payment.has_entered(PaymentState::Initiated));
    assert_eq!(payment.state, PaymentState::AwaitingGatewayConfirmation);

    let reference = payment.gateway_reference.clone().unwrap();
    let (body, signature) = h.upi.signed_callback("evt_1", &reference, &GatewayOutcome::Succeeded);
    let disposition = h
        .state
        .webhooks
        .process_webhook("upi", Some(&signature), &body)
        .await
        .unwrap();

    assert_eq!(disposition.action, OutcomeAction::Settled);
    assert_eq!(disposition.payment.state, PaymentState::Settled);
    assert_eq!(settlements_for(&h.state, &payment.id).await, 1);

    let log = h.state.ledger.transaction_log("merchant_settlement").await.unwrap();
    assert_eq!(log[0].amount, 500);
}

#[tokio::test]
async fn test_duplicate_webhook_is_discarded() {
    let h = harness();
    let payment = h
        .state
        .orchestrator
        .initiate_payment(InitiatePaymentRequest::new("O1", "u1", 500, "INR", PaymentMethodType::Upi))
        .await
        .unwrap();
    let reference = payment.gateway_reference.clone().unwrap();
    let (body, signature) = h.upi.signed_callback("evt_1", &reference, &GatewayOutcome::Succeeded);

    h.state
        .webhooks
        .process_webhook("upi", Some(&signature), &body)
        .await
        .unwrap();
    let err = h
        .state
        .webhooks
        .process_webhook("upi", Some(&signature), &body)
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookProcessorError::AlreadyProcessed));

    // A different event id carrying the same outcome reaches a terminal payment.
    let (body, signature) = h.upi.signed_callback("evt_2", &reference, &GatewayOutcome::Succeeded);
    let late = h
        .state
        .webhooks
        .process_webhook("upi", Some(&signature), &body)
        .await
        .unwrap();
    assert_eq!(late.action, OutcomeAction::Discarded);

    assert_eq!(settlements_for(&h.state, &payment.id).await, 1);
    let balance = h.state.ledger.get_balance("merchant_settlement").await.unwrap();
    assert_eq!(balance.available, 500);
}

#[tokio::test]
async fn test_forged_webhook_is_rejected() {
    let h = harness();
    let payment = h
        .state
        .orchestrator
        .initiate_payment(InitiatePaymentRequest::new("O9", "u1", 500, "INR", PaymentMethodType::Upi))
        .await
        .unwrap();
    let reference = payment.gateway_reference.clone().unwrap();
    let (body, _) = h.upi.signed_callback("evt_1", &reference, &GatewayOutcome::Succeeded);

    let err = h
        .state
        .webhooks
        .process_webhook("upi", Some("deadbeef"), &body)
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookProcessorError::InvalidSignature));

    let err = h
        .state
        .webhooks
        .process_webhook("upi", None, &body)
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookProcessorError::InvalidSignature));

    let current = h.state.orchestrator.get_payment(&payment.id).await.unwrap();
    assert_eq!(current.state, PaymentState::AwaitingGatewayConfirmation);
    assert_eq!(settlements_for(&h.state, &payment.id).await, 0);
}

#[tokio::test]
async fn test_unverified_card_waits_for_verification() {
    let h = harness();
    let mut request =
        InitiatePaymentRequest::new("O5", "u1", 20_000, "INR", PaymentMethodType::Card);
    request.instrument_id = Some("card_4242".to_string());

    let payment = h.state.orchestrator.initiate_payment(request).await.unwrap();
    assert_eq!(payment.state, PaymentState::AwaitingVerification);
    let verification_id = payment.verification_id.clone().unwrap();

    let progress = h
        .state
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
    let advanced = &progress.payments[0];
    assert_eq!(advanced.id, payment.id);
    assert_eq!(advanced.state, PaymentState::AwaitingGatewayConfirmation);

    let reference = advanced.gateway_reference.clone().unwrap();
    let (body, signature) = h.card.signed_callback("evt_c1", &reference, &GatewayOutcome::Succeeded);
    let settled = h
        .state
        .webhooks
        .process_webhook("card_3ds", Some(&signature), &body)
        .await
        .unwrap();
    assert_eq!(settled.payment.state, PaymentState::Settled);
    assert_eq!(settlements_for(&h.state, &payment.id).await, 1);
}

#[tokio::test]
async fn test_gateway_decline_fails_payment_without_settlement() {
    let h = harness();
    let payment = h
        .state
        .orchestrator
        .initiate_payment(InitiatePaymentRequest::new("O7", "u1", 800, "INR", PaymentMethodType::Upi))
        .await
        .unwrap();
    let reference = payment.gateway_reference.clone().unwrap();

    h.upi.complete(
        &reference,
        GatewayOutcome::Failed {
            reason: "do not honor".to_string(),
        },
    );
    let disposition = h
        .state
        .orchestrator
        .refresh_from_gateway(&payment.id)
        .await
        .unwrap();
    assert_eq!(disposition.action, OutcomeAction::Failed);
    assert_eq!(disposition.payment.state, PaymentState::Failed);
    assert!(disposition.payment.failure_code.is_some());
    assert_eq!(settlements_for(&h.state, &payment.id).await, 0);
}
