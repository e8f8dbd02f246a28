//! Instrument verification: state machine, challenges and risk decision.

pub mod challenge;
pub mod error;
pub mod risk;
pub mod service;
pub mod store;
pub mod types;

pub use error::{VerificationError, VerificationResult};
pub use risk::{risk_decision, RiskAssessment, RiskConfig, RiskSignals};
pub use service::{StartVerificationRequest, VerificationConfig, VerificationService};
pub use store::{InMemoryVerificationStore, VerificationStore};
pub use types::{
    ReviewDecision, VerificationEvidence, VerificationLevel, VerificationRecord,
    VerificationStatus, VerificationType,
};
