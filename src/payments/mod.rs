pub mod error;
pub mod gateway;
pub mod gateways;
pub mod registry;
pub mod store;
pub mod types;
pub mod utils;

pub use error::{GatewayError, GatewayResult};
pub use gateway::GatewayAdapter;
pub use registry::{GatewayRegistry, GatewayRegistryConfig};
pub use store::{InMemoryPaymentStore, PaymentStore};
pub use types::{
    FailureCode, GatewayKind, GatewayOutcome, GatewayRail, PaymentMethodType, PaymentRecord,
    PaymentState,
};
