pub mod cod;
pub mod http;
pub mod internal;
pub mod sandbox;

pub use cod::CashOnDeliveryGateway;
pub use http::{parse_currency_list, HttpGateway, HttpGatewayConfig};
pub use internal::InternalWalletGateway;
pub use sandbox::SandboxGateway;
