//! Payment Method Resolver
//!
//! Computes the ordered list of payment methods offered for an amount and
//! currency. Internal methods are always offered. External methods appear
//! only when their rail is enabled for the currency. Cash on delivery always
//! appears, greyed out with a reason when it cannot be used.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::config::ConfigError;
use crate::error::{AppError, AppErrorKind, ValidationError};
use crate::payments::registry::GatewayRegistry;
use crate::payments::types::{GatewayKind, GatewayRail, PaymentMethodType};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Listed first whenever it is available.
    pub default_method: Option<PaymentMethodType>,
    /// Processing fee percent per method, e.g. `2.0` for 2%.
    pub fee_percent: HashMap<PaymentMethodType, Decimal>,
    pub cod_enabled: bool,
    pub cod_min_amount: i64,
    pub cod_max_amount: i64,
    /// Limits applied to external gateway methods.
    pub external_min_amount: i64,
    pub external_max_amount: i64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        let fee_percent = HashMap::from([
            (PaymentMethodType::Paybill, Decimal::ZERO),
            (PaymentMethodType::Rezcoins, Decimal::ZERO),
            (PaymentMethodType::Upi, Decimal::ZERO),
            (PaymentMethodType::Card, Decimal::new(20, 1)),
            (PaymentMethodType::Netbanking, Decimal::new(15, 1)),
            (PaymentMethodType::Wallet, Decimal::new(18, 1)),
            (PaymentMethodType::Cod, Decimal::ZERO),
        ]);
        Self {
            default_method: None,
            fee_percent,
            cod_enabled: true,
            cod_min_amount: 100,
            cod_max_amount: 50_000,
            external_min_amount: 1,
            external_max_amount: 10_000_000,
        }
    }
}

impl ResolverConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("PAYMENT_DEFAULT_METHOD") {
            let method = PaymentMethodType::from_str(&raw)
                .map_err(|_| ConfigError::InvalidValue(format!("PAYMENT_DEFAULT_METHOD={}", raw)))?;
            config.default_method = Some(method);
        }

        for method in PaymentMethodType::ALL {
            let key = format!("PAYMENT_FEE_PERCENT_{}", method.as_str().to_uppercase());
            if let Ok(raw) = std::env::var(&key) {
                let percent = Decimal::from_str(raw.trim())
                    .map_err(|_| ConfigError::InvalidValue(key.clone()))?;
                config.fee_percent.insert(method, percent);
            }
        }

        config.cod_enabled = std::env::var("COD_ENABLED")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.cod_enabled);
        config.cod_min_amount = read_amount("COD_MIN_ORDER_AMOUNT", config.cod_min_amount)?;
        config.cod_max_amount = read_amount("COD_MAX_ORDER_AMOUNT", config.cod_max_amount)?;
        config.external_min_amount =
            read_amount("PAYMENT_EXTERNAL_MIN_AMOUNT", config.external_min_amount)?;
        config.external_max_amount =
            read_amount("PAYMENT_EXTERNAL_MAX_AMOUNT", config.external_max_amount)?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (method, percent) in &self.fee_percent {
            if *percent < Decimal::ZERO || *percent > Decimal::ONE_HUNDRED {
                return Err(ConfigError::ValidationFailed(format!(
                    "fee percent for {} must be between 0 and 100",
                    method
                )));
            }
        }
        if self.cod_min_amount < 0 || self.cod_min_amount > self.cod_max_amount {
            return Err(ConfigError::ValidationFailed(
                "COD_MIN_ORDER_AMOUNT must be between 0 and COD_MAX_ORDER_AMOUNT".to_string(),
            ));
        }
        if self.external_min_amount < 0 || self.external_min_amount > self.external_max_amount {
            return Err(ConfigError::ValidationFailed(
                "PAYMENT_EXTERNAL_MIN_AMOUNT must be between 0 and PAYMENT_EXTERNAL_MAX_AMOUNT"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn fee_percent_for(&self, method: PaymentMethodType) -> Decimal {
        self.fee_percent
            .get(&method)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

fn read_amount(key: &str, default: i64) -> Result<i64, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(default),
    }
}

// ============================================================================
// Types
// ============================================================================

/// Caller hints used for the recommendation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub preferred_method: Option<PaymentMethodType>,
    #[serde(default)]
    pub last_used_method: Option<PaymentMethodType>,
}

/// A method as offered for one amount. Computed per request, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethodDescriptor {
    pub id: String,
    pub method_type: PaymentMethodType,
    pub gateway: GatewayKind,
    pub rail: GatewayRail,
    pub is_available: bool,
    pub processing_fee_percent: Decimal,
    /// Fee for the requested amount, minor units.
    pub processing_fee: i64,
    pub min_amount: Option<i64>,
    pub max_amount: Option<i64>,
    pub unavailable_reason: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolverError {
    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("invalid currency code: {0:?}")]
    InvalidCurrency(String),
}

impl From<ResolverError> for AppError {
    fn from(err: ResolverError) -> Self {
        let kind = match &err {
            ResolverError::InvalidAmount(amount) => {
                AppErrorKind::Validation(ValidationError::InvalidAmount {
                    amount: amount.to_string(),
                    reason: err.to_string(),
                })
            }
            ResolverError::InvalidCurrency(_) => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: "currency".to_string(),
                    reason: err.to_string(),
                })
            }
        };
        AppError::new(kind)
    }
}

/// Percent of `amount`, rounded half away from zero.
pub fn processing_fee(amount: i64, percent: Decimal) -> i64 {
    (Decimal::from(amount) * percent / Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(i64::MAX)
}

// ============================================================================
// Resolver
// ============================================================================

pub struct PaymentMethodResolver {
    registry: Arc<GatewayRegistry>,
    config: ResolverConfig,
}

impl PaymentMethodResolver {
    pub fn new(registry: Arc<GatewayRegistry>, config: ResolverConfig) -> Self {
        Self { registry, config }
    }

    /// Methods offered for `amount` in `currency`, best first.
    ///
    /// Availability is re-evaluated on every call.
    pub fn resolve(
        &self,
        amount: i64,
        currency: &str,
        user_ctx: &UserContext,
    ) -> Result<Vec<PaymentMethodDescriptor>, ResolverError> {
        if amount <= 0 {
            return Err(ResolverError::InvalidAmount(amount));
        }
        let currency = currency.trim().to_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ResolverError::InvalidCurrency(currency));
        }

        let mut methods: Vec<PaymentMethodDescriptor> = PaymentMethodType::ALL
            .iter()
            .filter_map(|method| self.describe_method(*method, amount, &currency))
            .collect();

        let default_method = self.config.default_method;
        // Vec::sort_by is stable, so ties keep catalog order.
        methods.sort_by(|a, b| {
            let a_default = Some(a.method_type) == default_method && a.is_available;
            let b_default = Some(b.method_type) == default_method && b.is_available;
            b_default
                .cmp(&a_default)
                .then_with(|| a.processing_fee_percent.cmp(&b.processing_fee_percent))
        });

        debug!(
            amount = amount,
            currency = %currency,
            user_id = user_ctx.user_id.as_deref().unwrap_or(""),
            offered = methods.len(),
            available = methods.iter().filter(|m| m.is_available).count(),
            "Resolved payment methods"
        );

        Ok(methods)
    }

    /// The descriptor for one method, or `None` when it is not offered at all.
    pub fn describe(
        &self,
        method: PaymentMethodType,
        amount: i64,
        currency: &str,
    ) -> Option<PaymentMethodDescriptor> {
        self.describe_method(method, amount, &currency.trim().to_uppercase())
    }

    /// Preference, then last used, then the first available method.
    pub fn recommend<'a>(
        &self,
        methods: &'a [PaymentMethodDescriptor],
        user_ctx: &UserContext,
    ) -> Option<&'a PaymentMethodDescriptor> {
        let available = |wanted: Option<PaymentMethodType>| {
            wanted.and_then(|w| {
                methods
                    .iter()
                    .find(|m| m.method_type == w && m.is_available)
            })
        };
        available(user_ctx.preferred_method)
            .or_else(|| available(user_ctx.last_used_method))
            .or_else(|| methods.iter().find(|m| m.is_available))
    }

    fn describe_method(
        &self,
        method: PaymentMethodType,
        amount: i64,
        currency: &str,
    ) -> Option<PaymentMethodDescriptor> {
        let percent = self.config.fee_percent_for(method);
        let mut descriptor = PaymentMethodDescriptor {
            id: method.as_str().to_string(),
            method_type: method,
            gateway: method.gateway(),
            rail: method.rail(),
            is_available: true,
            processing_fee_percent: percent,
            processing_fee: processing_fee(amount, percent),
            min_amount: None,
            max_amount: None,
            unavailable_reason: None,
        };

        if method.is_internal() {
            return Some(descriptor);
        }

        if method == PaymentMethodType::Cod {
            descriptor.min_amount = Some(self.config.cod_min_amount);
            descriptor.max_amount = Some(self.config.cod_max_amount);
            let reason = if !self.config.cod_enabled || !self.registry.is_enabled(GatewayRail::Cod) {
                Some("Cash on delivery is currently disabled".to_string())
            } else if !self.registry.supports(method, currency) {
                Some(format!("Cash on delivery is not offered in {}", currency))
            } else if amount < self.config.cod_min_amount {
                Some(format!(
                    "Cash on delivery requires an order of at least {}",
                    self.config.cod_min_amount
                ))
            } else if amount > self.config.cod_max_amount {
                Some(format!(
                    "Cash on delivery is limited to orders up to {}",
                    self.config.cod_max_amount
                ))
            } else {
                None
            };
            descriptor.is_available = reason.is_none();
            descriptor.unavailable_reason = reason;
            return Some(descriptor);
        }

        if !self.registry.supports(method, currency) {
            return None;
        }

        descriptor.min_amount = Some(self.config.external_min_amount);
        descriptor.max_amount = Some(self.config.external_max_amount);
        if amount < self.config.external_min_amount || amount > self.config.external_max_amount {
            descriptor.is_available = false;
            descriptor.unavailable_reason = Some(format!(
                "{} accepts amounts between {} and {}",
                method, self.config.external_min_amount, self.config.external_max_amount
            ));
        }
        Some(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::ledger::InMemoryLedgerStore;
    use crate::payments::registry::{GatewayRegistryConfig, RailSettings};

    fn registry(config: &GatewayRegistryConfig) -> Arc<GatewayRegistry> {
        Arc::new(GatewayRegistry::build(config, Arc::new(InMemoryLedgerStore::new())).unwrap())
    }

    fn resolver(config: ResolverConfig) -> PaymentMethodResolver {
        let gateways = GatewayRegistryConfig::defaults(Environment::Sandbox);
        PaymentMethodResolver::new(registry(&gateways), config)
    }

    fn kinds(methods: &[PaymentMethodDescriptor]) -> Vec<PaymentMethodType> {
        methods.iter().map(|m| m.method_type).collect()
    }

    #[test]
    fn test_fee_rounding_is_half_away_from_zero() {
        assert_eq!(processing_fee(1_000, Decimal::new(20, 1)), 20);
        assert_eq!(processing_fee(25, Decimal::new(20, 1)), 1); // 0.5
        assert_eq!(processing_fee(24, Decimal::new(20, 1)), 0); // 0.48
        assert_eq!(processing_fee(75, Decimal::new(20, 1)), 2); // 1.5
    }

    #[test]
    fn test_orders_by_fee_and_keeps_catalog_order_on_ties() {
        let methods = resolver(ResolverConfig::default())
            .resolve(500, "inr", &UserContext::default())
            .unwrap();
        assert_eq!(
            kinds(&methods),
            vec![
                PaymentMethodType::Paybill,
                PaymentMethodType::Rezcoins,
                PaymentMethodType::Upi,
                PaymentMethodType::Cod,
                PaymentMethodType::Netbanking,
                PaymentMethodType::Wallet,
                PaymentMethodType::Card,
            ]
        );
        assert!(methods.iter().all(|m| m.is_available));
        let card = methods.iter().find(|m| m.method_type == PaymentMethodType::Card).unwrap();
        assert_eq!(card.processing_fee, 10);
    }

    #[test]
    fn test_default_method_leads_when_available() {
        let config = ResolverConfig {
            default_method: Some(PaymentMethodType::Card),
            ..Default::default()
        };
        let methods = resolver(config.clone())
            .resolve(500, "INR", &UserContext::default())
            .unwrap();
        assert_eq!(methods[0].method_type, PaymentMethodType::Card);

        // Out-of-range COD never jumps the queue.
        let config = ResolverConfig {
            default_method: Some(PaymentMethodType::Cod),
            ..Default::default()
        };
        let methods = resolver(config)
            .resolve(90_000, "INR", &UserContext::default())
            .unwrap();
        assert_eq!(methods[0].method_type, PaymentMethodType::Paybill);
    }

    #[test]
    fn test_cod_out_of_range_is_greyed_out_not_omitted() {
        let resolver = resolver(ResolverConfig::default());
        let methods = resolver.resolve(50, "INR", &UserContext::default()).unwrap();
        let cod = methods.iter().find(|m| m.method_type == PaymentMethodType::Cod).unwrap();
        assert!(!cod.is_available);
        assert!(cod.unavailable_reason.as_deref().unwrap().contains("at least"));

        let disabled = PaymentMethodResolver::new(
            registry(&GatewayRegistryConfig::defaults(Environment::Sandbox)),
            ResolverConfig {
                cod_enabled: false,
                ..Default::default()
            },
        );
        let methods = disabled.resolve(500, "INR", &UserContext::default()).unwrap();
        let cod = methods.iter().find(|m| m.method_type == PaymentMethodType::Cod).unwrap();
        assert!(!cod.is_available);
    }

    #[test]
    fn test_external_methods_need_enabled_rail_and_currency() {
        let mut gateways = GatewayRegistryConfig::defaults(Environment::Sandbox);
        gateways.rails.insert(
            GatewayRail::Card3ds,
            RailSettings {
                enabled: false,
                currencies: vec!["INR".to_string()],
            },
        );
        let resolver = PaymentMethodResolver::new(registry(&gateways), ResolverConfig::default());

        let methods = resolver.resolve(500, "INR", &UserContext::default()).unwrap();
        assert!(!kinds(&methods).contains(&PaymentMethodType::Card));

        // Internal methods survive an unsupported currency; external ones do not.
        let methods = resolver.resolve(500, "USD", &UserContext::default()).unwrap();
        assert!(kinds(&methods).contains(&PaymentMethodType::Paybill));
        assert!(kinds(&methods).contains(&PaymentMethodType::Rezcoins));
        assert!(!kinds(&methods).contains(&PaymentMethodType::Upi));
    }

    #[test]
    fn test_recommendation_falls_through_stale_preference() {
        let resolver = resolver(ResolverConfig::default());
        let methods = resolver.resolve(90_000, "INR", &UserContext::default()).unwrap();

        let ctx = UserContext {
            user_id: Some("u1".to_string()),
            preferred_method: Some(PaymentMethodType::Cod),
            last_used_method: Some(PaymentMethodType::Upi),
        };
        assert_eq!(
            resolver.recommend(&methods, &ctx).unwrap().method_type,
            PaymentMethodType::Upi
        );

        let ctx = UserContext {
            preferred_method: Some(PaymentMethodType::Cod),
            ..Default::default()
        };
        assert_eq!(
            resolver.recommend(&methods, &ctx).unwrap().method_type,
            PaymentMethodType::Paybill
        );
    }

    #[test]
    fn test_rejects_bad_input() {
        let resolver = resolver(ResolverConfig::default());
        assert!(matches!(
            resolver.resolve(0, "INR", &UserContext::default()),
            Err(ResolverError::InvalidAmount(0))
        ));
        assert!(matches!(
            resolver.resolve(10, "rupees", &UserContext::default()),
            Err(ResolverError::InvalidCurrency(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        assert!(ResolverConfig::default().validate().is_ok());
        let config = ResolverConfig {
            cod_min_amount: 10,
            cod_max_amount: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
