use crate::config::Environment;
use crate::ledger::LedgerStore;
use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::gateway::GatewayAdapter;
use crate::payments::gateways::{
    parse_currency_list, CashOnDeliveryGateway, HttpGateway, InternalWalletGateway, SandboxGateway,
};
use crate::payments::types::{GatewayRail, PaymentMethodType};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RailSettings {
    pub enabled: bool,
    pub currencies: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GatewayRegistryConfig {
    pub environment: Environment,
    pub rails: HashMap<GatewayRail, RailSettings>,
    pub sandbox_secret: String,
    pub cod_callback_secret: Option<String>,
}

impl GatewayRegistryConfig {
    /// Every rail enabled for INR.
    pub fn defaults(environment: Environment) -> Self {
        let rails = GatewayRail::ALL
            .iter()
            .map(|rail| {
                (
                    *rail,
                    RailSettings {
                        enabled: true,
                        currencies: vec!["INR".to_string()],
                    },
                )
            })
            .collect();
        Self {
            environment,
            rails,
            sandbox_secret: "sandbox-callback-secret".to_string(),
            cod_callback_secret: None,
        }
    }

    pub fn from_env(environment: Environment) -> GatewayResult<Self> {
        let mut config = Self::defaults(environment);

        if let Ok(raw) = std::env::var("GATEWAY_ENABLED_RAILS") {
            let mut enabled = Vec::new();
            for part in raw.split(',') {
                let value = part.trim();
                if value.is_empty() {
                    continue;
                }
                enabled.push(GatewayRail::from_str(value)?);
            }
            for (rail, settings) in config.rails.iter_mut() {
                settings.enabled = enabled.contains(rail);
            }
        }

        for (rail, settings) in config.rails.iter_mut() {
            if let Ok(raw) = std::env::var(format!("{}_CURRENCIES", rail.env_prefix())) {
                let currencies = parse_currency_list(&raw);
                if !currencies.is_empty() {
                    settings.currencies = currencies;
                }
            }
        }

        if let Ok(secret) = std::env::var("GATEWAY_SANDBOX_SECRET") {
            config.sandbox_secret = secret;
        }
        config.cod_callback_secret = std::env::var("GATEWAY_COD_CALLBACK_SECRET").ok();
        Ok(config)
    }

    fn settings(&self, rail: GatewayRail) -> Option<&RailSettings> {
        self.rails.get(&rail).filter(|s| s.enabled)
    }
}

/// Maps each enabled rail to the adapter serving it in the current environment.
pub struct GatewayRegistry {
    environment: Environment,
    adapters: HashMap<GatewayRail, Arc<dyn GatewayAdapter>>,
}

impl GatewayRegistry {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            adapters: HashMap::new(),
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn GatewayAdapter>) -> Self {
        self.adapters.insert(adapter.rail(), adapter);
        self
    }

    /// Internal and cash-on-delivery rails are the same everywhere; external
    /// rails get the real HTTP adapter in production and a sandbox otherwise.
    pub fn build(config: &GatewayRegistryConfig, ledger: Arc<dyn LedgerStore>) -> GatewayResult<Self> {
        let mut registry = Self::new(config.environment);

        for rail in GatewayRail::ALL {
            let Some(settings) = config.settings(rail) else {
                continue;
            };
            let adapter: Arc<dyn GatewayAdapter> = match rail {
                GatewayRail::Internal => Arc::new(InternalWalletGateway::new(
                    ledger.clone(),
                    settings.currencies.clone(),
                )),
                GatewayRail::Cod => Arc::new(CashOnDeliveryGateway::new(
                    settings.currencies.clone(),
                    config.cod_callback_secret.clone(),
                )),
                external => match config.environment {
                    Environment::Production => Arc::new(HttpGateway::from_env(external)?),
                    Environment::Sandbox => Arc::new(SandboxGateway::new(
                        external,
                        settings.currencies.clone(),
                        config.sandbox_secret.clone(),
                    )),
                },
            };
            registry = registry.with_adapter(adapter);
        }

        info!(
            environment = %config.environment,
            rails = ?registry.list_rails(),
            "gateway registry built"
        );
        Ok(registry)
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn adapter_for_rail(&self, rail: GatewayRail) -> GatewayResult<Arc<dyn GatewayAdapter>> {
        self.adapters
            .get(&rail)
            .cloned()
            .ok_or_else(|| GatewayError::Unsupported {
                rail: rail.to_string(),
                operation: "payments (rail disabled)".to_string(),
            })
    }

    pub fn adapter_for(&self, method: PaymentMethodType) -> GatewayResult<Arc<dyn GatewayAdapter>> {
        self.adapter_for_rail(method.rail())
    }

    pub fn is_enabled(&self, rail: GatewayRail) -> bool {
        self.adapters.contains_key(&rail)
    }

    pub fn supports(&self, method: PaymentMethodType, currency: &str) -> bool {
        self.adapters
            .get(&method.rail())
            .map(|adapter| adapter.supports_currency(currency))
            .unwrap_or(false)
    }

    pub fn list_rails(&self) -> Vec<GatewayRail> {
        GatewayRail::ALL
            .iter()
            .copied()
            .filter(|rail| self.adapters.contains_key(rail))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedgerStore;

    #[test]
    fn test_sandbox_registry_serves_every_enabled_rail() {
        let config = GatewayRegistryConfig::defaults(Environment::Sandbox);
        let registry = GatewayRegistry::build(&config, Arc::new(InMemoryLedgerStore::new())).unwrap();

        assert_eq!(registry.list_rails().len(), GatewayRail::ALL.len());
        assert!(registry.supports(PaymentMethodType::Upi, "INR"));
        assert!(!registry.supports(PaymentMethodType::Upi, "USD"));
        assert!(registry
            .adapter_for(PaymentMethodType::Rezcoins)
            .unwrap()
            .settles_synchronously());
    }

    #[test]
    fn test_disabled_rail_has_no_adapter() {
        let mut config = GatewayRegistryConfig::defaults(Environment::Sandbox);
        if let Some(settings) = config.rails.get_mut(&GatewayRail::Card3ds) {
            settings.enabled = false;
        }
        let registry = GatewayRegistry::build(&config, Arc::new(InMemoryLedgerStore::new())).unwrap();

        assert!(!registry.is_enabled(GatewayRail::Card3ds));
        assert!(matches!(
            registry.adapter_for(PaymentMethodType::Card),
            Err(GatewayError::Unsupported { .. })
        ));
    }
}
