//! Configuration for strategies and selectors

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::selector::
{   CircuitBreakerTargetSelector
  , FailoverTargetSelector
  , LoadDistributorTargetSelector
  , SelectionPolicy
};
use crate::strategy::{FailoverStrategy, Selection, StaticStrategy};
use crate::transport::ConduitInitiator;

/// How alternates are picked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionKind
{   #[default]
    Sequential
  , Random
}

impl From<SelectionKind> for Selection
{   fn from(kind: SelectionKind) -> Self
    {   match kind
        {   SelectionKind::Sequential => Selection::Sequential
          , SelectionKind::Random => Selection::Random
        }
    }
}

/// Strategy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig
{   /// Selection among alternates
    pub selection: SelectionKind
  , /// Static alternate addresses; endpoints are scanned when absent
    pub alternate_addresses: Option<Vec<String>>
  , /// Delay before replaying a call, in milliseconds
    pub delay_between_retries_ms: u64
}

impl StrategyConfig
{   pub fn build(&self) -> Arc<dyn FailoverStrategy>
    {   let mut strategy = StaticStrategy::new(self.selection.into())
          .with_delay_between_retries(
            Duration::from_millis(self.delay_between_retries_ms)
          );
        if let Some(addresses) = &self.alternate_addresses
        {   strategy = strategy.with_alternate_addresses(addresses.clone());
        }
        Arc::new(strategy)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig
{   /// Failures before a breaker opens
    pub threshold: u32
  , /// Time a breaker stays open, in milliseconds
    pub timeout_ms: u64
}

impl CircuitBreakerConfig
{   pub fn timeout(&self) -> Duration
    {   Duration::from_millis(self.timeout_ms)
    }
}

impl Default for CircuitBreakerConfig
{   fn default() -> Self
    {   CircuitBreakerConfig
        {   threshold: crate::selector::circuit::DEFAULT_THRESHOLD
          , timeout_ms: crate::selector::circuit::DEFAULT_TIMEOUT
              .as_millis() as u64
        }
    }
}

/// Load distributor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadDistributorConfig
{   /// Retry failed calls on another target
    pub failover: bool
}

impl Default for LoadDistributorConfig
{   fn default() -> Self
    {   LoadDistributorConfig { failover: true }
    }
}

/// Selector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig
{   /// Failover strategy
    pub strategy: StrategyConfig
  , /// Only fail over on "service not available" once a response code
    /// was received
    pub support_not_available_errors_only: bool
  , /// Address that only serves to find the real targets
    pub client_bootstrap_address: Option<String>
  , /// Enable per-address circuit breakers
    pub circuit_breaker: Option<CircuitBreakerConfig>
  , /// Enable per-call load distribution
    pub load_distributor: Option<LoadDistributorConfig>
}

impl Default for FailoverConfig
{   fn default() -> Self
    {   FailoverConfig
        {   strategy: StrategyConfig::default()
          , support_not_available_errors_only: true
          , client_bootstrap_address: None
          , circuit_breaker: None
          , load_distributor: None
        }
    }
}

impl FailoverConfig
{   /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self, Error>
    {   let config: FailoverConfig = serde_json::from_str(json)
          .map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error>
    {   if let Some(circuit_breaker) = &self.circuit_breaker
        {   if circuit_breaker.threshold == 0
            {   return Err(Error::InvalidConfiguration(
                  "circuit breaker threshold must be at least 1".to_string()
                ));
            }
        }
        if self.circuit_breaker.is_some() && self.load_distributor.is_some()
        {   return Err(Error::InvalidConfiguration(
              "circuit breaker and load distributor are exclusive".to_string()
            ));
        }
        if let Some(addresses) = &self.strategy.alternate_addresses
        {   if addresses.iter().any(|a| a.is_empty())
            {   return Err(Error::InvalidConfiguration(
                  "empty alternate address".to_string()
                ));
            }
        }
        Ok(())
    }

    /// Install strategy and flags on an existing selector
    pub fn apply<P: SelectionPolicy>(&self, selector: &FailoverTargetSelector<P>)
    {   debug!("Applying failover configuration: {:?}", self);
        selector.set_strategy(self.strategy.build());
        selector.set_support_not_available_errors_only(
          self.support_not_available_errors_only
        );
        selector.set_client_bootstrap_address(
          self.client_bootstrap_address.clone()
        );
    }

    pub fn failover_selector(
      &self
    , endpoint: Arc<Endpoint>
    , initiator: Arc<dyn ConduitInitiator>
    ) -> Result<FailoverTargetSelector, Error>
    {   self.validate()?;
        let selector = FailoverTargetSelector::new(endpoint, initiator);
        self.apply(&selector);
        Ok(selector)
    }

    pub fn circuit_breaker_selector(
      &self
    , endpoint: Arc<Endpoint>
    , initiator: Arc<dyn ConduitInitiator>
    ) -> Result<CircuitBreakerTargetSelector, Error>
    {   self.validate()?;
        let circuit_breaker = self.circuit_breaker.clone().unwrap_or_default();
        let selector = CircuitBreakerTargetSelector::with_circuit_breaker(
          endpoint
        , initiator
        , circuit_breaker.threshold
        , circuit_breaker.timeout()
        );
        self.apply(&selector);
        Ok(selector)
    }

    pub fn load_distributor_selector(
      &self
    , endpoint: Arc<Endpoint>
    , initiator: Arc<dyn ConduitInitiator>
    ) -> Result<LoadDistributorTargetSelector, Error>
    {   self.validate()?;
        let load_distributor = self.load_distributor.clone().unwrap_or_default();
        let selector = LoadDistributorTargetSelector::with_load_distribution(
          endpoint
        , initiator
        , load_distributor.failover
        );
        self.apply(&selector);
        Ok(selector)
    }
}

#[cfg(test)]
mod tests
{   use super::*;

    #[test]
    fn test_defaults()
    {   let config = FailoverConfig::from_json("{}").unwrap();
        assert!(config.support_not_available_errors_only);
        assert_eq!(config.strategy.selection, SelectionKind::Sequential);
        assert!(config.strategy.alternate_addresses.is_none());
        assert!(config.circuit_breaker.is_none());

        let circuit_breaker = CircuitBreakerConfig::default();
        assert_eq!(circuit_breaker.threshold, 1);
        assert_eq!(circuit_breaker.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_full_config()
    {   let config = FailoverConfig::from_json(r#"{
          "strategy": {
            "selection": "random",
            "alternate_addresses": ["http://b", "http://c"],
            "delay_between_retries_ms": 250
          },
          "support_not_available_errors_only": false,
          "circuit_breaker": { "threshold": 3 }
        }"#).unwrap();

        assert_eq!(config.strategy.selection, SelectionKind::Random);
        assert!(!config.support_not_available_errors_only);
        let circuit_breaker = config.circuit_breaker.unwrap();
        assert_eq!(circuit_breaker.threshold, 3);
        assert_eq!(circuit_breaker.timeout_ms, 60_000);

        let strategy = config.strategy.build();
        assert_eq!(strategy.delay_between_retries(), Duration::from_millis(250));
        assert_eq!(
          strategy.static_addresses()
        , Some(vec!["http://b".to_string(), "http://c".to_string()])
        );
    }

    #[test]
    fn test_rejects_bad_config()
    {   assert!(matches!(
          FailoverConfig::from_json(r#"{"circuit_breaker": {"threshold": 0}}"#)
        , Err(Error::InvalidConfiguration(_))
        ));
        assert!(matches!(
          FailoverConfig::from_json(
            r#"{"circuit_breaker": {}, "load_distributor": {}}"#
          )
        , Err(Error::InvalidConfiguration(_))
        ));
        assert!(matches!(
          FailoverConfig::from_json(r#"{"strategy": {"selection": "roundrobin"}}"#)
        , Err(Error::InvalidConfiguration(_))
        ));
        assert!(matches!(
          FailoverConfig::from_json(r#"{"strategy": {"alternate_addresses": [""]}}"#)
        , Err(Error::InvalidConfiguration(_))
        ));
    }
}
