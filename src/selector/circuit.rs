//! Failover with a circuit breaker per target address

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use serde_json::Value;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::request::Exchange;
use crate::selector::
{   CircuitBreakerTargetSelector
  , FailoverTargetSelector
  , InvocationContext
  , InvocationKey
  , SelectionPolicy
  , SelectorCore
};
use crate::strategy::FailoverStrategy;
use crate::transport::{Conduit, ConduitInitiator};

pub const DEFAULT_THRESHOLD: u32 = 1;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Routes call outcomes into per-address breakers and steers calls away
/// from addresses whose breaker is open
#[derive(Debug)]
pub struct CircuitBreakerPolicy
{   circuits: CircuitBreakerRegistry
}

impl CircuitBreakerPolicy
{   pub fn new(threshold: u32, timeout: Duration) -> Self
    {   CircuitBreakerPolicy
        {   circuits: CircuitBreakerRegistry::new(threshold, timeout)
        }
    }

    pub fn circuits(&self) -> &CircuitBreakerRegistry
    {   &self.circuits
    }

    pub fn is_failover_required(&self, address: Option<&str>) -> bool
    {   self.circuits.is_failover_required(address)
    }

    fn target_address(invocation: &InvocationContext) -> Option<String>
    {   invocation.context().get_str(crate::ENDPOINT_ADDRESS)
    }
}

impl Default for CircuitBreakerPolicy
{   fn default() -> Self
    {   CircuitBreakerPolicy::new(DEFAULT_THRESHOLD, DEFAULT_TIMEOUT)
    }
}

impl SelectionPolicy for CircuitBreakerPolicy
{   fn on_strategy(
      &self
    , core: &SelectorCore
    , strategy: &Arc<dyn FailoverStrategy>
    )
    {   self.circuits.register(&core.endpoint().address());
        for address in strategy.static_addresses().unwrap_or_default()
        {   self.circuits.register(&address);
        }
    }

    fn select_conduit(
      &self
    , core: &SelectorCore
    , exchange: &mut Exchange
    ) -> Result<Arc<dyn Conduit>, Error>
    {   if let Some(conduit) = exchange.out_message.conduit.clone()
        {   return Ok(conduit);
        }

        let invocation = core.invocation(&InvocationKey::of(exchange));
        let Some(invocation) = invocation
          .filter(|i| !i.context().contains_key(crate::IS_SELECTED))
        else
        {   return core.get_selected_conduit(exchange);
        };

        let address = exchange.out_message.endpoint_address();
        if !self.is_failover_required(address.as_deref())
        {   return core.get_selected_conduit(exchange);
        }

        debug!("Circuit for {:?} is open, looking for another target", address);
        let Some(target) = self.failover_target(core, exchange, &invocation)
        else
        {   error!("None of alternative addresses are available");
            return Err(Error::NoAlternativeAddresses);
        };

        let target_address = target.address();
        if address.as_deref() == Some(target_address.as_str())
        {   return core.get_selected_conduit(exchange);
        }

        core.set_endpoint(target);
        exchange.out_message.set_endpoint_address(target_address.clone());
        core.override_address_property(invocation.context(), &target_address);
        invocation.context().insert(crate::IS_SELECTED, Value::Null);

        let conduit = core.get_selected_conduit(exchange)?;
        core.replace_endpoint_address_property_if_needed(
          exchange
        , &target_address
        , conduit.as_ref()
        );
        Ok(conduit)
    }

    /// Only alternates whose breaker lets requests through are offered
    fn failover_target(
      &self
    , core: &SelectorCore
    , exchange: &Exchange
    , invocation: &InvocationContext
    ) -> Option<Arc<Endpoint>>
    {   if self.circuits.is_empty()
        {   warn!("No circuit breakers registered, no failover target");
            return None;
        }
        let strategy = core.strategy();
        core.update_context_alternatives(&strategy, exchange, invocation);
        invocation.with_alternates(|alternates| {
          if let Some(addresses) = alternates.addresses.as_mut()
          {   addresses.retain(|address| {
                let allowed = self.circuits.get(Some(address)).is_available();
                if !allowed
                {   debug!("Skipping {}, circuit open", address);
                }
                allowed
              });
          }
        });
        core.failover_target(exchange, invocation)
    }

    fn on_success(&self, _core: &SelectorCore, invocation: &InvocationContext)
    {   let address = Self::target_address(invocation);
        self.circuits.get(address.as_deref()).mark_success();
    }

    fn on_failure(
      &self
    , _core: &SelectorCore
    , invocation: &InvocationContext
    , error: Option<&Error>
    )
    {   let address = Self::target_address(invocation);
        self.circuits.get(address.as_deref()).mark_failure(error);
    }
}

impl CircuitBreakerTargetSelector
{   /// Selector with a breaker registered for `endpoint`'s address
    pub fn with_circuit_breaker(
      endpoint: Arc<Endpoint>
    , initiator: Arc<dyn ConduitInitiator>
    , threshold: u32
    , timeout: Duration
    ) -> Self
    {   let policy = CircuitBreakerPolicy::new(threshold, timeout);
        policy.circuits.register(&endpoint.address());
        FailoverTargetSelector::with_policy(endpoint, initiator, policy)
    }

    pub fn circuits(&self) -> &CircuitBreakerRegistry
    {   self.policy().circuits()
    }
}
