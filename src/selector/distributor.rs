//! Selector that distributes every call across the strategy's targets

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use serde_json::Value;

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::request::Exchange;
use crate::selector::
{   FailoverTargetSelector
  , InvocationContext
  , InvocationKey
  , LoadDistributorTargetSelector
  , SelectionPolicy
  , SelectorCore
};
use crate::strategy::FailoverStrategy;
use crate::transport::{Conduit, ConduitInitiator};

/// Picks a target before each call, not only after a failure.
///
/// The address list is queried from the strategy once, without an
/// exchange, and reused for every call. Strategies that need the exchange
/// to answer are queried per call instead; a sequential strategy then
/// always starts from the head of its list, so calls are no longer
/// spread out.
#[derive(Debug)]
pub struct LoadDistribution
{   failover: AtomicBool
  , address_list: Mutex<Option<Vec<String>>>
}

impl LoadDistribution
{   pub fn new(failover: bool) -> Self
    {   LoadDistribution
        {   failover: AtomicBool::new(failover)
          , address_list: Mutex::new(None)
        }
    }

    /// Whether failed calls are retried elsewhere
    pub fn is_failover(&self) -> bool
    {   self.failover.load(Ordering::Relaxed)
    }

    pub fn set_failover(&self, failover: bool)
    {   self.failover.store(failover, Ordering::Relaxed);
    }

    /// Selector-wide address list, queried without a call context
    fn cached_addresses(
      &self
    , strategy: &Arc<dyn FailoverStrategy>
    ) -> Option<Vec<String>>
    {   let mut address_list = self.address_list.lock();
        if address_list.is_none()
        {   match strategy.alternate_addresses(None)
            {   Ok(addresses) => *address_list = addresses
              , Err(e) => {
                  debug!("Strategy cannot list addresses up front: {}", e);
                }
            }
        }
        address_list.clone()
    }

    /// Target for the next call
    pub fn distribution_target(
      &self
    , core: &SelectorCore
    , exchange: &Exchange
    , invocation: &InvocationContext
    ) -> Option<Arc<Endpoint>>
    {   let strategy = core.strategy();
        let cached = self.cached_addresses(&strategy);
        invocation.with_alternates(|alternates| {
          if !alternates.is_set()
          {   let addresses = cached.or_else(|| {
                strategy
                  .alternate_addresses(Some(exchange))
                  .ok()
                  .flatten()
              });
              match addresses
              {   Some(addresses) => alternates.addresses = Some(addresses)
                , None => {
                    alternates.endpoints = strategy.alternate_endpoints(exchange);
                  }
              }
          }

          match alternates.addresses.as_mut()
          {   Some(addresses) if !addresses.is_empty() => {
                strategy
                  .select_alternate_address(Some(addresses))
                  .map(|address| {
                    let target = core.endpoint();
                    target.set_address(address);
                    target
                  })
              }
            , _ => {
                strategy.select_alternate_endpoint(alternates.endpoints.as_mut())
              }
          }
        })
    }
}

impl Default for LoadDistribution
{   fn default() -> Self
    {   LoadDistribution::new(true)
    }
}

impl SelectionPolicy for LoadDistribution
{   fn on_strategy(
      &self
    , _core: &SelectorCore
    , _strategy: &Arc<dyn FailoverStrategy>
    )
    {   *self.address_list.lock() = None;
    }

    fn select_conduit(
      &self
    , core: &SelectorCore
    , exchange: &mut Exchange
    ) -> Result<Arc<dyn Conduit>, Error>
    {   if let Some(conduit) = exchange.out_message.conduit.clone()
        {   return Ok(conduit);
        }

        let invocation = core.invocation(&InvocationKey::of(exchange))
          .filter(|i| !i.context().contains_key(crate::IS_DISTRIBUTED));
        let target = invocation.as_ref().and_then(|invocation| {
          self.distribution_target(core, exchange, invocation)
        });
        let (Some(invocation), Some(target)) = (invocation, target)
        else
        {   return core.get_selected_conduit(exchange);
        };

        let address = target.address();
        info!("Distributing call {} to {}", exchange.id(), address);
        core.set_endpoint(target);
        exchange.out_message.set_endpoint_address(address.clone());
        exchange.out_message.put(crate::CONDUIT_COMPARE_FULL_URL, true);
        core.override_address_property(invocation.context(), &address);
        invocation.context().insert(crate::IS_DISTRIBUTED, Value::Null);

        let conduit = core.get_selected_conduit(exchange)?;
        core.replace_endpoint_address_property_if_needed(
          exchange
        , &address
        , conduit.as_ref()
        );
        Ok(conduit)
    }

    fn requires_failover(
      &self
    , core: &SelectorCore
    , exchange: &Exchange
    , error: Option<&Error>
    ) -> bool
    {   self.is_failover() && core.requires_failover(exchange, error)
    }

    /// Never hands the call back to the address it just failed on
    fn failover_target(
      &self
    , core: &SelectorCore
    , exchange: &Exchange
    , invocation: &InvocationContext
    ) -> Option<Arc<Endpoint>>
    {   let strategy = core.strategy();
        core.update_context_alternatives(&strategy, exchange, invocation);
        let current = core.endpoint().address();
        invocation.with_alternates(|alternates| {
          if let Some(addresses) = alternates.addresses.as_mut()
          {   addresses.retain(|address| *address != current);
          } else if let Some(endpoints) = alternates.endpoints.as_mut()
          {   endpoints.retain(|endpoint| endpoint.address() != current);
          }
        });
        core.failover_target(exchange, invocation)
    }
}

impl LoadDistributorTargetSelector
{   pub fn with_load_distribution(
      endpoint: Arc<Endpoint>
    , initiator: Arc<dyn ConduitInitiator>
    , failover: bool
    ) -> Self
    {   FailoverTargetSelector::with_policy(
          endpoint
        , initiator
        , LoadDistribution::new(failover)
        )
    }
}

#[cfg(test)]
mod tests
{   use super::*;
    use crate::request::OperationDescriptor;
    use crate::selector::ConduitSelector;
    use crate::strategy::StaticStrategy;
    use crate::transport::http::HttpConduitInitiator;

    fn selector(failover: bool) -> LoadDistributorTargetSelector
    {   LoadDistributorTargetSelector::with_load_distribution(
          Arc::new(Endpoint::new("a", "svc", "soap", "http://a"))
        , Arc::new(HttpConduitInitiator::new(None).unwrap())
        , failover
        )
    }

    fn strategy(addresses: &[&str]) -> Arc<dyn FailoverStrategy>
    {   Arc::new(
          StaticStrategy::sequential()
            .with_alternate_addresses(addresses.iter().map(|a| a.to_string()).collect())
        )
    }

    fn exchange(selector: &LoadDistributorTargetSelector) -> Exchange
    {   let mut exchange = Exchange::new();
        exchange.endpoint = Some(selector.endpoint());
        exchange.operation = Some(OperationDescriptor::new("echo"));
        exchange.out_message.content = Some(vec![]);
        exchange.out_message.set_endpoint_address(selector.endpoint().address());
        selector.prepare(&mut exchange);
        exchange
    }

    #[test]
    fn test_distributes_once_per_call()
    {   let selector = selector(true);
        selector.set_strategy(strategy(&["http://x", "http://y"]));
        let mut exchange = exchange(&selector);

        let conduit = selector.select_conduit(&mut exchange).unwrap();
        assert_eq!(conduit.target(), "http://x");
        assert!(exchange.out_message.is_true(crate::CONDUIT_COMPARE_FULL_URL));

        exchange.out_message.conduit = None;
        selector.select_conduit(&mut exchange).unwrap();
        let invocation = selector.core()
          .invocation(&InvocationKey::of(&exchange))
          .unwrap();
        assert_eq!(invocation.alternate_addresses(), Some(vec!["http://y".to_string()]));
        assert!(invocation.context().contains_key(crate::IS_DISTRIBUTED));
    }

    #[test]
    fn test_new_strategy_resets_address_list()
    {   let selector = selector(true);
        selector.set_strategy(strategy(&["http://x"]));
        let mut first = exchange(&selector);
        assert_eq!(selector.select_conduit(&mut first).unwrap().target(), "http://x");

        selector.set_strategy(strategy(&["http://y"]));
        let mut second = exchange(&selector);
        assert_eq!(selector.select_conduit(&mut second).unwrap().target(), "http://y");
    }

    #[test]
    fn test_failover_flag_gates_retries()
    {   let selector = selector(false);
        let exchange = exchange(&selector);
        let error = Error::Transport("refused".into());

        assert!(!selector.policy().requires_failover(selector.core(), &exchange, Some(&error)));
        selector.policy().set_failover(true);
        assert!(selector.policy().requires_failover(selector.core(), &exchange, Some(&error)));
    }
}
