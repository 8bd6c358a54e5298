//! Target selectors: pick the conduit for each call and fail calls over
//! to alternate targets.
//!
//! `FailoverTargetSelector` is the retry engine. What differs between
//! the plain, circuit-breaking and load-distributing selectors is a
//! `SelectionPolicy` plugged into it.

pub mod context;
pub mod engine;
pub mod circuit;
pub mod distributor;

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::request::{Exchange, OperationDescriptor, RequestContext};
use crate::strategy::FailoverStrategy;
use crate::transport::{Conduit, ConduitInitiator};

pub use self::circuit::CircuitBreakerPolicy;
pub use self::context::{Alternates, InvocationContext, InvocationKey};
pub use self::engine::SelectorCore;
pub use self::distributor::LoadDistribution;

/// Failover selector that keeps a circuit breaker per address
pub type CircuitBreakerTargetSelector
  = FailoverTargetSelector<CircuitBreakerPolicy>;

/// Selector that picks a target before every call
pub type LoadDistributorTargetSelector
  = FailoverTargetSelector<LoadDistribution>;

/// Replays a call against a newly selected target
#[async_trait]
pub trait Retryable: Send + Sync
{   async fn invoke(
      &self
    , operation: &OperationDescriptor
    , params: &[Value]
    , context: &RequestContext
    , exchange: &mut Exchange
    ) -> Result<Vec<Value>, Error>;
}

/// What an RPC client runtime calls around each dispatch
#[async_trait]
pub trait ConduitSelector: Send + Sync
{   /// Called before the call is dispatched
    fn prepare(&self, exchange: &mut Exchange);

    /// Conduit the call should go through
    fn select_conduit(&self, exchange: &mut Exchange)
      -> Result<Arc<dyn Conduit>, Error>;

    /// Called once the call finished, successfully or not
    async fn complete(&self, exchange: &mut Exchange);

    /// Endpoint calls are currently aimed at
    fn endpoint(&self) -> Arc<Endpoint>;
}

/// Hooks a selector variant can override. Defaults are the plain
/// failover behaviour.
pub trait SelectionPolicy: Send + Sync + 'static
{   /// A strategy was installed
    fn on_strategy(
      &self
    , _core: &SelectorCore
    , _strategy: &Arc<dyn FailoverStrategy>
    ) {}

    fn select_conduit(
      &self
    , core: &SelectorCore
    , exchange: &mut Exchange
    ) -> Result<Arc<dyn Conduit>, Error>
    {   core.select_conduit(exchange)
    }

    fn requires_failover(
      &self
    , core: &SelectorCore
    , exchange: &Exchange
    , error: Option<&Error>
    ) -> bool
    {   core.requires_failover(exchange, error)
    }

    fn failover_target(
      &self
    , core: &SelectorCore
    , exchange: &Exchange
    , invocation: &InvocationContext
    ) -> Option<Arc<Endpoint>>
    {   core.failover_target(exchange, invocation)
    }

    fn on_success(&self, _core: &SelectorCore, _invocation: &InvocationContext) {}

    fn on_failure(
      &self
    , _core: &SelectorCore
    , _invocation: &InvocationContext
    , _error: Option<&Error>
    ) {}
}

/// Plain failover on transport failure
#[derive(Debug, Clone, Copy, Default)]
pub struct Failover;

impl SelectionPolicy for Failover {}

/// Retry engine: fails a call over to an alternate target when a
/// transport level failure is encountered.
///
/// The selector changes its endpoint on the fly, so the client owning it
/// must not share it between concurrent proxies.
pub struct FailoverTargetSelector<P: SelectionPolicy = Failover>
{   core: SelectorCore
  , policy: P
}

impl FailoverTargetSelector<Failover>
{   pub fn new(
      endpoint: Arc<Endpoint>
    , initiator: Arc<dyn ConduitInitiator>
    ) -> Self
    {   FailoverTargetSelector::with_policy(endpoint, initiator, Failover)
    }
}

impl<P: SelectionPolicy> FailoverTargetSelector<P>
{   pub fn with_policy(
      endpoint: Arc<Endpoint>
    , initiator: Arc<dyn ConduitInitiator>
    , policy: P
    ) -> Self
    {   FailoverTargetSelector
        {   core: SelectorCore::new(endpoint, initiator)
          , policy
        }
    }

    pub fn core(&self) -> &SelectorCore
    {   &self.core
    }

    pub fn policy(&self) -> &P
    {   &self.policy
    }

    pub fn set_strategy(&self, strategy: Arc<dyn FailoverStrategy>)
    {   self.core.set_strategy(strategy, |strategy| {
          self.policy.on_strategy(&self.core, strategy)
        });
    }

    pub fn strategy(&self) -> Arc<dyn FailoverStrategy>
    {   self.core.strategy()
    }

    pub fn set_support_not_available_errors_only(&self, support: bool)
    {   self.core.set_support_not_available_errors_only(support);
    }

    pub fn set_client_bootstrap_address(&self, address: Option<String>)
    {   self.core.set_client_bootstrap_address(address);
    }

    fn finish(&self, key: &InvocationKey, exchange: &Exchange)
    {   self.core.remove_invocation(key);
        self.core.do_complete(exchange);
    }
}

#[async_trait]
impl<P: SelectionPolicy> ConduitSelector for FailoverTargetSelector<P>
{   fn prepare(&self, exchange: &mut Exchange)
    {   self.core.prepare(exchange);
    }

    fn select_conduit(&self, exchange: &mut Exchange)
      -> Result<Arc<dyn Conduit>, Error>
    {   self.policy.select_conduit(&self.core, exchange)
    }

    async fn complete(&self, exchange: &mut Exchange)
    {   let key = InvocationKey::of(exchange);
        let Some(invocation) = self.core.invocation(&key)
        else
        {   self.core.do_complete(exchange);
            return;
        };

        let error = exchange.error_if_present();
        if let Some(Error::NoAlternativeAddresses) = error
        {   debug!("No target was available, nothing to record");
            self.finish(&key, exchange);
            return;
        }

        let mut failover = false;
        if self.policy.requires_failover(&self.core, exchange, error.as_ref())
        {   self.policy.on_failure(&self.core, &invocation, error.as_ref());
            let old = exchange.out_message.conduit.take();

            match self.policy.failover_target(&self.core, exchange, &invocation)
            {   Some(target) => {
                  info!("Failing over to {}", target.address());
                  self.core.set_endpoint(target);
                  if let Some(old) = old
                  {   self.core.remove_conduit(&old);
                  }
                  failover = self.core
                    .perform_failover(exchange, &invocation)
                    .await;
                }
              , None => {
                  exchange.remove_property(crate::COMPLETE_IF_SERVICE_NOT_AVAILABLE);
                  self.core.set_original_endpoint(&invocation);
                }
            }
        } else
        {   debug!("Failover not required");
            self.policy.on_success(&self.core, &invocation);
        }

        if !failover
        {   self.finish(&key, exchange);
        }
    }

    fn endpoint(&self) -> Arc<Endpoint>
    {   self.core.endpoint()
    }
}
