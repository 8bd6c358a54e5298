//! State and behaviour shared by every target selector

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::request::{Exchange, RequestContext};
use crate::selector::context::{InvocationContext, InvocationKey};
use crate::strategy::{FailoverStrategy, StaticStrategy};
use crate::transport::{Conduit, ConduitInitiator};

/// Endpoint, conduits, strategy and in-flight calls of one selector
pub struct SelectorCore
{   endpoint: RwLock<Arc<Endpoint>>
  , initiator: Arc<dyn ConduitInitiator>
  , conduits: Mutex<Vec<Arc<dyn Conduit>>>
  , strategy: Mutex<Option<Arc<dyn FailoverStrategy>>>
  , in_progress: DashMap<InvocationKey, Arc<InvocationContext>>
  , support_not_available_errors_only: AtomicBool
  , client_bootstrap_address: RwLock<Option<String>>
}

impl SelectorCore
{   pub fn new(
      endpoint: Arc<Endpoint>
    , initiator: Arc<dyn ConduitInitiator>
    ) -> Self
    {   SelectorCore
        {   endpoint: RwLock::new(endpoint)
          , initiator
          , conduits: Mutex::new(vec![])
          , strategy: Mutex::new(None)
          , in_progress: DashMap::new()
          , support_not_available_errors_only: AtomicBool::new(true)
          , client_bootstrap_address: RwLock::new(None)
        }
    }

    // ===== Accessors =====

    pub fn endpoint(&self) -> Arc<Endpoint>
    {   self.endpoint.read().clone()
    }

    pub fn set_endpoint(&self, endpoint: Arc<Endpoint>)
    {   *self.endpoint.write() = endpoint;
    }

    /// Install `strategy`, running `on_set` under the strategy lock
    pub fn set_strategy(
      &self
    , strategy: Arc<dyn FailoverStrategy>
    , on_set: impl FnOnce(&Arc<dyn FailoverStrategy>)
    )
    {   let mut current = self.strategy.lock();
        info!("Using failover strategy {:?}", strategy);
        on_set(&strategy);
        *current = Some(strategy);
    }

    /// Configured strategy, defaulting to a sequential one
    pub fn strategy(&self) -> Arc<dyn FailoverStrategy>
    {   let mut current = self.strategy.lock();
        current
          .get_or_insert_with(|| {
            let strategy: Arc<dyn FailoverStrategy>
              = Arc::new(StaticStrategy::sequential());
            info!("Using failover strategy {:?}", strategy);
            strategy
          })
          .clone()
    }

    pub fn delay_between_retries(&self) -> Duration
    {   self.strategy().delay_between_retries()
    }

    pub fn support_not_available_errors_only(&self) -> bool
    {   self.support_not_available_errors_only.load(Ordering::Relaxed)
    }

    pub fn set_support_not_available_errors_only(&self, support: bool)
    {   self.support_not_available_errors_only
          .store(support, Ordering::Relaxed);
    }

    pub fn client_bootstrap_address(&self) -> Option<String>
    {   self.client_bootstrap_address.read().clone()
    }

    pub fn set_client_bootstrap_address(&self, address: Option<String>)
    {   *self.client_bootstrap_address.write() = address;
    }

    // ===== In-flight calls =====

    pub fn invocation(&self, key: &InvocationKey)
      -> Option<Arc<InvocationContext>>
    {   self.in_progress.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove_invocation(&self, key: &InvocationKey)
    {   self.in_progress.remove(key);
    }

    pub fn in_progress_count(&self) -> usize
    {   self.in_progress.len()
    }

    /// Snapshot the call the first time it is prepared
    pub fn prepare(&self, exchange: &mut Exchange)
    {   let Some(params) = exchange.out_message.content.clone()
        else
        {   return;
        };
        self.setup_exchange_exception_properties(exchange);

        let key = InvocationKey::of(exchange);
        if self.in_progress.contains_key(&key)
        {   return;
        }

        if let Some(bootstrap) = self.client_bootstrap_address()
        {   if exchange.out_message.endpoint_address().as_deref()
              == Some(bootstrap.as_str())
            {   self.leave_bootstrap_address(exchange);
            }
        }

        let Some(endpoint) = exchange.endpoint.clone()
        else
        {   debug!("Exchange {} has no endpoint, nothing to fail over", exchange.id());
            return;
        };
        let operation = exchange.operation.clone().unwrap_or_default();
        let context = exchange.out_message.request_context.clone();

        self.in_progress
          .entry(key)
          .or_insert_with(|| Arc::new(InvocationContext::new(
            endpoint
          , operation
          , params
          , context
          )));
    }

    fn leave_bootstrap_address(&self, exchange: &mut Exchange)
    {   match self.strategy().alternate_addresses(Some(exchange))
        {   Ok(Some(addresses)) => {
              if let Some(first) = addresses.first()
              {   debug!("Leaving bootstrap address for {}", first);
                  self.endpoint().set_address(first.clone());
                  exchange.out_message.set_endpoint_address(first.clone());
              }
            }
          , Ok(None) => {}
          , Err(e) => {
              warn!("Cannot resolve addresses past bootstrap: {}", e);
            }
        }
    }

    pub fn setup_exchange_exception_properties(&self, exchange: &mut Exchange)
    {   if !self.support_not_available_errors_only()
        {   exchange.remove_property(crate::NO_IO_EXCEPTIONS);
        }
        exchange.put_property(crate::COMPLETE_IF_SERVICE_NOT_AVAILABLE, true);
    }

    // ===== Conduits =====

    /// Conduit carried by the message, else the one for the endpoint
    pub fn select_conduit(&self, exchange: &mut Exchange)
      -> Result<Arc<dyn Conduit>, Error>
    {   if let Some(conduit) = exchange.out_message.conduit.clone()
        {   return Ok(conduit);
        }
        self.get_selected_conduit(exchange)
    }

    /// Reuse a cached conduit for the current target or create one
    pub fn get_selected_conduit(&self, exchange: &mut Exchange)
      -> Result<Arc<dyn Conduit>, Error>
    {   let endpoint = self.endpoint();
        let full_url = exchange.out_message.is_true(crate::CONDUIT_COMPARE_FULL_URL);
        let address = if full_url
        {   exchange.out_message
              .endpoint_address()
              .unwrap_or_else(|| endpoint.address())
        } else
        {   endpoint.address()
        };
        let matches = |target: &str| if full_url
        {   target == address
        } else
        {   address.starts_with(target)
        };

        let conduit = {
          let mut conduits = self.conduits.lock();
          match conduits.iter().find(|c| matches(c.target()))
          {   Some(conduit) => conduit.clone()
            , None => {
                let conduit = self.initiator.conduit(&endpoint, &address)?;
                debug!("Created conduit for {}", address);
                conduits.push(conduit.clone());
                conduit
              }
          }
        };
        exchange.out_message.conduit = Some(conduit.clone());
        Ok(conduit)
    }

    /// Forget and close a stale conduit
    pub fn remove_conduit(&self, conduit: &Arc<dyn Conduit>)
    {   let mut conduits = self.conduits.lock();
        let before = conduits.len();
        conduits.retain(|c| !same_conduit(c, conduit));
        if conduits.len() != before
        {   debug!("Removed conduit for {}", conduit.target());
        }
        drop(conduits);
        conduit.close();
    }

    pub fn conduit_count(&self) -> usize
    {   self.conduits.lock().len()
    }

    /// Default completion: release the conduit unless asked to keep it
    pub fn do_complete(&self, exchange: &Exchange)
    {   if exchange.is_true(crate::KEEP_CONDUIT_ALIVE)
        {   return;
        }
        if exchange.in_message.is_some()
        {   if let Some(conduit) = exchange.out_message.conduit.as_ref()
            {   conduit.finish(exchange);
            }
        }
    }

    // ===== Failover =====

    /// Transport failures warrant failover. When only "not available"
    /// errors count and the transport got a response code, the explicit
    /// service-not-available flag decides.
    pub fn requires_failover(
      &self
    , exchange: &Exchange
    , error: Option<&Error>
    ) -> bool
    {   debug!("Checking last invocation failed: {}", error.is_some());
        let mut failover = error.map_or(false, Error::is_transport);
        if let Some(error) = error
        {   info!("Failure in transport: {}, failover: {}", error, failover);
        }
        if self.support_not_available_errors_only()
          && exchange.response_code.is_some()
        {   failover = exchange.service_not_available;
        }
        failover
    }

    /// Compute the call's alternates once, from addresses if the
    /// strategy has them, else from endpoints
    pub fn update_context_alternatives(
      &self
    , strategy: &Arc<dyn FailoverStrategy>
    , exchange: &Exchange
    , invocation: &InvocationContext
    )
    {   invocation.with_alternates(|alternates| {
          if alternates.is_set()
          {   return;
          }
          match strategy.alternate_addresses(Some(exchange))
          {   Ok(Some(addresses)) => alternates.addresses = Some(addresses)
            , Ok(None) => {
                alternates.endpoints = strategy.alternate_endpoints(exchange);
              }
            , Err(e) => {
                warn!("Strategy could not list addresses: {}", e);
                alternates.endpoints = strategy.alternate_endpoints(exchange);
              }
          }
        })
    }

    /// Next target for a failed call. A selected address rebases the
    /// current endpoint instead of building a new one.
    pub fn failover_target(
      &self
    , exchange: &Exchange
    , invocation: &InvocationContext
    ) -> Option<Arc<Endpoint>>
    {   let strategy = self.strategy();
        self.update_context_alternatives(&strategy, exchange, invocation);
        invocation.with_alternates(|alternates| {
          match alternates.addresses.as_mut()
          {   Some(addresses) => {
                strategy
                  .select_alternate_address(Some(addresses))
                  .map(|address| {
                    let target = self.endpoint();
                    target.set_address(address);
                    target
                  })
              }
            , None => {
                strategy.select_alternate_endpoint(alternates.endpoints.as_mut())
              }
          }
        })
    }

    pub fn set_original_endpoint(&self, invocation: &InvocationContext)
    {   let current = self.endpoint();
        self.set_endpoint(invocation.retrieve_original_endpoint(Some(&current)));
    }

    /// Replay the call on the current endpoint through the exchange's
    /// `Retryable`. Returns whether a replay was attempted. If the replay
    /// fails, the faults from before the replay are put back so the first
    /// failure is what surfaces.
    pub async fn perform_failover(
      &self
    , exchange: &mut Exchange
    , invocation: &InvocationContext
    ) -> bool
    {   let Some(retry) = exchange.retryable.clone()
        else
        {   debug!("Exchange {} cannot be replayed", exchange.id());
            return false;
        };

        let delay = self.delay_between_retries();
        if !delay.is_zero()
        {   debug!("Waiting {:?} before retrying", delay);
            if !backoff(delay, exchange.deadline).await
            {   warn!("Deadline reached before retry of exchange {}", exchange.id());
                self.set_original_endpoint(invocation);
                return false;
            }
        }

        let prev_exchange_fault = exchange.error.take();
        let prev_message_fault = exchange.out_message.error.take();
        self.override_address_property(
          invocation.context()
        , &self.endpoint().address()
        );
        exchange.clear();

        let result = retry
          .invoke(
            invocation.operation()
          , invocation.params()
          , invocation.context()
          , exchange
          )
          .await;

        if let Err(e) = result
        {   warn!("Retry on {} failed: {}", self.endpoint().address(), e);
            exchange.error = prev_exchange_fault;
            exchange.out_message.error = prev_message_fault;
            if exchange.error_if_present().is_none()
            {   exchange.error = Some(e);
            }
        }
        true
    }

    /// Point the request context at `address`
    pub fn override_address_property(
      &self
    , context: &RequestContext
    , address: &str
    )
    {   trace!("Request context address -> {}", address);
        context.insert(crate::ENDPOINT_ADDRESS, Value::from(address));
    }

    /// A conduit may have appended path segments to the base address
    /// after the call was prepared. Rebase request URI and base path onto
    /// `endpoint_address`, and point the call's context at the conduit.
    pub fn replace_endpoint_address_property_if_needed(
      &self
    , exchange: &mut Exchange
    , endpoint_address: &str
    , conduit: &dyn Conduit
    ) -> bool
    {   let message = &mut exchange.out_message;
        let Some(request_uri) = message.get_str(crate::REQUEST_URI)
        else
        {   return false;
        };
        if request_uri == endpoint_address
        {   return false;
        }
        let Some(base_path) = message.get_str(crate::BASE_PATH)
        else
        {   return false;
        };
        let Some(path_info) = request_uri.strip_prefix(base_path.as_str())
        else
        {   return false;
        };

        let address = join_path(endpoint_address, path_info);
        debug!("Rebased request URI {} -> {}", request_uri, address);
        message.put(crate::BASE_PATH, endpoint_address);
        message.put(crate::ENDPOINT_ADDRESS, address.clone());
        message.put(crate::REQUEST_URI, address);

        if let Some(invocation) = self.invocation(&InvocationKey::of(exchange))
        {   self.override_address_property(invocation.context(), conduit.target());
        }
        true
    }
}

fn same_conduit(a: &Arc<dyn Conduit>, b: &Arc<dyn Conduit>) -> bool
{   std::ptr::eq(
      Arc::as_ptr(a) as *const ()
    , Arc::as_ptr(b) as *const ()
    )
}

fn join_path(base: &str, path_info: &str) -> String
{   let path = path_info.strip_prefix('/').unwrap_or(path_info);
    if base.ends_with('/')
    {   format!("{}{}", base, path)
    } else if path.is_empty()
    {   base.to_string()
    } else
    {   format!("{}/{}", base, path)
    }
}

/// Sleep for `delay`, cut short by the call's own deadline.
/// Returns false when the deadline won.
async fn backoff(
  delay: Duration
, deadline: Option<tokio::time::Instant>
) -> bool
{   match deadline
    {   Some(deadline) => {
          tokio::time::timeout_at(deadline, tokio::time::sleep(delay))
            .await
            .is_ok()
        }
      , None => {
          tokio::time::sleep(delay).await;
          true
        }
    }
}
