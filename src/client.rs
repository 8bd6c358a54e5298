//! Minimal RPC client runtime driving a target selector

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, trace};
use serde_json::Value;

use crate::endpoint::Service;
use crate::error::Error;
use crate::request::{Exchange, Message, OperationDescriptor, RequestContext};
use crate::selector::
{   ConduitSelector
  , Failover
  , FailoverTargetSelector
  , InvocationKey
  , Retryable
  , SelectionPolicy
};

/// Client for one logical service.
///
/// Every call runs prepare, select_conduit, send and complete on the
/// selector. The client is the exchange's `Retryable`, so a failover
/// replays the call through the same steps.
pub struct FailoverClient<P: SelectionPolicy = Failover>
{   me: Weak<FailoverClient<P>>
  , selector: Arc<FailoverTargetSelector<P>>
  , service: Option<Arc<Service>>
  , timeout: Option<Duration>
}

impl<P: SelectionPolicy> FailoverClient<P>
{   /// Create a client around `selector`
    pub fn new(
      selector: Arc<FailoverTargetSelector<P>>
    , service: Option<Arc<Service>>
    , timeout: Option<Duration>
    ) -> Arc<Self>
    {   debug!("Creating FailoverClient");
        Arc::new_cyclic(|me| FailoverClient
        {   me: me.clone()
          , selector
          , service
          , timeout
        })
    }

    pub fn selector(&self) -> &Arc<FailoverTargetSelector<P>>
    {   &self.selector
    }

    /// Invoke `operation` with a fresh request context
    pub async fn invoke(
      &self
    , operation: OperationDescriptor
    , params: Vec<Value>
    ) -> Result<Vec<Value>, Error>
    {   self.invoke_with_context(operation, params, RequestContext::new())
          .await
    }

    /// Invoke `operation`; `context` is shared with the selector and
    /// holds the target address the call ended up on
    pub async fn invoke_with_context(
      &self
    , operation: OperationDescriptor
    , params: Vec<Value>
    , context: RequestContext
    ) -> Result<Vec<Value>, Error>
    {   let mut exchange = Exchange::new();
        if let Some(timeout) = self.timeout
        {   exchange.deadline = Some(tokio::time::Instant::now() + timeout);
        }
        if context.get_str(crate::ENDPOINT_ADDRESS).is_none()
        {   context.insert(
              crate::ENDPOINT_ADDRESS
            , Value::from(self.selector.endpoint().address())
            );
        }
        debug!("Invoking {} as exchange {}", operation.name, exchange.id());

        let key = InvocationKey::of(&exchange);
        let deadline = exchange.deadline;
        let dispatch = self.dispatch(&operation, &params, &context, &mut exchange);
        match deadline
        {   Some(deadline) => {
              match tokio::time::timeout_at(deadline, dispatch).await
              {   Ok(result) => result
                , Err(_) => {
                    error!("Call {} timed out", operation.name);
                    self.selector.core().remove_invocation(&key);
                    Err(Error::Timeout)
                  }
              }
            }
          , None => dispatch.await
        }
    }

    async fn dispatch(
      &self
    , operation: &OperationDescriptor
    , params: &[Value]
    , context: &RequestContext
    , exchange: &mut Exchange
    ) -> Result<Vec<Value>, Error>
    {   let endpoint = self.selector.endpoint();
        let address = context
          .get_str(crate::ENDPOINT_ADDRESS)
          .unwrap_or_else(|| endpoint.address());

        exchange.endpoint = Some(endpoint);
        exchange.service = self.service.clone();
        exchange.operation = Some(operation.clone());
        exchange.out_message.content = Some(params.to_vec());
        exchange.out_message.request_context = context.clone();
        exchange.out_message.set_endpoint_address(address);
        if let Some(me) = self.me.upgrade()
        {   exchange.retryable = Some(me as Arc<dyn Retryable>);
        }

        self.selector.prepare(exchange);
        let sent = match self.selector.select_conduit(exchange)
        {   Ok(conduit) => {
              trace!("Sending exchange {} to {}", exchange.id(), conduit.target());
              conduit.send(exchange).await
            }
          , Err(e) => Err(e)
        };
        match &sent
        {   Ok(response) => {
              exchange.in_message = Some(Message::with_content(response.clone()));
            }
          , Err(e) => {
              debug!("Exchange {} failed: {}", exchange.id(), e);
              exchange.out_message.error = Some(e.clone());
            }
        }

        self.selector.complete(exchange).await;

        match exchange.error_if_present()
        {   Some(e) => Err(e)
          , None => Ok(
              exchange.in_message
                .as_ref()
                .and_then(|m| m.content.clone())
                .unwrap_or_default()
            )
        }
    }
}

#[async_trait]
impl<P: SelectionPolicy> Retryable for FailoverClient<P>
{   async fn invoke(
      &self
    , operation: &OperationDescriptor
    , params: &[Value]
    , context: &RequestContext
    , exchange: &mut Exchange
    ) -> Result<Vec<Value>, Error>
    {   debug!("Replaying {} on exchange {}", operation.name, exchange.id());
        self.dispatch(operation, params, context, exchange).await
    }
}
