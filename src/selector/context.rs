//! Per-call failover state

use std::sync::Arc;

use log::info;
use parking_lot::Mutex;
use serde_json::Value;

use crate::endpoint::Endpoint;
use crate::request::{Exchange, OperationDescriptor, RequestContext};

/// Identity of an in-flight call, taken from the exchange id rather than
/// from anything the call carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvocationKey(u64);

impl InvocationKey
{   pub fn of(exchange: &Exchange) -> Self
    {   InvocationKey(exchange.id())
    }
}

/// Alternate targets computed for one call.
/// Only one of the two lists is ever populated.
#[derive(Debug, Default)]
pub struct Alternates
{   pub addresses: Option<Vec<String>>
  , pub endpoints: Option<Vec<Arc<Endpoint>>>
}

impl Alternates
{   pub fn is_set(&self) -> bool
    {   self.addresses.is_some() || self.endpoints.is_some()
    }
}

/// Snapshot of a call taken when it was first prepared, so the call can
/// be replayed elsewhere and reverted to where it started
#[derive(Debug)]
pub struct InvocationContext
{   original_endpoint: Arc<Endpoint>
  , original_address: String
  , operation: OperationDescriptor
  , params: Vec<Value>
  , context: RequestContext
  , alternates: Mutex<Alternates>
}

impl InvocationContext
{   pub fn new(
      endpoint: Arc<Endpoint>
    , operation: OperationDescriptor
    , params: Vec<Value>
    , context: RequestContext
    ) -> Self
    {   let original_address = endpoint.address();
        InvocationContext
        {   original_endpoint: endpoint
          , original_address
          , operation
          , params
          , context
          , alternates: Mutex::new(Alternates::default())
        }
    }

    /// Put `current` back on the original address and hand out the
    /// original endpoint
    pub fn retrieve_original_endpoint(
      &self
    , current: Option<&Arc<Endpoint>>
    ) -> Arc<Endpoint>
    {   if let Some(current) = current
        {   if !Arc::ptr_eq(current, &self.original_endpoint)
            {   info!("Reverting to original target from {}", current.name());
            }
            if current.address() != self.original_address
            {   current.set_address(self.original_address.clone());
                info!("Reverted to original address {}", self.original_address);
            }
        }
        self.original_endpoint.clone()
    }

    pub fn original_endpoint(&self) -> &Arc<Endpoint>
    {   &self.original_endpoint
    }

    pub fn original_address(&self) -> &str
    {   &self.original_address
    }

    pub fn operation(&self) -> &OperationDescriptor
    {   &self.operation
    }

    pub fn params(&self) -> &[Value]
    {   &self.params
    }

    pub fn context(&self) -> &RequestContext
    {   &self.context
    }

    pub fn has_alternates(&self) -> bool
    {   self.alternates.lock().is_set()
    }

    pub fn alternate_addresses(&self) -> Option<Vec<String>>
    {   self.alternates.lock().addresses.clone()
    }

    pub fn alternate_endpoints(&self) -> Option<Vec<Arc<Endpoint>>>
    {   self.alternates.lock().endpoints.clone()
    }

    pub fn set_alternate_addresses(&self, alternates: Vec<String>)
    {   self.alternates.lock().addresses = Some(alternates);
    }

    pub fn set_alternate_endpoints(&self, alternates: Option<Vec<Arc<Endpoint>>>)
    {   self.alternates.lock().endpoints = alternates;
    }

    /// Run `f` with exclusive access to the cached alternates
    pub fn with_alternates<R>(&self, f: impl FnOnce(&mut Alternates) -> R) -> R
    {   f(&mut self.alternates.lock())
    }
}

#[cfg(test)]
mod tests
{   use super::*;

    fn context_for(endpoint: &Arc<Endpoint>) -> InvocationContext
    {   InvocationContext::new(
          endpoint.clone()
        , OperationDescriptor::new("echo")
        , vec![]
        , RequestContext::new()
        )
    }

    #[test]
    fn test_revert_restores_original_address()
    {   let endpoint = Arc::new(Endpoint::new("a", "svc", "soap", "http://a"));
        let invocation = context_for(&endpoint);

        endpoint.set_address("http://b");
        let original = invocation.retrieve_original_endpoint(Some(&endpoint));

        assert!(Arc::ptr_eq(&original, &endpoint));
        assert_eq!(endpoint.address(), "http://a");
        assert_eq!(invocation.original_address(), "http://a");
    }

    #[test]
    fn test_revert_from_other_endpoint()
    {   let endpoint = Arc::new(Endpoint::new("a", "svc", "soap", "http://a"));
        let other = Arc::new(Endpoint::new("b", "svc", "soap", "http://b"));
        let invocation = context_for(&endpoint);

        let original = invocation.retrieve_original_endpoint(Some(&other));

        assert!(Arc::ptr_eq(&original, &endpoint));
        assert_eq!(other.address(), "http://a");
    }

    #[test]
    fn test_alternates_are_lazy()
    {   let endpoint = Arc::new(Endpoint::new("a", "svc", "soap", "http://a"));
        let invocation = context_for(&endpoint);
        assert!(!invocation.has_alternates());

        invocation.set_alternate_endpoints(None);
        assert!(!invocation.has_alternates());

        invocation.set_alternate_addresses(vec!["http://b".into()]);
        assert!(invocation.has_alternates());
        assert_eq!(invocation.alternate_addresses(), Some(vec!["http://b".into()]));
    }

    #[test]
    fn test_keys_follow_exchange_identity()
    {   let mut exchange = Exchange::new();
        let key = InvocationKey::of(&exchange);
        exchange.clear();
        assert_eq!(InvocationKey::of(&exchange), key);
        assert_ne!(InvocationKey::of(&Exchange::new()), key);
    }
}
