//! In-flight call types: exchange, message and request context

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::endpoint::{Endpoint, Service};
use crate::error::Error;
use crate::selector::Retryable;
use crate::transport::Conduit;

/// Key/value bag used by messages and exchanges
pub type Properties = HashMap<String, Value>;

static NEXT_EXCHANGE_ID: AtomicU64 = AtomicU64::new(1);

/// Operation being invoked
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationDescriptor
{   /// Operation name
    pub name: String
  , /// No response expected
    #[serde(default)]
    pub one_way: bool
}

impl OperationDescriptor
{   pub fn new(name: impl Into<String>) -> Self
    {   OperationDescriptor
        {   name: name.into()
          , one_way: false
        }
    }
}

/// Request-scoped properties of one call.
///
/// Cloning shares the underlying map: the caller, the selector and the
/// transport all observe the same entries.
#[derive(Debug, Clone, Default)]
pub struct RequestContext
{   inner: Arc<Mutex<Properties>>
}

impl RequestContext
{   pub fn new() -> Self
    {   RequestContext::default()
    }

    pub fn get(&self, key: &str) -> Option<Value>
    {   self.inner.lock().get(key).cloned()
    }

    pub fn get_str(&self, key: &str) -> Option<String>
    {   self.inner.lock()
          .get(key)
          .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn insert(
      &self
    , key: impl Into<String>
    , value: Value
    ) -> Option<Value>
    {   self.inner.lock().insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value>
    {   self.inner.lock().remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool
    {   self.inner.lock().contains_key(key)
    }

    /// Copy of the current entries
    pub fn snapshot(&self) -> Properties
    {   self.inner.lock().clone()
    }

    /// Whether both handles share one map
    pub fn ptr_eq(&self, other: &RequestContext) -> bool
    {   Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Outbound or inbound message of an exchange
#[derive(Debug, Clone, Default)]
pub struct Message
{   /// Call parameters (out) or response payload (in)
    pub content: Option<Vec<Value>>
  , /// Fault recorded against this message
    pub error: Option<Error>
  , /// Conduit chosen for this message
    pub conduit: Option<Arc<dyn Conduit>>
  , /// Request-scoped properties supplied by the caller
    pub request_context: RequestContext
  , properties: Properties
}

impl Message
{   pub fn new() -> Self
    {   Message::default()
    }

    pub fn with_content(content: Vec<Value>) -> Self
    {   Message
        {   content: Some(content)
          , ..Message::default()
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value>
    {   self.properties.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<String>
    {   self.properties
          .get(key)
          .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn is_true(&self, key: &str) -> bool
    {   matches!(self.properties.get(key), Some(Value::Bool(true)))
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>)
    {   self.properties.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value>
    {   self.properties.remove(key)
    }

    pub fn endpoint_address(&self) -> Option<String>
    {   self.get_str(crate::ENDPOINT_ADDRESS)
    }

    pub fn set_endpoint_address(&mut self, address: impl Into<String>)
    {   self.put(crate::ENDPOINT_ADDRESS, address.into());
    }
}

/// A request/response pairing in flight.
///
/// The id is assigned once at creation and survives `clear()`, so a
/// selector can key per-call state on it while the content changes.
pub struct Exchange
{   id: u64
  , /// Endpoint the call was issued against
    pub endpoint: Option<Arc<Endpoint>>
  , /// Service the endpoint belongs to
    pub service: Option<Arc<Service>>
  , /// Operation being invoked
    pub operation: Option<OperationDescriptor>
  , /// Outbound message
    pub out_message: Message
  , /// Inbound message, once a response arrived
    pub in_message: Option<Message>
  , /// Fault recorded against the whole exchange
    pub error: Option<Error>
  , /// Response code reported by the transport, if any
    pub response_code: Option<u16>
  , /// Transport saw an explicit "service not available"
    pub service_not_available: bool
  , /// Hook to replay the call against a new target
    pub retryable: Option<Arc<dyn Retryable>>
  , /// Deadline of the logical call
    pub deadline: Option<tokio::time::Instant>
  , properties: Properties
}

impl Exchange
{   pub fn new() -> Self
    {   Exchange
        {   id: NEXT_EXCHANGE_ID.fetch_add(1, Ordering::Relaxed)
          , endpoint: None
          , service: None
          , operation: None
          , out_message: Message::new()
          , in_message: None
          , error: None
          , response_code: None
          , service_not_available: false
          , retryable: None
          , deadline: None
          , properties: Properties::new()
        }
    }

    pub fn id(&self) -> u64
    {   self.id
    }

    pub fn get_property(&self, key: &str) -> Option<&Value>
    {   self.properties.get(key)
    }

    pub fn is_true(&self, key: &str) -> bool
    {   matches!(self.properties.get(key), Some(Value::Bool(true)))
    }

    pub fn put_property(
      &mut self
    , key: impl Into<String>
    , value: impl Into<Value>
    )
    {   self.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value>
    {   self.properties.remove(key)
    }

    /// First fault found on the outbound message, then the exchange
    pub fn error_if_present(&self) -> Option<Error>
    {   self.out_message.error.clone()
          .or_else(|| self.error.clone())
    }

    /// Drop all transient state. Keeps the id and the deadline,
    /// which belong to the logical call.
    pub fn clear(&mut self)
    {   self.endpoint = None;
        self.service = None;
        self.operation = None;
        self.out_message = Message::new();
        self.in_message = None;
        self.error = None;
        self.response_code = None;
        self.service_not_available = false;
        self.retryable = None;
        self.properties.clear();
    }
}

impl Default for Exchange
{   fn default() -> Self
    {   Exchange::new()
    }
}

impl fmt::Debug for Exchange
{   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {   f.debug_struct("Exchange")
          .field("id", &self.id)
          .field(
            "endpoint"
          , &self.endpoint.as_ref().map(|e| e.address())
          )
          .field("operation", &self.operation)
          .field("error", &self.error)
          .field("response_code", &self.response_code)
          .field("retryable", &self.retryable.is_some())
          .finish()
    }
}

#[cfg(test)]
mod tests
{   use super::*;
    use serde_json::json;

    #[test]
    fn test_exchange_ids_are_unique()
    {   let a = Exchange::new();
        let b = Exchange::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_clear_keeps_identity()
    {   let mut exchange = Exchange::new();
        let id = exchange.id();
        exchange.error = Some(Error::Transport("reset".into()));
        exchange.response_code = Some(503);
        exchange.put_property("flag", true);
        exchange.out_message.set_endpoint_address("http://a");

        exchange.clear();

        assert_eq!(exchange.id(), id);
        assert!(exchange.error.is_none());
        assert!(exchange.response_code.is_none());
        assert!(exchange.get_property("flag").is_none());
        assert!(exchange.out_message.endpoint_address().is_none());
    }

    #[test]
    fn test_message_fault_wins_over_exchange_fault()
    {   let mut exchange = Exchange::new();
        exchange.error = Some(Error::Fault("exchange".into()));
        assert_eq!(
          exchange.error_if_present()
        , Some(Error::Fault("exchange".into()))
        );
        exchange.out_message.error
          = Some(Error::Transport("message".into()));
        assert_eq!(
          exchange.error_if_present()
        , Some(Error::Transport("message".into()))
        );
    }

    #[test]
    fn test_request_context_is_shared()
    {   let context = RequestContext::new();
        let other = context.clone();
        other.insert("k", json!("v"));
        assert_eq!(context.get_str("k").as_deref(), Some("v"));
        assert!(context.ptr_eq(&other));
        assert!(!context.ptr_eq(&RequestContext::new()));
    }
}
