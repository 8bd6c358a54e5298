//! rpc-failover: client-side target selection for RPC calls.
//!
//! A logical service reachable through several physical addresses is
//! wrapped by a conduit selector. The selector picks the conduit for
//! every outbound call, fails a call over to an alternate target when
//! the transport breaks, and (depending on the policy) keeps a circuit
//! breaker per address or distributes calls across all addresses.
//!
//! ```text
//! rpc-failover/
//! ├── src/
//! │   ├── lib.rs              # Re-exports and property keys
//! │   ├── error.rs            # Error type
//! │   ├── config.rs           # Serde configuration
//! │   ├── request.rs          # Exchange, message, request context
//! │   ├── endpoint.rs         # Endpoint and service descriptors
//! │   ├── strategy.rs         # Failover strategies
//! │   ├── circuit_breaker.rs  # Per-address health tracking
//! │   ├── client.rs           # Minimal client runtime (Retryable)
//! │   ├── transport/          # Conduit traits, HTTP conduit
//! │   └── selector/           # Retry engine and its policies
//! └── tests/
//! ```
//!
//! Note that a failover selector rewrites the target of its client on the
//! fly: a client instance is not safe for concurrent reuse of its conduit
//! selection state. Give every proxy its own selector.

pub mod error;
pub mod config;
pub mod request;
pub mod endpoint;
pub mod strategy;
pub mod circuit_breaker;
pub mod transport;
pub mod selector;
pub mod client;

pub use error::Error;
pub use config::
{   CircuitBreakerConfig
  , FailoverConfig
  , LoadDistributorConfig
  , SelectionKind
  , StrategyConfig
};
pub use request::
{   Exchange
  , Message
  , OperationDescriptor
  , Properties
  , RequestContext
};
pub use endpoint::{Endpoint, EndpointInfo, Service};
pub use strategy::{FailoverStrategy, Selection, StaticStrategy};
pub use circuit_breaker::
{   CircuitBreaker
  , CircuitBreakerRegistry
  , CircuitState
  , NoOpCircuitBreaker
  , ThresholdCircuitBreaker
};
pub use transport::{Conduit, ConduitInitiator};
pub use selector::
{   CircuitBreakerPolicy
  , CircuitBreakerTargetSelector
  , ConduitSelector
  , Failover
  , FailoverTargetSelector
  , InvocationContext
  , InvocationKey
  , LoadDistribution
  , LoadDistributorTargetSelector
  , Retryable
  , SelectionPolicy
};
pub use client::FailoverClient;

// ===== Property keys =====

/// Target address of a call, in message and request context
pub const ENDPOINT_ADDRESS: &str = "rpc.endpoint_address";
/// Full request URI once path segments were appended
pub const REQUEST_URI: &str = "rpc.request_uri";
/// Base path the request URI was built from
pub const BASE_PATH: &str = "rpc.base_path";
/// Exchange marker: complete the call if the service is unavailable
pub const COMPLETE_IF_SERVICE_NOT_AVAILABLE: &str
  = "rpc.transport.complete_if_service_not_available";
/// Exchange marker: transport should not raise I/O errors
pub const NO_IO_EXCEPTIONS: &str = "rpc.transport.no_io_exceptions";
/// Exchange marker: keep the conduit open after completion
pub const KEEP_CONDUIT_ALIVE: &str = "rpc.transport.keep_conduit_alive";
/// Message marker: compare conduit targets on the full URL
pub const CONDUIT_COMPARE_FULL_URL: &str
  = "rpc.failover.conduit_compare_full_url";
/// Request context marker set once the circuit check ran
pub const IS_SELECTED: &str = "rpc.failover.circuit.selected";
/// Request context marker set once a call was distributed
pub const IS_DISTRIBUTED: &str = "rpc.failover.distributed";
