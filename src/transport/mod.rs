//! Conduits: dispatch handles bound to one target address

pub mod http;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::request::Exchange;

// Re-export for convenience
pub use http::{HttpConduit, HttpConduitInitiator};

/// Transport handle for a single target.
///
/// `send` reads the operation and parameters from the exchange, records
/// any response code on it, and returns the response payload. Transport
/// failures must come back as `Error::Transport` (or
/// `Error::ServiceUnavailable`) so the selector can fail over.
#[async_trait]
pub trait Conduit: Send + Sync + fmt::Debug
{   /// Address this conduit dispatches to
    fn target(&self) -> &str;

    async fn send(&self, exchange: &mut Exchange)
      -> Result<Vec<Value>, Error>;

    /// Release what the conduit holds for a completed exchange
    fn finish(&self, _exchange: &Exchange) {}

    /// Called once the selector discards this conduit
    fn close(&self) {}
}

/// Factory for conduits
pub trait ConduitInitiator: Send + Sync
{   fn conduit(
      &self
    , endpoint: &Endpoint
    , address: &str
    ) -> Result<Arc<dyn Conduit>, Error>;
}
