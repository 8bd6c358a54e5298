//! Failover strategies: where a call may go next, and which one to pick

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::request::Exchange;

/// Supplies alternate targets for an in-flight call and picks among them.
///
/// A strategy deals either in addresses or in endpoints: when
/// `alternate_addresses` answers `None`, callers fall back to
/// `alternate_endpoints`.
pub trait FailoverStrategy: Send + Sync + fmt::Debug
{   /// Copy of the alternate addresses, or `None` if this strategy
    /// works on endpoints. Called with `None` for context-free queries;
    /// strategies that need the exchange return `Error::ContextRequired`.
    fn alternate_addresses(
      &self
    , exchange: Option<&Exchange>
    ) -> Result<Option<Vec<String>>, Error>;

    /// Endpoints of the same service and binding as the exchange's
    fn alternate_endpoints(
      &self
    , exchange: &Exchange
    ) -> Option<Vec<Arc<Endpoint>>>;

    /// Pick and remove one address from `alternates`
    fn select_alternate_address(
      &self
    , alternates: Option<&mut Vec<String>>
    ) -> Option<String>;

    /// Pick and remove one endpoint from `alternates`
    fn select_alternate_endpoint(
      &self
    , alternates: Option<&mut Vec<Arc<Endpoint>>>
    ) -> Option<Arc<Endpoint>>;

    /// Pause before replaying a call on a new target
    fn delay_between_retries(&self) -> Duration
    {   Duration::ZERO
    }

    /// Statically configured addresses, if any
    fn static_addresses(&self) -> Option<Vec<String>>
    {   None
    }
}

/// How a static strategy picks among candidates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Selection
{   /// Always the head, so repeated picks walk the list in order
    #[default]
    Sequential
  , /// Uniformly random index
    Random
}

impl Selection
{   fn pick<T>(self, alternates: &mut Vec<T>) -> T
    {   match self
        {   Selection::Sequential => alternates.remove(0)
          , Selection::Random => {
              let index = rand::thread_rng()
                .gen_range(0..alternates.len());
              alternates.remove(index)
            }
        }
    }
}

/// Strategy over a fixed address list, or over the service's endpoints
/// when no list is configured
#[derive(Debug, Clone, Default)]
pub struct StaticStrategy
{   selection: Selection
  , alternate_addresses: Option<Vec<String>>
  , delay_between_retries: Duration
}

impl StaticStrategy
{   pub fn new(selection: Selection) -> Self
    {   StaticStrategy
        {   selection
          , alternate_addresses: None
          , delay_between_retries: Duration::ZERO
        }
    }

    pub fn sequential() -> Self
    {   StaticStrategy::new(Selection::Sequential)
    }

    pub fn random() -> Self
    {   StaticStrategy::new(Selection::Random)
    }

    pub fn with_alternate_addresses(mut self, addresses: Vec<String>) -> Self
    {   self.alternate_addresses = Some(addresses);
        self
    }

    pub fn with_delay_between_retries(mut self, delay: Duration) -> Self
    {   self.delay_between_retries = delay;
        self
    }

    pub fn selection(&self) -> Selection
    {   self.selection
    }

    fn select<T: fmt::Debug>(&self, alternates: Option<&mut Vec<T>>) -> Option<T>
    {   match alternates
        {   Some(alternates) if !alternates.is_empty() => {
              let selected = self.selection.pick(alternates);
              info!("Failover strategy {:?} selected {:?}", self.selection, selected);
              Some(selected)
            }
          , _ => {
              warn!("No alternate targets remain");
              None
            }
        }
    }
}

impl FailoverStrategy for StaticStrategy
{   fn alternate_addresses(
      &self
    , _exchange: Option<&Exchange>
    ) -> Result<Option<Vec<String>>, Error>
    {   Ok(self.alternate_addresses.clone())
    }

    fn alternate_endpoints(
      &self
    , exchange: &Exchange
    ) -> Option<Vec<Arc<Endpoint>>>
    {   Some(scan_endpoints(exchange, false))
    }

    fn select_alternate_address(
      &self
    , alternates: Option<&mut Vec<String>>
    ) -> Option<String>
    {   self.select(alternates)
    }

    fn select_alternate_endpoint(
      &self
    , alternates: Option<&mut Vec<Arc<Endpoint>>>
    ) -> Option<Arc<Endpoint>>
    {   self.select(alternates)
    }

    fn delay_between_retries(&self) -> Duration
    {   self.delay_between_retries
    }

    fn static_addresses(&self) -> Option<Vec<String>>
    {   self.alternate_addresses.clone()
    }
}

/// Endpoints of the exchange's service sharing the current binding.
///
/// Candidates at the current address are skipped unless
/// `accept_same_address` is set; candidates the service cannot resolve
/// by name are dropped.
pub fn scan_endpoints(
  exchange: &Exchange
, accept_same_address: bool
) -> Vec<Arc<Endpoint>>
{   let mut alternates = vec![];
    let (Some(endpoint), Some(service))
      = (exchange.endpoint.as_ref(), exchange.service.as_ref())
    else
    {   debug!("Exchange carries no endpoint or service to scan");
        return alternates;
    };
    let current_address = endpoint.address();

    for candidate in service.candidates()
    {   if candidate.binding != endpoint.binding()
        {   debug!("Failover candidate rejected: {}", candidate.name);
            continue;
        }
        if !accept_same_address && candidate.address == current_address
        {   debug!("Failover candidate rejected: {}", candidate.name);
            continue;
        }
        if let Some(alternate) = service.endpoint(&candidate.name)
        {   debug!("Failover candidate accepted: {}", candidate.name);
            alternates.push(alternate);
        }
    }
    alternates
}
