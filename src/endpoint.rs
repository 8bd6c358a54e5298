//! Endpoint and service descriptors consumed by strategies and selectors

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Declared endpoint of a service, before resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo
{   /// Endpoint name, unique within the service
    pub name: String
  , /// Physical address
    pub address: String
  , /// Binding identity, candidates must share it to be alternates
    pub binding: String
}

impl EndpointInfo
{   pub fn new(
      name: impl Into<String>
    , address: impl Into<String>
    , binding: impl Into<String>
    ) -> Self
    {   EndpointInfo
        {   name: name.into()
          , address: address.into()
          , binding: binding.into()
        }
    }
}

/// Resolved endpoint.
///
/// The address is interior-mutable: a selector may rebase the current
/// endpoint onto an alternate address instead of building a new one.
#[derive(Debug)]
pub struct Endpoint
{   name: String
  , service: String
  , binding: String
  , address: RwLock<String>
}

impl Endpoint
{   pub fn new(
      name: impl Into<String>
    , service: impl Into<String>
    , binding: impl Into<String>
    , address: impl Into<String>
    ) -> Self
    {   Endpoint
        {   name: name.into()
          , service: service.into()
          , binding: binding.into()
          , address: RwLock::new(address.into())
        }
    }

    pub fn from_info(info: &EndpointInfo, service: &str) -> Self
    {   Endpoint::new(
          info.name.clone()
        , service
        , info.binding.clone()
        , info.address.clone()
        )
    }

    pub fn name(&self) -> &str
    {   &self.name
    }

    pub fn service_name(&self) -> &str
    {   &self.service
    }

    pub fn binding(&self) -> &str
    {   &self.binding
    }

    pub fn address(&self) -> String
    {   self.address.read().clone()
    }

    pub fn set_address(&self, address: impl Into<String>)
    {   *self.address.write() = address.into();
    }
}

/// A logical service: its declared endpoints and the ones resolved
/// by name
#[derive(Debug, Default)]
pub struct Service
{   name: String
  , candidates: Vec<EndpointInfo>
  , endpoints: HashMap<String, Arc<Endpoint>>
}

impl Service
{   pub fn new(name: impl Into<String>) -> Self
    {   Service
        {   name: name.into()
          , candidates: vec![]
          , endpoints: HashMap::new()
        }
    }

    pub fn name(&self) -> &str
    {   &self.name
    }

    /// Declare and resolve an endpoint
    pub fn add_endpoint(&mut self, info: EndpointInfo) -> Arc<Endpoint>
    {   let endpoint = self.endpoints
          .entry(info.name.clone())
          .or_insert_with(|| Arc::new(Endpoint::from_info(&info, &self.name)))
          .clone();
        self.candidates.push(info);
        endpoint
    }

    /// Declare an endpoint without resolving it
    pub fn add_candidate(&mut self, info: EndpointInfo)
    {   self.candidates.push(info);
    }

    pub fn candidates(&self) -> &[EndpointInfo]
    {   &self.candidates
    }

    pub fn endpoint(&self, name: &str) -> Option<Arc<Endpoint>>
    {   self.endpoints.get(name).cloned()
    }
}
