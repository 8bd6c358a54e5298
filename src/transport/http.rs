//! JSON over HTTP conduit

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, trace};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::request::Exchange;
use crate::transport::{Conduit, ConduitInitiator};

const SERVICE_UNAVAILABLE: u16 = 503;

// ===== Wire Types =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCallRequest
{   pub operation: String
  , pub params: Vec<Value>
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HttpCallResponse
{   Many(Vec<Value>)
  , One(Value)
}

impl HttpCallResponse
{   fn into_values(self) -> Vec<Value>
    {   match self
        {   HttpCallResponse::Many(values) => values
          , HttpCallResponse::One(Value::Null) => vec![]
          , HttpCallResponse::One(value) => vec![value]
        }
    }
}

// ===== Conduit =====

/// Posts each call as JSON to its target address
#[derive(Debug)]
pub struct HttpConduit
{   target: String
  , http_client: reqwest::Client
}

impl HttpConduit
{   pub fn new(
      target: impl Into<String>
    , http_client: reqwest::Client
    ) -> Self
    {   HttpConduit
        {   target: target.into()
          , http_client
        }
    }
}

#[async_trait]
impl Conduit for HttpConduit
{   fn target(&self) -> &str
    {   &self.target
    }

    async fn send(&self, exchange: &mut Exchange)
      -> Result<Vec<Value>, Error>
    {   let request = HttpCallRequest
        {   operation: exchange.operation
              .as_ref()
              .map(|o| o.name.clone())
              .unwrap_or_default()
          , params: exchange.out_message.content
              .clone()
              .unwrap_or_default()
        };
        let url = exchange.out_message
          .get_str(crate::REQUEST_URI)
          .unwrap_or_else(|| self.target.clone());

        trace!("HTTP call to {}: {:?}", url, request);

        let response = self.http_client
          .post(&url)
          .header("Content-Type", "application/json")
          .json(&request)
          .send()
          .await
          .map_err(|e| {
            error!("HTTP error for {}: {}", url, e);
            Error::from(e)
          })?;

        let status = response.status();
        trace!("HTTP response status: {}", status);
        exchange.response_code = Some(status.as_u16());

        if status.as_u16() == SERVICE_UNAVAILABLE
        {   debug!("Service not available at {}", url);
            exchange.service_not_available = true;
            return Err(Error::ServiceUnavailable(url));
        }

        if !status.is_success()
        {   let error_text = response.text().await
              .unwrap_or_else(|_|
                "Unknown error".to_string()
              );
            error!("Call to {} failed: {}", url, error_text);
            return Err(Error::Fault(
              format!("{}: {}", status, error_text)
            ));
        }

        if exchange.operation.as_ref().map_or(false, |o| o.one_way)
        {   return Ok(vec![]);
        }

        let body: HttpCallResponse
          = response.json().await.map_err(|e| {
            error!("Parse error: {}", e);
            Error::Fault(e.to_string())
          })?;
        Ok(body.into_values())
    }
}

/// Creates one HTTP conduit per address, sharing a client
#[derive(Debug, Clone)]
pub struct HttpConduitInitiator
{   http_client: reqwest::Client
}

impl HttpConduitInitiator
{   pub fn new(timeout: Option<Duration>) -> Result<Self, Error>
    {   let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout
        {   builder = builder.timeout(timeout);
        }
        let http_client = builder.build().map_err(|e| {
          Error::InvalidConfiguration(e.to_string())
        })?;
        Ok(HttpConduitInitiator { http_client })
    }
}

impl ConduitInitiator for HttpConduitInitiator
{   fn conduit(
      &self
    , endpoint: &Endpoint
    , address: &str
    ) -> Result<Arc<dyn Conduit>, Error>
    {   if address.is_empty()
        {   return Err(Error::ConduitInitiation(format!(
              "no address for endpoint {}"
            , endpoint.name()
            )));
        }
        debug!("Creating HTTP conduit for {}", address);
        Ok(Arc::new(HttpConduit::new(address, self.http_client.clone())))
    }
}
