//! Error type shared by selectors, strategies and conduits

/// Errors raised while selecting, dispatching or failing over a call.
/// Implements Clone so a fault can be snapshotted on an exchange
/// and restored after a failed retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error
{   /// I/O-class transport failure, eligible for failover
    #[error("Transport error: {0}")]
    Transport(String)
  , /// Transport reported the service as not available
    #[error("Service not available: {0}")]
    ServiceUnavailable(String)
  , /// Application level fault, passed through untouched
    #[error("Fault: {0}")]
    Fault(String)
  , /// Failover was required but no target is left
    #[error("None of alternative addresses are available at the moment")]
    NoAlternativeAddresses
  , /// A conduit could not be created for a target
    #[error("Conduit initiation failed: {0}")]
    ConduitInitiation(String)
  , /// A strategy needs the in-flight exchange to answer
    #[error("Strategy requires an exchange to compute alternates")]
    ContextRequired
  , /// The call's own deadline elapsed
    #[error("Request timed out")]
    Timeout
  , /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String)
  , /// Generic error
    #[error("Error: {0}")]
    Other(String)
}

impl Error
{   /// Whether this error is an I/O-class failure worth failing over
    pub fn is_transport(&self) -> bool
    {   matches!(
          self
        , Error::Transport(_) | Error::ServiceUnavailable(_)
        )
    }
}

impl From<String> for Error
{   fn from(s: String) -> Self
    {   Error::Other(s)
    }
}

impl From<&str> for Error
{   fn from(s: &str) -> Self
    {   Error::Other(s.to_string())
    }
}

impl From<reqwest::Error> for Error
{   fn from(e: reqwest::Error) -> Self
    {   if e.is_decode()
        {   Error::Fault(e.to_string())
        } else
        {   Error::Transport(e.to_string())
        }
    }
}
