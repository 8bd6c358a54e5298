//! Per-address circuit breakers

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::Error;

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState
{   /// Requests flow
    Closed
  , /// Requests are refused until the timeout elapses
    Open
  , /// One trial request is let through
    HalfOpen
}

/// Health gate for one target
pub trait CircuitBreaker: Send + Sync + fmt::Debug
{   /// Whether a call may be attempted right now
    fn allow_request(&self) -> bool;

    /// Whether `allow_request` would currently succeed, without
    /// taking a half-open trial
    fn is_available(&self) -> bool
    {   true
    }

    fn mark_failure(&self, cause: Option<&Error>);

    fn mark_success(&self);

    fn state(&self) -> CircuitState
    {   CircuitState::Closed
    }
}

/// Breaker that never trips
#[derive(Debug, Default)]
pub struct NoOpCircuitBreaker;

impl CircuitBreaker for NoOpCircuitBreaker
{   fn allow_request(&self) -> bool
    {   true
    }

    fn mark_failure(&self, _cause: Option<&Error>) {}

    fn mark_success(&self) {}
}

#[derive(Debug)]
struct BreakerState
{   state: CircuitState
  , failures: u32
  , opened_at: Option<Instant>
  , trial_started: Option<Instant>
}

/// Opens after `threshold` failures since the last success and stays
/// open for `timeout`. Then a single trial request is allowed: success
/// closes the breaker, failure reopens it. A trial whose outcome is never
/// reported is replaced by a new one after another `timeout`.
#[derive(Debug)]
pub struct ThresholdCircuitBreaker
{   name: String
  , threshold: u32
  , timeout: Duration
  , inner: Mutex<BreakerState>
}

impl ThresholdCircuitBreaker
{   pub fn new(
      name: impl Into<String>
    , threshold: u32
    , timeout: Duration
    ) -> Self
    {   ThresholdCircuitBreaker
        {   name: name.into()
          , threshold: threshold.max(1)
          , timeout
          , inner: Mutex::new(BreakerState
            {   state: CircuitState::Closed
              , failures: 0
              , opened_at: None
              , trial_started: None
            })
        }
    }

    pub fn name(&self) -> &str
    {   &self.name
    }

    pub fn threshold(&self) -> u32
    {   self.threshold
    }

    pub fn timeout(&self) -> Duration
    {   self.timeout
    }

    pub fn failures(&self) -> u32
    {   self.inner.lock().failures
    }

    fn elapsed(since: Option<Instant>, timeout: Duration) -> bool
    {   since.map_or(true, |at| at.elapsed() >= timeout)
    }
}

impl CircuitBreaker for ThresholdCircuitBreaker
{   fn allow_request(&self) -> bool
    {   let mut inner = self.inner.lock();
        match inner.state
        {   CircuitState::Closed => true
          , CircuitState::Open => {
              if Self::elapsed(inner.opened_at, self.timeout)
              {   info!("Circuit {} open -> half-open", self.name);
                  inner.state = CircuitState::HalfOpen;
                  inner.trial_started = Some(Instant::now());
                  true
              } else
              {   false
              }
            }
          , CircuitState::HalfOpen => {
              if Self::elapsed(inner.trial_started, self.timeout)
              {   debug!("Circuit {} trial expired, allowing another", self.name);
                  inner.trial_started = Some(Instant::now());
                  true
              } else
              {   false
              }
            }
        }
    }

    fn is_available(&self) -> bool
    {   let inner = self.inner.lock();
        match inner.state
        {   CircuitState::Closed => true
          , CircuitState::Open => Self::elapsed(inner.opened_at, self.timeout)
          , CircuitState::HalfOpen => {
              Self::elapsed(inner.trial_started, self.timeout)
            }
        }
    }

    fn mark_failure(&self, cause: Option<&Error>)
    {   let mut inner = self.inner.lock();
        inner.failures = inner.failures.saturating_add(1);
        debug!(
          "Circuit {} failure {}/{}: {:?}"
        , self.name, inner.failures, self.threshold, cause
        );
        match inner.state
        {   CircuitState::HalfOpen => {
              warn!("Circuit {} half-open -> open", self.name);
              inner.state = CircuitState::Open;
              inner.opened_at = Some(Instant::now());
              inner.trial_started = None;
            }
          , CircuitState::Closed if inner.failures >= self.threshold => {
              warn!("Circuit {} closed -> open", self.name);
              inner.state = CircuitState::Open;
              inner.opened_at = Some(Instant::now());
            }
          , CircuitState::Open => {
              inner.opened_at = Some(Instant::now());
            }
          , CircuitState::Closed => {}
        }
    }

    fn mark_success(&self)
    {   let mut inner = self.inner.lock();
        match inner.state
        {   CircuitState::Open => {
              debug!("Circuit {} open, ignoring late success", self.name);
              return;
            }
          , CircuitState::HalfOpen => {
              info!("Circuit {} half-open -> closed", self.name);
            }
          , CircuitState::Closed => {}
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.trial_started = None;
    }

    fn state(&self) -> CircuitState
    {   self.inner.lock().state
    }
}

/// Breakers keyed by base address.
///
/// Lookups match by prefix, so `http://host:9000` covers
/// `http://host:9000/path?x=1`; the longest registered prefix wins.
/// Unknown addresses get a breaker created on first use, empty ones
/// share a no-op breaker.
#[derive(Debug)]
pub struct CircuitBreakerRegistry
{   threshold: u32
  , timeout: Duration
  , circuits: Mutex<HashMap<String, Arc<dyn CircuitBreaker>>>
  , noop: Arc<dyn CircuitBreaker>
}

impl CircuitBreakerRegistry
{   pub fn new(threshold: u32, timeout: Duration) -> Self
    {   CircuitBreakerRegistry
        {   threshold
          , timeout
          , circuits: Mutex::new(HashMap::new())
          , noop: Arc::new(NoOpCircuitBreaker)
        }
    }

    pub fn threshold(&self) -> u32
    {   self.threshold
    }

    pub fn timeout(&self) -> Duration
    {   self.timeout
    }

    /// Register a breaker for `address` unless one exists
    pub fn register(&self, address: &str)
    {   if address.is_empty()
        {   return;
        }
        let mut circuits = self.circuits.lock();
        if !circuits.contains_key(address)
        {   debug!("Registering circuit breaker for {}", address);
            circuits.insert(address.to_string(), self.create(address));
        }
    }

    /// Breaker covering `address`
    pub fn get(&self, address: Option<&str>) -> Arc<dyn CircuitBreaker>
    {   let address = match address
        {   Some(address) if !address.is_empty() => address
          , _ => return self.noop.clone()
        };
        let mut circuits = self.circuits.lock();
        let found = circuits
          .iter()
          .filter(|(base, _)| address.starts_with(base.as_str()))
          .max_by_key(|(base, _)| base.len())
          .map(|(_, breaker)| breaker.clone());
        match found
        {   Some(breaker) => breaker
          , None => {
              let breaker = self.create(address);
              circuits.insert(address.to_string(), breaker.clone());
              breaker
            }
        }
    }

    /// Whether the breaker covering `address` refuses requests
    pub fn is_failover_required(&self, address: Option<&str>) -> bool
    {   !self.get(address).allow_request()
    }

    pub fn is_empty(&self) -> bool
    {   self.circuits.lock().is_empty()
    }

    pub fn len(&self) -> usize
    {   self.circuits.lock().len()
    }

    fn create(&self, address: &str) -> Arc<dyn CircuitBreaker>
    {   Arc::new(ThresholdCircuitBreaker::new(
          address
        , self.threshold
        , self.timeout
        ))
    }
}
