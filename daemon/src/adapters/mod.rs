// External capability adapters.
//
// Vendors sit behind these traits; the core never sees a vendor error type.
// Every call goes through a circuit breaker and a per-call timeout, and the
// result is classified into the retry taxonomy at this boundary.

mod brokerage;
mod chain;
mod conversion;
mod custody;
pub mod mock;

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::{ADAPTER_CALL_TIMEOUT, CIRCUIT_COOLDOWN, CIRCUIT_FAILURE_THRESHOLD};

pub use brokerage::{BrokerageProvider, JournalStatus};
pub use chain::{ChainConfirmation, ChainWatcher};
pub use conversion::{ConversionProviderClient, ConversionSubmission, ProviderConversionStatus};
pub use custody::{CustodyProvider, ProvisionedWallet};

/// Vendor failures, classified by cause at the adapter boundary.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("{service} call timed out after {timeout:?}")]
    Timeout { service: String, timeout: Duration },

    /// 5xx, network failure: retried with backoff.
    #[error("{service} transient failure: {message}")]
    Transient { service: String, message: String },

    /// 4xx: the request itself is wrong, never retried.
    #[error("{service} rejected the request: {message}")]
    Permanent { service: String, message: String },

    #[error("circuit open for {service}")]
    CircuitOpen { service: String },
}

impl AdapterError {
    pub fn transient(service: &str, message: impl Into<String>) -> Self {
        AdapterError::Transient {
            service: service.to_string(),
            message: message.into(),
        }
    }

    pub fn permanent(service: &str, message: impl Into<String>) -> Self {
        AdapterError::Permanent {
            service: service.to_string(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::Timeout { .. }
                | AdapterError::Transient { .. }
                | AdapterError::CircuitOpen { .. }
        )
    }
}

enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// Halts calls to a dependency after a run of failures, probing again once
/// the cooldown elapses.
pub struct CircuitBreaker {
    service: String,
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(service: &str) -> Self {
        Self::with_settings(service, CIRCUIT_FAILURE_THRESHOLD, CIRCUIT_COOLDOWN)
    }

    pub fn with_settings(service: &str, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            service: service.to_string(),
            failure_threshold,
            cooldown,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Check admission. An open breaker rejects immediately; once the
    /// cooldown has elapsed a single probe call is let through.
    pub fn check(&self) -> Result<(), AdapterError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            BreakerState::Closed { .. } | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open { until } => {
                if Instant::now() >= *until {
                    *state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(AdapterError::CircuitOpen {
                        service: self.service.clone(),
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = BreakerState::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let open = |cooldown: Duration| BreakerState::Open {
            until: Instant::now() + cooldown,
        };
        match &mut *state {
            BreakerState::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.failure_threshold {
                    warn!("circuit breaker for {} opened", self.service);
                    metrics::counter!("circuit_breaker_opened", "service" => self.service.clone())
                        .increment(1);
                    *state = open(self.cooldown);
                }
            }
            // a failed probe re-opens immediately
            BreakerState::HalfOpen => {
                warn!("circuit breaker probe for {} failed, re-opening", self.service);
                *state = open(self.cooldown);
            }
            BreakerState::Open { .. } => {}
        }
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        matches!(&*state, BreakerState::Open { until } if Instant::now() < *until)
    }
}

/// Run one adapter call under the breaker and the per-call timeout, feeding
/// the outcome back into the breaker. Timeouts and transient errors count
/// as failures; permanent rejections do not trip the breaker.
pub async fn guarded<T, F>(breaker: &CircuitBreaker, fut: F) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    breaker.check()?;
    let outcome = match tokio::time::timeout(ADAPTER_CALL_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout {
            service: breaker.service().to_string(),
            timeout: ADAPTER_CALL_TIMEOUT,
        }),
    };
    match &outcome {
        Ok(_) => breaker.record_success(),
        Err(err) if err.is_retryable() => breaker.record_failure(),
        Err(_) => breaker.record_success(),
    }
    outcome
}

/// The adapter bundle handed to the core: one capability per partner, each
/// behind its own breaker.
pub struct Adapters {
    pub custody: std::sync::Arc<dyn CustodyProvider>,
    pub conversion: std::sync::Arc<dyn ConversionProviderClient>,
    pub brokerage: std::sync::Arc<dyn BrokerageProvider>,
    pub chain_watcher: std::sync::Arc<dyn ChainWatcher>,
    pub custody_breaker: CircuitBreaker,
    pub conversion_breaker: CircuitBreaker,
    pub brokerage_breaker: CircuitBreaker,
    pub chain_breaker: CircuitBreaker,
}

impl Adapters {
    pub fn new(
        custody: std::sync::Arc<dyn CustodyProvider>,
        conversion: std::sync::Arc<dyn ConversionProviderClient>,
        brokerage: std::sync::Arc<dyn BrokerageProvider>,
        chain_watcher: std::sync::Arc<dyn ChainWatcher>,
    ) -> Self {
        Self {
            custody,
            conversion,
            brokerage,
            chain_watcher,
            custody_breaker: CircuitBreaker::new("custody"),
            conversion_breaker: CircuitBreaker::new("conversion"),
            brokerage_breaker: CircuitBreaker::new("brokerage"),
            chain_breaker: CircuitBreaker::new("chain"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_threshold_and_recovers() {
        let breaker =
            CircuitBreaker::with_settings("test", 2, Duration::from_millis(10));
        assert!(breaker.check().is_ok());
        breaker.record_failure();
        assert!(breaker.check().is_ok());
        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(matches!(
            breaker.check(),
            Err(AdapterError::CircuitOpen { .. })
        ));

        std::thread::sleep(Duration::from_millis(15));
        // half-open probe admitted
        assert!(breaker.check().is_ok());
        breaker.record_success();
        assert!(breaker.check().is_ok());
        assert!(!breaker.is_open());
    }

    #[test]
    fn failed_probe_reopens() {
        let breaker =
            CircuitBreaker::with_settings("test", 1, Duration::from_millis(10));
        breaker.record_failure();
        assert!(breaker.is_open());
        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.check().is_ok());
        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[tokio::test]
    async fn guarded_counts_only_retryable_failures() {
        let breaker = CircuitBreaker::with_settings("test", 1, Duration::from_secs(60));
        // permanent rejection does not trip the breaker
        let result: Result<(), _> =
            guarded(&breaker, async { Err(AdapterError::permanent("test", "400")) }).await;
        assert!(result.is_err());
        assert!(!breaker.is_open());

        let result: Result<(), _> =
            guarded(&breaker, async { Err(AdapterError::transient("test", "503")) }).await;
        assert!(result.is_err());
        assert!(breaker.is_open());
    }
}
