//! Retry and circuit breaking around any [`LlmProvider`].
//!
//! Only opening the stream is retried. Once events are flowing, an error
//! inside the stream is the turn's problem: replaying a half-consumed
//! response would duplicate text the caller has already seen.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tandem_core::context::LlmContext;
use tandem_core::errors::ProviderError;
use tandem_core::provider::{EventStream, LlmProvider, StreamOptions};

#[derive(Clone, Debug)]
pub struct ReliableConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the backoff added or subtracted at random.
    pub jitter_factor: f64,
    /// Consecutive failed requests that open the circuit.
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }
}

impl ReliableConfig {
    /// Delay before retry number `attempt` (0-based). A server hint wins over
    /// the computed backoff.
    pub fn backoff(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint;
        }
        let base = self.base_delay.as_millis() as f64;
        let ceiling = self.max_delay.as_millis() as f64;
        let nominal = (base * 2f64.powi(attempt.min(30) as i32)).min(ceiling);

        let spread = nominal * self.jitter_factor.clamp(0.0, 1.0);
        let offset = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((nominal + offset).max(1.0) as u64)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    /// Cooldown elapsed; one trial request is allowed through.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct Breaker {
    failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    retries: u64,
}

impl Breaker {
    fn state(&self, cooldown: Duration) -> CircuitState {
        match self.opened_at {
            None => CircuitState::Closed,
            Some(at) if at.elapsed() >= cooldown => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }
}

/// Wraps a provider so that retryable failures to open a stream are retried
/// with jittered exponential backoff, and a run of failures stops traffic
/// for a cooldown.
pub struct ReliableProvider<P: LlmProvider> {
    inner: P,
    config: ReliableConfig,
    breaker: Mutex<Breaker>,
}

impl<P: LlmProvider> ReliableProvider<P> {
    pub fn new(inner: P, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            breaker: Mutex::new(Breaker {
                failures: 0,
                opened_at: None,
                trial_in_flight: false,
                retries: 0,
            }),
        }
    }

    pub fn with_defaults(inner: P) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.lock().state(self.config.circuit_breaker_cooldown)
    }

    /// Retries performed over the provider's lifetime.
    pub fn retries(&self) -> u64 {
        self.breaker.lock().retries
    }

    /// Reserve the right to send a request. While half-open only one caller
    /// gets through; the rest see the provider as overloaded.
    fn admit(&self) -> Result<(), ProviderError> {
        let mut breaker = self.breaker.lock();
        match breaker.state(self.config.circuit_breaker_cooldown) {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(ProviderError::Overloaded),
            CircuitState::HalfOpen if breaker.trial_in_flight => Err(ProviderError::Overloaded),
            CircuitState::HalfOpen => {
                debug!(provider = self.inner.name(), "circuit half-open, probing");
                breaker.trial_in_flight = true;
                Ok(())
            }
        }
    }

    fn on_success(&self) {
        let mut breaker = self.breaker.lock();
        if breaker.opened_at.take().is_some() {
            info!(provider = self.inner.name(), "circuit closed");
        }
        breaker.failures = 0;
        breaker.trial_in_flight = false;
    }

    fn on_failure(&self) {
        let mut breaker = self.breaker.lock();
        breaker.failures += 1;
        let was_trial = std::mem::take(&mut breaker.trial_in_flight);
        if was_trial || breaker.failures >= self.config.circuit_breaker_threshold {
            if was_trial || breaker.opened_at.is_none() {
                warn!(
                    provider = self.inner.name(),
                    failures = breaker.failures,
                    cooldown_ms = self.config.circuit_breaker_cooldown.as_millis() as u64,
                    "circuit opened"
                );
            }
            breaker.opened_at = Some(Instant::now());
        }
    }
}

#[async_trait]
impl<P: LlmProvider> LlmProvider for ReliableProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn context_window(&self) -> usize {
        self.inner.context_window()
    }

    async fn stream(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, ProviderError> {
        let mut attempt = 0;
        loop {
            self.admit()?;
            let err = match self.inner.stream(context, options).await {
                Ok(stream) => {
                    self.on_success();
                    return Ok(stream);
                }
                Err(err) => err,
            };
            self.on_failure();

            if !err.is_retryable() || attempt >= self.config.max_retries {
                return Err(err);
            }
            let delay = self.config.backoff(attempt, err.suggested_delay());
            attempt += 1;
            self.breaker.lock().retries += 1;
            warn!(
                provider = self.inner.name(),
                attempt,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                error_kind = err.error_kind(),
                error = %err,
                "provider request failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
