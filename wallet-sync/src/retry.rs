//! Bounded reconnect-and-retry around provider calls.
//!
//! A transient failure reinitializes the provider and repeats the same step,
//! up to `max_attempts_per_cycle` times. Permanent failures and failed
//! reinitializations end the sync right away. What happens once the budget
//! is spent is up to the caller: the scanner consults
//! [`RetryPolicy::on_exhausted`], every other step fails.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ProviderError, ProviderResult, SyncError, SyncResult};
use crate::provider::ChainProvider;

/// What the scanner does when a cycle keeps failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustedPolicy {
    /// Count the cycle as "no history found", advance both gap counters
    /// and record a degraded-cycle warning.
    #[default]
    AdvanceGap,
    /// Abort the sync with `ProviderUnavailable`.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per step, including the first
    pub max_attempts_per_cycle: u32,
    /// Delay before the second attempt, doubled for each further one
    pub backoff: Duration,
    pub on_exhausted: ExhaustedPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts_per_cycle: 2,
            backoff: Duration::from_millis(250),
            on_exhausted: ExhaustedPolicy::AdvanceGap,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts_per_cycle = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_on_exhausted(mut self, policy: ExhaustedPolicy) -> Self {
        self.on_exhausted = policy;
        self
    }
}

/// Outcome of a retried step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Completed(T),
    /// Every attempt failed transiently; carries the last error
    Exhausted(ProviderError),
}

pub struct RetryGovernor<'a> {
    provider: &'a dyn ChainProvider,
    policy: &'a RetryPolicy,
}

impl<'a> RetryGovernor<'a> {
    pub fn new(provider: &'a dyn ChainProvider, policy: &'a RetryPolicy) -> Self {
        Self {
            provider,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        self.policy
    }

    /// Run `step` until it succeeds or the attempt budget is spent.
    ///
    /// `step` is called once per attempt and must not leave state behind
    /// when its future fails.
    pub async fn attempt<T, F, Fut>(&self, label: &str, mut step: F) -> SyncResult<Attempt<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let attempts = self.policy.max_attempts_per_cycle.max(1);
        let mut delay = self.policy.backoff;
        let mut attempt = 1;

        loop {
            let error = match step().await {
                Ok(value) => return Ok(Attempt::Completed(value)),
                Err(e) if !e.is_transient() => {
                    warn!("{} failed permanently: {}", label, e);
                    return Err(SyncError::ProviderUnavailable(e));
                }
                Err(e) => e,
            };

            warn!("{} failed (attempt {}/{}): {}", label, attempt, attempts, error);
            self.reinitialize(label).await?;

            if attempt >= attempts {
                return Ok(Attempt::Exhausted(error));
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            delay = delay.saturating_mul(2);
            attempt += 1;
        }
    }

    /// Like [`attempt`](Self::attempt), but an exhausted budget is an error.
    pub async fn run<T, F, Fut>(&self, label: &str, step: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        match self.attempt(label, step).await? {
            Attempt::Completed(value) => Ok(value),
            Attempt::Exhausted(e) => Err(SyncError::ProviderUnavailable(e)),
        }
    }

    async fn reinitialize(&self, label: &str) -> SyncResult<()> {
        debug!("Reinitializing {} provider after failed {}", self.provider.name(), label);
        self.provider.initialize().await.map_err(|e| {
            warn!("Reinitializing {} provider failed: {}", self.provider.name(), e);
            SyncError::ProviderUnavailable(e)
        })
    }
}
