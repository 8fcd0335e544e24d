//! Bounded retry with exponential backoff and jitter
//!
//! Only transient failures (throttling, unavailability, timeouts, flaky
//! I/O) are retried. Anything else returns on the first attempt, and an
//! exhausted budget returns the last failure unchanged.
//!
//! The operation is a closure producing a fresh future per attempt, so a
//! read-then-mutate sequence inside it re-reads remote state on every
//! retry instead of reusing a stale observation.

use crate::config::{ResilienceConfig, RetryProfile};
use crate::error::{CompactorError, Result};
use backon::{BackoffBuilder, ExponentialBuilder};
use diagnostics::*;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Selects a retry profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Appends, renames, uploads, deletes, data reads
    Mutation,
    /// Existence and length checks
    Metadata,
}

/// Passed to each attempt of a retried operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryContext {
    /// 1 for the first attempt
    pub attempt: u32,
    pub class: RetryClass,
}

impl RetryContext {
    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }
}

/// One scheduled retry, reported to the observer before sleeping
#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub label: String,
    pub class: RetryClass,
    /// The attempt that just failed
    pub attempt: u32,
    pub delay: Duration,
    pub error: String,
}

pub type RetryObserver = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

#[derive(Clone)]
pub struct ResiliencePolicy {
    config: ResilienceConfig,
    observer: Option<RetryObserver>,
}

impl std::fmt::Debug for ResiliencePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResiliencePolicy")
            .field("config", &self.config)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

impl ResiliencePolicy {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            observer: None,
        }
    }

    /// Call `observer` for every retry that is about to be scheduled
    pub fn with_observer(mut self, observer: RetryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Delays between attempts; never longer than the profile's maximum
    pub fn delays(profile: &RetryProfile) -> impl Iterator<Item = Duration> + use<> {
        let mut builder = ExponentialBuilder::default()
            .with_min_delay(profile.min_delay())
            .with_max_delay(profile.max_delay())
            .with_factor(2.0)
            .with_max_times(profile.max_attempts.saturating_sub(1) as usize);
        if profile.jitter {
            builder = builder.with_jitter();
        }
        let cap = profile.max_delay();
        builder.build().map(move |delay| delay.min(cap))
    }

    /// Run `op` until it succeeds, fails permanently, runs out of
    /// attempts, or `cancel` fires.
    pub async fn execute<T, F, Fut>(
        &self,
        class: RetryClass,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let profile = self.config.profile(class);
        let mut delays = Self::delays(&profile);
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(CompactorError::Cancelled);
            }
            attempt += 1;

            let err = match op(RetryContext { attempt, class }).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_transient() {
                return Err(err);
            }
            let Some(delay) = delays.next() else {
                log_warn!(
                    "Giving up on {label} after {attempt} attempts: {error}",
                    label: label,
                    attempt: attempt,
                    error: err.to_string()
                );
                return Err(err);
            };

            log_warn!(
                "Retrying {label} (attempt {attempt} failed: {error}) in {delay_ms} ms",
                label: label,
                attempt: attempt,
                error: err.to_string(),
                delay_ms: delay.as_millis() as u64
            );
            if let Some(observer) = &self.observer {
                observer(&RetryEvent {
                    label: label.to_string(),
                    class,
                    attempt,
                    delay,
                    error: err.to_string(),
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(CompactorError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
