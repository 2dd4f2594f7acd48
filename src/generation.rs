//! Generation Client Boundary - Metered, Retryable Calls
//!
//! The synthesis service is a fallible async function with a per-call cost.
//! `RetryingGenerator` drives one request through an explicit attempt state
//! machine: governor token, call, classify, back off or stop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::asset::{Asset, AssetKey};
use crate::campaign::MatrixCell;
use crate::cancel::CancelToken;
use crate::governor::{GovernorError, RateGovernor};
use crate::resolver::CellContext;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationError {
    #[error("Generation timed out")]
    Timeout,

    #[error("Upstream server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Upstream rate limited")]
    UpstreamRateLimited,

    #[error("Network error: {0}")]
    Network(String),

    #[error(transparent)]
    RateLimit(#[from] GovernorError),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Content policy rejection: {0}")]
    ContentPolicy(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Cancelled")]
    Cancelled,
}

impl GenerationError {
    /// Transient classes are retried with backoff; everything else fails the
    /// request immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GenerationError::Timeout
                | GenerationError::Server { .. }
                | GenerationError::UpstreamRateLimited
                | GenerationError::Network(_)
                | GenerationError::RateLimit(_)
        )
    }
}

/// Opaque request for one asset key.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub key: AssetKey,
    /// First cell (in matrix order) that asked for this key.
    pub cell: MatrixCell,
    pub payload: Value,
}

/// Builds the service payload for a cell. Prompt content lives outside the engine.
pub trait RequestBuilder: Send + Sync {
    fn build(&self, ctx: &CellContext<'_>) -> Value;
}

impl<F> RequestBuilder for F
where
    F: Fn(&CellContext<'_>) -> Value + Send + Sync,
{
    fn build(&self, ctx: &CellContext<'_>) -> Value {
        self(ctx)
    }
}

#[async_trait]
pub trait GenerationClient: Send + Sync {
    fn name(&self) -> &str;

    /// Charged for every call issued, successful or not.
    fn cost_per_call(&self) -> f64;

    async fn generate(&self, request: &GenerationRequest) -> Result<Asset, GenerationError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Wall-clock limit for a single call.
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            attempt_timeout_ms: 120_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based): base * 2^(attempt-1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(factor)
                .min(self.backoff_max_ms),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "attempt")]
pub enum AttemptState {
    Pending,
    Retrying(u32),
    Succeeded,
    FailedPermanent,
    FailedExhausted,
    Cancelled,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptState::Pending | AttemptState::Retrying(_))
    }

    /// Transition after attempt number `attempt` finished with `result`.
    pub fn next<T>(
        attempt: u32,
        result: &Result<T, GenerationError>,
        policy: &RetryPolicy,
    ) -> AttemptState {
        match result {
            Ok(_) => AttemptState::Succeeded,
            Err(GenerationError::Cancelled) => AttemptState::Cancelled,
            Err(e) if !e.is_transient() => AttemptState::FailedPermanent,
            Err(_) if attempt >= policy.max_attempts => AttemptState::FailedExhausted,
            Err(_) => AttemptState::Retrying(attempt),
        }
    }
}

/// Result of driving one request to a terminal state.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub result: Result<Asset, GenerationError>,
    /// Attempts made, including ones that never got a governor token.
    pub attempts: u32,
    /// Calls actually issued to the service.
    pub calls: u32,
    pub cost: f64,
    pub latency: Duration,
    pub state: AttemptState,
}

pub struct RetryingGenerator {
    client: Arc<dyn GenerationClient>,
    governor: Arc<RateGovernor>,
    policy: RetryPolicy,
    cancel_grace: Duration,
}

impl RetryingGenerator {
    pub fn new(
        client: Arc<dyn GenerationClient>,
        governor: Arc<RateGovernor>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            governor,
            policy,
            cancel_grace: Duration::from_secs(30),
        }
    }

    /// How long an in-flight call may keep running after cancellation.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> GenerationOutcome {
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut calls = 0u32;
        let mut cost = 0.0;

        loop {
            if cancel.is_cancelled() {
                return GenerationOutcome {
                    result: Err(GenerationError::Cancelled),
                    attempts,
                    calls,
                    cost,
                    latency: started.elapsed(),
                    state: AttemptState::Cancelled,
                };
            }

            attempts += 1;
            let token = tokio::select! {
                token = self.governor.acquire() => token.map_err(GenerationError::RateLimit),
                _ = cancel.cancelled() => Err(GenerationError::Cancelled),
            };
            let result = match token {
                Ok(()) => {
                    calls += 1;
                    cost += self.client.cost_per_call();
                    self.call_once(request, cancel).await
                }
                Err(e) => Err(e),
            };

            let state = AttemptState::next(attempts, &result, &self.policy);
            match (state, result) {
                (AttemptState::Succeeded, Ok(asset)) => {
                    info!(key = %request.key.short(), cell = %request.cell, attempts, "generation succeeded");
                    return GenerationOutcome {
                        result: Ok(asset),
                        attempts,
                        calls,
                        cost,
                        latency: started.elapsed(),
                        state,
                    };
                }
                (AttemptState::Retrying(n), Err(e)) => {
                    let delay = self.policy.backoff(n);
                    warn!(
                        key = %request.key.short(),
                        attempt = n,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient generation failure, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
                (terminal, result) => {
                    if let Err(e) = &result {
                        warn!(key = %request.key.short(), cell = %request.cell, attempts, state = ?terminal, error = %e, "generation failed");
                    }
                    return GenerationOutcome {
                        result,
                        attempts,
                        calls,
                        cost,
                        latency: started.elapsed(),
                        state: terminal,
                    };
                }
            }
        }
    }

    /// One service call under the per-attempt timeout. After cancellation the
    /// call gets `cancel_grace` to finish before it is dropped.
    async fn call_once(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> Result<Asset, GenerationError> {
        let timeout = Duration::from_millis(self.policy.attempt_timeout_ms);
        let call = tokio::time::timeout(timeout, self.client.generate(request));
        tokio::pin!(call);

        let timed = tokio::select! {
            timed = &mut call => timed,
            _ = cancel.cancelled() => {
                debug!(key = %request.key.short(), grace_ms = self.cancel_grace.as_millis() as u64, "cancel requested during call");
                match tokio::time::timeout(self.cancel_grace, &mut call).await {
                    Ok(timed) => timed,
                    Err(_) => return Err(GenerationError::Cancelled),
                }
            }
        };

        timed.unwrap_or(Err(GenerationError::Timeout))
    }
}
