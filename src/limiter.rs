//! The public limiter surface.
//!
//! `acquire*` funnels through one admission loop: take an arrival ticket,
//! poll the store until the ticket is both at the head of the queue and
//! the window has room, then return. `adjust` and `status` are single
//! store round trips and bypass the queue entirely.
//!
//! Invariants:
//! - Admission order equals ticket (arrival) order among blocked callers
//!   on the same resource.
//! - A timed-out or cancelled wait withdraws its ticket without touching
//!   window state; remaining waiters keep their positions.
//! - A cost larger than its ceiling fails fast before any store access.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{RateLimitConfig, RetryConfig, TokenLimits};
use crate::connection::RedisConnectionManager;
use crate::error::RateLimitError;
use crate::models::{AcquireResult, Dimension, RateLimitStatus, RecordId};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::store::{
    AdmitOutcome, AdmitRequest, CoordinationStore, DimensionCharge, RedisStore, ReservationSpec,
    Ticket,
};

/// Liveness lease attached to each waiting ticket. Refreshed on every
/// poll; a waiter silent for longer (crashed process, dropped future with
/// no runtime) is pruned from the queue by whoever polls next.
const TICKET_LEASE: Duration = Duration::from_secs(5);

/// Client-side distributed rate limiter for one named resource.
///
/// Cloning is cheap and clones share the same store handle; any number of
/// tasks may call [`acquire`](Self::acquire) concurrently.
///
/// ```no_run
/// use llm_ratelimiter::{RateLimitConfig, RateLimiter};
///
/// # async fn demo() -> Result<(), llm_ratelimiter::RateLimitError> {
/// let config = RateLimitConfig::builder().rpm(100).tpm(100_000).build()?;
/// let limiter = RateLimiter::connect("redis://localhost:6379", "gpt-4", config)?;
/// limiter.acquire_tokens(5_000).await?;
/// // ... call the provider ...
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CoordinationStore>,
    config: RateLimitConfig,
    model: String,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("model", &self.model)
            .field("config", &self.config)
            .finish()
    }
}

impl RateLimiter {
    /// Connect by URL with the default retry policy, owning the handle.
    pub fn connect(
        url: &str,
        model: impl Into<String>,
        config: RateLimitConfig,
    ) -> Result<Self, RateLimitError> {
        let manager = RedisConnectionManager::connect(url, RetryConfig::default())?;
        Ok(Self::with_manager(manager, model, config))
    }

    /// Use a pre-built `redis::Client` with the default retry policy.
    pub fn with_client(
        client: redis::Client,
        model: impl Into<String>,
        config: RateLimitConfig,
    ) -> Self {
        Self::with_manager(RedisConnectionManager::with_client(client, RetryConfig::default()), model, config)
    }

    /// Use a caller-built connection manager (and its retry policy).
    pub fn with_manager(
        manager: RedisConnectionManager,
        model: impl Into<String>,
        config: RateLimitConfig,
    ) -> Self {
        let model = model.into();
        let namespace = format!("{}{}", config.key_prefix(), model);
        Self::with_store(Arc::new(RedisStore::new(manager, namespace)), model, config)
    }

    /// Use any coordination store, e.g. [`MemoryStore`](crate::MemoryStore)
    /// for single-process deployments or tests.
    pub fn with_store(
        store: Arc<dyn CoordinationStore>,
        model: impl Into<String>,
        config: RateLimitConfig,
    ) -> Self {
        Self { store, config, model: model.into(), sleeper: Arc::new(TokioSleeper) }
    }

    /// Replace the sleeper used between admission polls (tests).
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// The resource this limiter meters.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit one request with no token cost (RPM only in unified mode;
    /// a zero-token reservation in split mode).
    pub async fn acquire(&self) -> Result<AcquireResult, RateLimitError> {
        match self.config.limits() {
            TokenLimits::Unified { .. } => self.acquire_tokens(0).await,
            TokenLimits::Split { .. } => self.acquire_split(0, 0).await,
        }
    }

    /// Admit one request charging `tokens` against the unified TPM budget.
    /// Blocks (subject to `max_wait`) until admitted in arrival order.
    pub async fn acquire_tokens(&self, tokens: u64) -> Result<AcquireResult, RateLimitError> {
        let tpm = match self.config.limits() {
            TokenLimits::Unified { tpm } => tpm,
            TokenLimits::Split { .. } => {
                return Err(RateLimitError::invalid_config(
                    "acquire_tokens on a split-mode limiter; use acquire_split",
                ))
            }
        };
        if tokens > tpm {
            return Err(RateLimitError::CostExceedsCeiling {
                dimension: Dimension::Tokens,
                cost: tokens,
                ceiling: tpm,
            });
        }

        let request = AdmitRequest {
            charges: vec![
                DimensionCharge { dimension: Dimension::Requests, ceiling: self.config.rpm(), cost: 1 },
                DimensionCharge { dimension: Dimension::Tokens, ceiling: tpm, cost: tokens },
            ],
            reservation: None,
        };
        self.admit(&request).await?;
        Ok(AcquireResult { record_id: None, input_tokens: tokens, output_tokens: 0 })
    }

    /// Admit one request charging the input and (estimated) output budgets
    /// independently, in the same atomic step. The returned
    /// [`AcquireResult::record_id`] reconciles the estimate via
    /// [`adjust`](Self::adjust) once the actual output cost is known.
    pub async fn acquire_split(
        &self,
        input_tokens: u64,
        estimated_output_tokens: u64,
    ) -> Result<AcquireResult, RateLimitError> {
        let (input_tpm, output_tpm) = match self.config.limits() {
            TokenLimits::Split { input_tpm, output_tpm } => (input_tpm, output_tpm),
            TokenLimits::Unified { .. } => {
                return Err(RateLimitError::invalid_config(
                    "acquire_split on a unified-mode limiter; use acquire_tokens",
                ))
            }
        };
        if input_tokens > input_tpm {
            return Err(RateLimitError::CostExceedsCeiling {
                dimension: Dimension::InputTokens,
                cost: input_tokens,
                ceiling: input_tpm,
            });
        }
        if estimated_output_tokens > output_tpm {
            return Err(RateLimitError::CostExceedsCeiling {
                dimension: Dimension::OutputTokens,
                cost: estimated_output_tokens,
                ceiling: output_tpm,
            });
        }

        let record_id = RecordId::new();
        let request = AdmitRequest {
            charges: vec![
                DimensionCharge { dimension: Dimension::Requests, ceiling: self.config.rpm(), cost: 1 },
                DimensionCharge {
                    dimension: Dimension::InputTokens,
                    ceiling: input_tpm,
                    cost: input_tokens,
                },
                DimensionCharge {
                    dimension: Dimension::OutputTokens,
                    ceiling: output_tpm,
                    cost: estimated_output_tokens,
                },
            ],
            reservation: Some(ReservationSpec {
                record_id: record_id.clone(),
                reserved_output: estimated_output_tokens,
            }),
        };
        self.admit(&request).await?;
        Ok(AcquireResult {
            record_id: Some(record_id),
            input_tokens,
            output_tokens: estimated_output_tokens,
        })
    }

    /// Reconcile a prior reservation with the actual output cost. Charges
    /// the shortfall (even past the ceiling, since the work already
    /// happened) or refunds unused headroom. Each record reconciles at
    /// most once.
    pub async fn adjust(
        &self,
        record_id: &RecordId,
        actual_output_tokens: u64,
    ) -> Result<(), RateLimitError> {
        let delta = self.store.adjust(record_id, actual_output_tokens).await?;
        tracing::debug!(
            record_id = %record_id,
            delta,
            model = %self.model,
            "reservation reconciled"
        );
        Ok(())
    }

    /// Non-blocking snapshot of remaining capacity per dimension.
    pub async fn status(&self) -> Result<RateLimitStatus, RateLimitError> {
        let rows = self.store.status(&self.config.ceilings()).await?;
        let mut status = RateLimitStatus {
            rpm_remaining: 0,
            tpm_remaining: None,
            input_tpm_remaining: None,
            output_tpm_remaining: None,
        };
        for (dimension, remaining) in rows {
            match dimension {
                Dimension::Requests => status.rpm_remaining = remaining,
                Dimension::Tokens => status.tpm_remaining = Some(remaining),
                Dimension::InputTokens => status.input_tpm_remaining = Some(remaining),
                Dimension::OutputTokens => status.output_tpm_remaining = Some(remaining),
            }
        }
        Ok(status)
    }

    /// Ticket-ordered admission loop: enqueue, then poll until this ticket
    /// is the head of the queue and every dimension fits.
    async fn admit(&self, request: &AdmitRequest) -> Result<(), RateLimitError> {
        let started = Instant::now();
        let deadline = self.config.max_wait().map(|wait| started + wait);

        loop {
            let ticket = self.store.enqueue(TICKET_LEASE).await?;
            tracing::debug!(ticket = ticket.0, model = %self.model, "admission ticket issued");
            let mut guard = TicketGuard { store: self.store.clone(), ticket, armed: true };

            loop {
                match self.store.try_admit(ticket, TICKET_LEASE, request).await? {
                    AdmitOutcome::Admitted => {
                        guard.armed = false;
                        tracing::debug!(
                            ticket = ticket.0,
                            model = %self.model,
                            waited_ms = started.elapsed().as_millis() as u64,
                            "admitted"
                        );
                        return Ok(());
                    }
                    AdmitOutcome::TicketExpired => {
                        // Our lease lapsed and someone pruned us; the
                        // arrival position is forfeit. Rejoin at the back.
                        guard.armed = false;
                        tracing::debug!(
                            ticket = ticket.0,
                            model = %self.model,
                            "ticket lease lapsed; re-enqueueing"
                        );
                        break;
                    }
                    AdmitOutcome::WaitTurn | AdmitOutcome::WaitCapacity { .. } => {
                        if let Some(deadline) = deadline {
                            if Instant::now() >= deadline {
                                guard.armed = false;
                                if let Err(error) = self.store.withdraw(ticket).await {
                                    tracing::debug!(
                                        ticket = ticket.0,
                                        error = %error,
                                        "withdraw after timeout failed"
                                    );
                                }
                                return Err(RateLimitError::Timeout {
                                    waited: started.elapsed(),
                                    max_wait: self.config.max_wait().expect("deadline implies max_wait"),
                                });
                            }
                        }
                        self.sleeper.sleep(self.config.poll_interval()).await;
                    }
                }
            }
        }
    }
}

/// Releases a ticket if the owning `acquire` future is dropped mid-wait.
/// Best effort: without a runtime the store-side lease bounds the damage.
struct TicketGuard {
    store: Arc<dyn CoordinationStore>,
    ticket: Ticket,
    armed: bool,
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            let ticket = self.ticket;
            handle.spawn(async move {
                let _ = store.withdraw(ticket).await;
            });
        }
    }
}
