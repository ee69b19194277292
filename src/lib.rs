#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # llm-ratelimiter
//!
//! Client-side distributed rate limiting for LLM API calls. Any number of
//! processes on any number of machines share a single logical TPM/RPM
//! budget per model, coordinated through Redis, with admission in strict
//! arrival order.
//!
//! ## Features
//!
//! - **Sliding-window budgets**: rolling 60-second windows per dimension
//!   (requests, tokens, or split input/output tokens), checked and charged
//!   in one atomic store operation
//! - **FIFO admission**: blocked callers are served in arrival order; a
//!   later arrival never overtakes an earlier one
//! - **Reservation and adjustment**: reserve an output-token estimate at
//!   admission and reconcile it once the provider reports actual usage
//! - **Resilient store access**: transient Redis failures retried with
//!   exponential backoff and jitter
//!
//! ## Quick Start
//!
//! ```no_run
//! use llm_ratelimiter::{RateLimitConfig, RateLimiter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), llm_ratelimiter::RateLimitError> {
//!     let config = RateLimitConfig::builder().rpm(100).tpm(100_000).build()?;
//!     let limiter = RateLimiter::connect("redis://localhost:6379", "gpt-4", config)?;
//!
//!     limiter.acquire_tokens(5_000).await?;
//!     // ... call the provider ...
//!     Ok(())
//! }
//! ```
//!
//! Split mode reserves an output estimate and reconciles it later:
//!
//! ```no_run
//! # use llm_ratelimiter::{RateLimitConfig, RateLimiter};
//! # async fn demo() -> Result<(), llm_ratelimiter::RateLimitError> {
//! let config = RateLimitConfig::builder()
//!     .rpm(360)
//!     .input_tpm(4_000_000)
//!     .output_tpm(128_000)
//!     .build()?;
//! let limiter = RateLimiter::connect("redis://localhost:6379", "gemini-1.5-pro", config)?;
//!
//! let result = limiter.acquire_split(5_000, 2_048).await?;
//! // ... call the provider, observe actual output usage ...
//! let record_id = result.record_id.expect("split mode");
//! limiter.adjust(&record_id, 1_500).await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod jitter;
pub mod limiter;
pub mod models;
mod scripts;
pub mod sleeper;
pub mod store;
pub mod window;

// Re-exports
pub use backoff::Backoff;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RateLimitConfig, RateLimitConfigBuilder, RetryConfig, TokenLimits};
pub use connection::RedisConnectionManager;
pub use error::RateLimitError;
pub use jitter::Jitter;
pub use limiter::RateLimiter;
pub use models::{AcquireResult, Dimension, RateLimitStatus, RecordId};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{
    AdmitOutcome, AdmitRequest, CoordinationStore, DimensionCharge, MemoryStore, RedisStore,
    ReservationSpec, Ticket,
};
pub use window::WINDOW_SECS;
