//! Connection layer: owns the store handle and the retry policy around it.
//!
//! Semantics:
//! - `invoke` executes one Lua script atomically (single round trip; no
//!   partial application visible to other callers).
//! - Transient failures (IO, timeout, dropped/refused connections, and the
//!   server-side `BUSY`/`LOADING`/`TRYAGAIN`/`MASTERDOWN`/`CLUSTERDOWN`
//!   classes) are retried with exponential backoff and jitter up to
//!   `max_retries`; exhaustion surfaces `ConnectionFailure`.
//! - Non-transient errors (protocol, type, auth) surface immediately with
//!   no retry.
//!
//! The manager is `Clone` and safe to share across any number of
//! concurrent callers; the underlying multiplexed connection is
//! established lazily and reused.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{FromRedisValue, Script};

use crate::config::RetryConfig;
use crate::error::RateLimitError;
use crate::sleeper::{Sleeper, TokioSleeper};

/// Outcome of the generic retry loop, before mapping onto the public error
/// taxonomy.
#[derive(Debug)]
pub(crate) enum RetryError<E> {
    /// Every attempt failed with a transient error.
    Exhausted { attempts: u32, last: E },
    /// A non-transient error; surfaced on first occurrence.
    Fatal(E),
}

/// Run `operation` until it succeeds, a non-transient error occurs, or the
/// retry budget is spent. Delays between attempts come from the retry
/// config's backoff and jitter via the injected sleeper.
pub(crate) async fn execute_with_retry<T, E, Fut, Op, P>(
    retry: &RetryConfig,
    sleeper: &dyn Sleeper,
    is_transient: P,
    mut operation: Op,
) -> Result<T, RetryError<E>>
where
    E: fmt::Display,
    Fut: Future<Output = Result<T, E>>,
    Op: FnMut() -> Fut,
    P: Fn(&E) -> bool,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) => {
                if attempt >= retry.max_retries() {
                    return Err(RetryError::Exhausted { attempts: attempt + 1, last: e });
                }
                let delay = retry.delay_for(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient store failure; backing off"
                );
                sleeper.sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(RetryError::Fatal(e)),
        }
    }
}

fn is_transient(error: &redis::RedisError) -> bool {
    use redis::ErrorKind;
    error.is_io_error()
        || error.is_timeout()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
        || matches!(
            error.kind(),
            ErrorKind::TryAgain
                | ErrorKind::BusyLoadingError
                | ErrorKind::MasterDown
                | ErrorKind::ClusterDown
        )
}

/// Shared handle to the Redis coordination store with retry built in.
#[derive(Clone)]
pub struct RedisConnectionManager {
    client: redis::Client,
    retry: RetryConfig,
    sleeper: Arc<dyn Sleeper>,
    conn: Arc<tokio::sync::OnceCell<ConnectionManager>>,
}

impl fmt::Debug for RedisConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConnectionManager")
            .field("retry", &self.retry)
            .field("conn", &"<redis>")
            .finish()
    }
}

impl RedisConnectionManager {
    /// Connect by URL, constructing and owning the client.
    pub fn connect(url: &str, retry: RetryConfig) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(url)?;
        Ok(Self::with_client(client, retry))
    }

    /// Wrap a pre-built client.
    pub fn with_client(client: redis::Client, retry: RetryConfig) -> Self {
        Self {
            client,
            retry,
            sleeper: Arc::new(TokioSleeper),
            conn: Arc::new(tokio::sync::OnceCell::new()),
        }
    }

    /// Replace the sleeper used between retries (tests).
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Execute a script atomically, retrying transient failures per the
    /// retry config.
    pub async fn invoke<T: FromRedisValue>(
        &self,
        script: &Script,
        args: &[String],
    ) -> Result<T, RateLimitError> {
        let result = execute_with_retry(&self.retry, self.sleeper.as_ref(), is_transient, || async move {
            let mut conn = self.connection().await?;
            let mut invocation = script.prepare_invoke();
            for arg in args {
                invocation.arg(arg.as_str());
            }
            invocation.invoke_async(&mut conn).await
        })
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(RetryError::Exhausted { attempts, last }) => {
                tracing::info!(attempts, error = %last, "store retry budget exhausted");
                Err(RateLimitError::ConnectionFailure { attempts, source: last })
            }
            Err(RetryError::Fatal(e)) => Err(RateLimitError::Store(e)),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager, redis::RedisError> {
        let conn = self
            .conn
            .get_or_try_init(|| async { ConnectionManager::new(self.client.clone()).await })
            .await?;
        Ok(conn.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jitter::Jitter;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct StoreDown(bool); // true = transient

    impl fmt::Display for StoreDown {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "store down (transient: {})", self.0)
        }
    }

    fn transient(e: &StoreDown) -> bool {
        e.0
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt_within_budget() {
        let retry = RetryConfig::new(3, Duration::from_millis(100)).with_jitter(Jitter::None);
        let sleeper = TrackingSleeper::new();
        let calls = AtomicUsize::new(0);

        let result = execute_with_retry(&retry, &sleeper, transient, || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(StoreDown(true))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert!(matches!(result, Ok(42)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Exponential schedule between the three attempts.
        assert_eq!(
            sleeper.calls(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn exhaustion_reports_total_attempts() {
        let retry = RetryConfig::new(3, Duration::from_millis(10)).with_jitter(Jitter::None);
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = execute_with_retry(&retry, &InstantSleeper, transient, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreDown(true)) }
        })
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 4); // initial + 3 retries
                assert_eq!(last, StoreDown(true));
            }
            other => panic!("expected exhaustion, got {:?}", other.map(|_| ())),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_transient_errors_short_circuit() {
        let retry = RetryConfig::default();
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = execute_with_retry(&retry, &InstantSleeper, transient, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreDown(false)) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "must not retry protocol errors");
    }

    #[test]
    fn io_errors_classify_as_transient() {
        let err = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_transient(&err));
    }

    #[test]
    fn type_errors_classify_as_fatal() {
        let err = redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "unexpected script reply",
            "boom".to_string(),
        ));
        assert!(!is_transient(&err));
    }
}
