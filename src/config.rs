//! Limit and retry configuration.
//!
//! `RateLimitConfig` is built through a validating builder: contradictory
//! or incomplete limits fail at construction with
//! [`RateLimitError::InvalidConfiguration`], never during acquisition.
//! `RetryConfig` shapes the connection layer's exponential backoff.

use std::time::Duration;

use crate::backoff::Backoff;
use crate::error::RateLimitError;
use crate::jitter::Jitter;
use crate::models::Dimension;

/// Default interval between FIFO admission polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default namespace prefix for all store keys.
pub const DEFAULT_KEY_PREFIX: &str = "llmlimit:";

const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Token budget mode: one unified TPM ceiling, or independent input and
/// output ceilings. Exactly one mode is active per limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TokenLimits {
    Unified { tpm: u64 },
    Split { input_tpm: u64, output_tpm: u64 },
}

impl TokenLimits {
    /// Whether acquisitions in this mode produce adjustable reservations.
    pub fn is_split(&self) -> bool {
        matches!(self, TokenLimits::Split { .. })
    }
}

/// Per-resource ceilings plus admission knobs. Build via
/// [`RateLimitConfig::builder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    rpm: u64,
    limits: TokenLimits,
    max_wait: Option<Duration>,
    poll_interval: Duration,
    key_prefix: String,
}

impl RateLimitConfig {
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::default()
    }

    /// Requests-per-minute ceiling.
    pub fn rpm(&self) -> u64 {
        self.rpm
    }

    /// Active token budget mode.
    pub fn limits(&self) -> TokenLimits {
        self.limits
    }

    /// Maximum time an acquisition may wait for admission; `None` waits
    /// indefinitely.
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait
    }

    /// Interval between admission polls while blocked.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Store key namespace prefix.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Every configured dimension with its ceiling, RPM first.
    pub(crate) fn ceilings(&self) -> Vec<(Dimension, u64)> {
        match self.limits {
            TokenLimits::Unified { tpm } => {
                vec![(Dimension::Requests, self.rpm), (Dimension::Tokens, tpm)]
            }
            TokenLimits::Split { input_tpm, output_tpm } => vec![
                (Dimension::Requests, self.rpm),
                (Dimension::InputTokens, input_tpm),
                (Dimension::OutputTokens, output_tpm),
            ],
        }
    }
}

/// Builder for [`RateLimitConfig`].
#[derive(Debug, Clone, Default)]
pub struct RateLimitConfigBuilder {
    rpm: Option<u64>,
    tpm: Option<u64>,
    input_tpm: Option<u64>,
    output_tpm: Option<u64>,
    max_wait: Option<Duration>,
    poll_interval: Option<Duration>,
    key_prefix: Option<String>,
}

impl RateLimitConfigBuilder {
    /// Requests-per-minute ceiling. Required.
    pub fn rpm(mut self, rpm: u64) -> Self {
        self.rpm = Some(rpm);
        self
    }

    /// Unified tokens-per-minute ceiling. Mutually exclusive with the
    /// split ceilings.
    pub fn tpm(mut self, tpm: u64) -> Self {
        self.tpm = Some(tpm);
        self
    }

    /// Input tokens-per-minute ceiling (split mode).
    pub fn input_tpm(mut self, input_tpm: u64) -> Self {
        self.input_tpm = Some(input_tpm);
        self
    }

    /// Output tokens-per-minute ceiling (split mode).
    pub fn output_tpm(mut self, output_tpm: u64) -> Self {
        self.output_tpm = Some(output_tpm);
        self
    }

    /// Bound how long an acquisition may wait for admission.
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Interval between admission polls. Must stay under one second so
    /// freed capacity is picked up quickly relative to bucket granularity.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }

    /// Namespace prefix for store keys. ASCII alphanumeric, `_`, `-`, and
    /// `:` only.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn build(self) -> Result<RateLimitConfig, RateLimitError> {
        let rpm = self
            .rpm
            .ok_or_else(|| RateLimitError::invalid_config("rpm is required"))?;
        if rpm == 0 {
            return Err(RateLimitError::invalid_config("rpm must be positive"));
        }

        let limits = match (self.tpm, self.input_tpm, self.output_tpm) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                return Err(RateLimitError::invalid_config(
                    "tpm cannot be combined with input_tpm/output_tpm",
                ))
            }
            (Some(tpm), None, None) => {
                if tpm == 0 {
                    return Err(RateLimitError::invalid_config("tpm must be positive"));
                }
                TokenLimits::Unified { tpm }
            }
            (None, Some(input_tpm), Some(output_tpm)) => {
                if input_tpm == 0 || output_tpm == 0 {
                    return Err(RateLimitError::invalid_config(
                        "input_tpm and output_tpm must be positive",
                    ));
                }
                TokenLimits::Split { input_tpm, output_tpm }
            }
            (None, Some(_), None) | (None, None, Some(_)) => {
                return Err(RateLimitError::invalid_config(
                    "split mode requires both input_tpm and output_tpm",
                ))
            }
            (None, None, None) => {
                return Err(RateLimitError::invalid_config(
                    "either tpm or input_tpm/output_tpm is required",
                ))
            }
        };

        if let Some(max_wait) = self.max_wait {
            if max_wait.is_zero() {
                return Err(RateLimitError::invalid_config("max_wait must be positive"));
            }
        }

        let poll_interval = self.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL);
        if poll_interval.is_zero() || poll_interval >= Duration::from_secs(1) {
            return Err(RateLimitError::invalid_config(
                "poll_interval must be positive and under one second",
            ));
        }

        let key_prefix = self.key_prefix.unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());
        if key_prefix.is_empty()
            || !key_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ':')
        {
            return Err(RateLimitError::invalid_config(
                "key_prefix must be non-empty ASCII alphanumeric, '_', '-', or ':'",
            ));
        }

        Ok(RateLimitConfig { rpm, limits, max_wait: self.max_wait, poll_interval, key_prefix })
    }
}

/// Retry policy for transient coordination-store failures: exponential
/// backoff `base_delay * 2^attempt`, capped, with optional jitter.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    max_retries: u32,
    backoff: Backoff,
    jitter: Jitter,
}

impl RetryConfig {
    /// `max_retries` retries after the initial attempt, doubling from
    /// `base_delay` and capped at 5 seconds unless overridden.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        let cap = DEFAULT_MAX_RETRY_DELAY.max(base_delay);
        // with_max only fails for a zero cap or cap < base; neither can
        // happen here.
        let backoff = Backoff::exponential(base_delay)
            .with_max(cap)
            .unwrap_or_else(|_| Backoff::exponential(base_delay));
        Self { max_retries, backoff, jitter: Jitter::Full }
    }

    /// Override the delay cap. A cap below `base_delay` is raised to it.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        if let Ok(backoff) = self.backoff.clone().with_max(max_delay) {
            self.backoff = backoff;
        }
        self
    }

    /// Override the jitter strategy.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Retries allowed after the initial attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Jittered delay before retry number `retry` (0-based).
    pub(crate) fn delay_for(&self, retry: u32) -> Duration {
        self.jitter.apply(self.backoff.delay(retry as usize + 1))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unified_config_builds() {
        let config = RateLimitConfig::builder().rpm(100).tpm(100_000).build().unwrap();
        assert_eq!(config.rpm(), 100);
        assert_eq!(config.limits(), TokenLimits::Unified { tpm: 100_000 });
        assert!(!config.limits().is_split());
        assert_eq!(config.poll_interval(), DEFAULT_POLL_INTERVAL);
        assert_eq!(config.key_prefix(), DEFAULT_KEY_PREFIX);
    }

    #[test]
    fn split_config_builds() {
        let config = RateLimitConfig::builder()
            .rpm(360)
            .input_tpm(4_000_000)
            .output_tpm(128_000)
            .build()
            .unwrap();
        assert_eq!(
            config.limits(),
            TokenLimits::Split { input_tpm: 4_000_000, output_tpm: 128_000 }
        );
        assert!(config.limits().is_split());
    }

    #[test]
    fn mixing_unified_and_split_is_rejected() {
        let err = RateLimitConfig::builder()
            .rpm(100)
            .tpm(100_000)
            .input_tpm(50_000)
            .build()
            .unwrap_err();
        assert!(err.is_invalid_configuration());
    }

    #[test]
    fn half_split_is_rejected() {
        let err = RateLimitConfig::builder().rpm(100).input_tpm(50_000).build().unwrap_err();
        assert!(err.is_invalid_configuration());
    }

    #[test]
    fn missing_token_limits_are_rejected() {
        let err = RateLimitConfig::builder().rpm(100).build().unwrap_err();
        assert!(err.is_invalid_configuration());
    }

    #[test]
    fn zero_ceilings_are_rejected() {
        assert!(RateLimitConfig::builder().rpm(0).tpm(1000).build().is_err());
        assert!(RateLimitConfig::builder().rpm(10).tpm(0).build().is_err());
        assert!(RateLimitConfig::builder().rpm(10).input_tpm(0).output_tpm(10).build().is_err());
    }

    #[test]
    fn second_or_longer_poll_interval_is_rejected() {
        let err = RateLimitConfig::builder()
            .rpm(10)
            .tpm(1000)
            .poll_interval(Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(err.is_invalid_configuration());
    }

    #[test]
    fn bad_key_prefix_is_rejected() {
        let err = RateLimitConfig::builder()
            .rpm(10)
            .tpm(1000)
            .key_prefix("bad prefix!")
            .build()
            .unwrap_err();
        assert!(err.is_invalid_configuration());
    }

    #[test]
    fn ceilings_list_rpm_first() {
        let config = RateLimitConfig::builder().rpm(5).input_tpm(100).output_tpm(50).build().unwrap();
        assert_eq!(
            config.ceilings(),
            vec![
                (Dimension::Requests, 5),
                (Dimension::InputTokens, 100),
                (Dimension::OutputTokens, 50),
            ]
        );
    }

    #[test]
    fn retry_delays_double_without_jitter() {
        let retry = RetryConfig::new(3, Duration::from_millis(100)).with_jitter(Jitter::None);
        assert_eq!(retry.delay_for(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn retry_delays_respect_cap() {
        let retry = RetryConfig::new(10, Duration::from_millis(100))
            .with_jitter(Jitter::None)
            .with_max_delay(Duration::from_millis(300));
        assert_eq!(retry.delay_for(5), Duration::from_millis(300));
    }
}
