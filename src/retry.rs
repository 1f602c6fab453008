use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::capacity::{THROTTLED_RETRY_COST, TIMEOUT_RETRY_COST};
use crate::clock_skew::is_clock_skew_error_code;
use crate::error::Error;
use crate::request::Request;

const THROTTLING_ERROR_CODES: [&str; 13] = [
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "ProvisionedThroughputExceededException",
    "SlowDown",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "BandwidthLimitExceeded",
    "RequestThrottled",
    "RequestThrottledException",
    "EC2ThrottledException",
    "PriorRequestNotComplete",
    "TransactionInProgressException",
];

const RETRYABLE_STATUS_CODES: [u16; 4] = [500, 502, 503, 504];
const RETRYABLE_ERROR_CODES: [&str; 2] = ["RequestTimeout", "RequestTimeoutException"];

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_THROTTLED_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(20);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RetryMode {
    #[default]
    Legacy,
    Standard,
    Adaptive,
}

impl RetryMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Standard => "standard",
            Self::Adaptive => "adaptive",
        }
    }

    pub const fn default_max_error_retry(self) -> usize {
        match self {
            Self::Legacy => 3,
            Self::Standard | Self::Adaptive => 2,
        }
    }

    /// Capacity a retry of `error` costs in this mode.
    pub fn retry_cost(self, error: &Error) -> i64 {
        match self {
            Self::Legacy if is_throttling_error(error) => 0,
            Self::Legacy => THROTTLED_RETRY_COST,
            Self::Standard | Self::Adaptive if error.is_timeout() => TIMEOUT_RETRY_COST,
            Self::Standard | Self::Adaptive => THROTTLED_RETRY_COST,
        }
    }
}

impl std::fmt::Display for RetryMode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseRetryModeError {
    value: String,
}

impl std::fmt::Display for ParseRetryModeError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "unsupported retry mode `{}`; expected legacy, standard or adaptive",
            self.value
        )
    }
}

impl std::error::Error for ParseRetryModeError {}

impl FromStr for RetryMode {
    type Err = ParseRetryModeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "standard" => Ok(Self::Standard),
            "adaptive" => Ok(Self::Adaptive),
            _ => Err(ParseRetryModeError {
                value: value.to_owned(),
            }),
        }
    }
}

/// What a retry condition or backoff strategy gets to look at.
#[derive(Debug)]
pub struct RetryPolicyContext<'a> {
    pub request: &'a Request,
    pub error: &'a Error,
    /// Retries already performed; `0` when deciding on the first retry.
    pub retries_attempted: usize,
}

impl RetryPolicyContext<'_> {
    pub fn status_code(&self) -> Option<u16> {
        self.error.status_code()
    }
}

pub trait RetryCondition: Send + Sync {
    fn should_retry(&self, context: &RetryPolicyContext<'_>) -> bool;
}

impl<F> RetryCondition for F
where
    F: Fn(&RetryPolicyContext<'_>) -> bool + Send + Sync,
{
    fn should_retry(&self, context: &RetryPolicyContext<'_>) -> bool {
        self(context)
    }
}

pub trait BackoffStrategy: Send + Sync {
    fn delay_before_next_retry(&self, context: &RetryPolicyContext<'_>) -> Duration;
}

impl<F> BackoffStrategy for F
where
    F: Fn(&RetryPolicyContext<'_>) -> Duration + Send + Sync,
{
    fn delay_before_next_retry(&self, context: &RetryPolicyContext<'_>) -> Duration {
        self(context)
    }
}

/// Retries transport failures, request timeouts, 5xx gateway statuses,
/// throttling and clock-skew errors.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRetryCondition;

impl RetryCondition for DefaultRetryCondition {
    fn should_retry(&self, context: &RetryPolicyContext<'_>) -> bool {
        is_retryable_error(context.error)
    }
}

/// Capped exponential backoff with a separate base for throttling errors.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    throttled_base_delay: Duration,
    max_backoff: Duration,
    jitter_ratio: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            throttled_base_delay: DEFAULT_THROTTLED_BASE_DELAY,
            max_backoff: DEFAULT_MAX_BACKOFF,
            jitter_ratio: 0.2,
        }
    }
}

impl ExponentialBackoff {
    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn throttled_base_delay(mut self, throttled_base_delay: Duration) -> Self {
        self.throttled_base_delay = throttled_base_delay;
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub(crate) fn backoff_for_retry(&self, retries_attempted: usize, throttled: bool) -> Duration {
        let base = if throttled {
            self.throttled_base_delay
        } else {
            self.base_delay
        };
        let capped_exponent = retries_attempted.min(30) as u32;
        let multiplier = 1_u128 << capped_exponent;
        let max_ms = self.max_backoff.as_millis();
        let delay_ms = base
            .as_millis()
            .saturating_mul(multiplier)
            .min(max_ms)
            .min(u64::MAX as u128) as u64;
        self.apply_jitter(Duration::from_millis(delay_ms))
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return backoff;
        }

        let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
        if backoff_ms <= 1 {
            return backoff;
        }
        let max_backoff_ms = self.max_backoff.as_millis().min(u64::MAX as u128) as u64;

        let jitter_span = ((backoff_ms as f64) * self.jitter_ratio).round().max(1.0) as u64;
        let low = backoff_ms.saturating_sub(jitter_span);
        let high = backoff_ms.saturating_add(jitter_span).max(low);
        let mut rng = rand::rng();
        let sampled_ms = rng.random_range(low..=high).min(max_backoff_ms.max(1));
        Duration::from_millis(sampled_ms)
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay_before_next_retry(&self, context: &RetryPolicyContext<'_>) -> Duration {
        self.backoff_for_retry(context.retries_attempted, is_throttling_error(context.error))
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    retry_condition: Arc<dyn RetryCondition>,
    backoff_strategy: Arc<dyn BackoffStrategy>,
    max_error_retry: Option<usize>,
    honor_max_error_retry_in_client_config: bool,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_error_retry", &self.max_error_retry)
            .field(
                "honor_max_error_retry_in_client_config",
                &self.honor_max_error_retry_in_client_config,
            )
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryPolicy {
    /// Default condition and backoff; the retry count follows the client's
    /// retry mode unless overridden.
    pub fn standard() -> Self {
        Self {
            retry_condition: Arc::new(DefaultRetryCondition),
            backoff_strategy: Arc::new(ExponentialBackoff::default()),
            max_error_retry: None,
            honor_max_error_retry_in_client_config: true,
        }
    }

    pub fn disabled() -> Self {
        Self::standard()
            .max_error_retry(0)
            .honor_max_error_retry_in_client_config(false)
    }

    pub fn max_error_retry(mut self, max_error_retry: usize) -> Self {
        self.max_error_retry = Some(max_error_retry);
        self
    }

    pub fn retry_condition(mut self, retry_condition: Arc<dyn RetryCondition>) -> Self {
        self.retry_condition = retry_condition;
        self
    }

    pub fn backoff_strategy(mut self, backoff_strategy: Arc<dyn BackoffStrategy>) -> Self {
        self.backoff_strategy = backoff_strategy;
        self
    }

    /// When set, a client-level max error retry overrides this policy's own.
    pub fn honor_max_error_retry_in_client_config(mut self, honor: bool) -> Self {
        self.honor_max_error_retry_in_client_config = honor;
        self
    }

    pub(crate) fn effective_max_error_retry(
        &self,
        mode: RetryMode,
        client_max_error_retry: Option<usize>,
    ) -> usize {
        if self.honor_max_error_retry_in_client_config
            && let Some(client_max_error_retry) = client_max_error_retry
        {
            return client_max_error_retry;
        }
        self.max_error_retry
            .unwrap_or_else(|| mode.default_max_error_retry())
    }

    pub(crate) fn should_retry(
        &self,
        context: &RetryPolicyContext<'_>,
        max_error_retry: usize,
    ) -> bool {
        context.retries_attempted < max_error_retry && self.retry_condition.should_retry(context)
    }

    pub(crate) fn delay_before_next_retry(&self, context: &RetryPolicyContext<'_>) -> Duration {
        self.backoff_strategy.delay_before_next_retry(context)
    }
}

pub fn is_throttling_error(error: &Error) -> bool {
    let Some(service_error) = error.service_error() else {
        return false;
    };
    service_error.status_code == 429
        || service_error
            .error_code()
            .is_some_and(|code| THROTTLING_ERROR_CODES.contains(&code))
}

pub fn is_clock_skew_error(error: &Error) -> bool {
    error
        .service_error()
        .and_then(|service_error| service_error.error_code())
        .is_some_and(is_clock_skew_error_code)
}

pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::Transport { .. } | Error::RequestTimeout { .. } => true,
        Error::Service(service_error) => {
            RETRYABLE_STATUS_CODES.contains(&service_error.status_code)
                || service_error
                    .error_code()
                    .is_some_and(|code| RETRYABLE_ERROR_CODES.contains(&code))
                || is_throttling_error(error)
                || is_clock_skew_error(error)
        }
        _ => false,
    }
}
