use std::time::Duration;

use tracing::warn;

use crate::capacity::{CapacityManager, DEFAULT_MAX_CONSECUTIVE_RETRIES_BEFORE_THROTTLING};
use crate::clock_skew::DEFAULT_CLOCK_SKEW_THRESHOLD;
use crate::handler::DEFAULT_MAX_ERROR_BODY_BYTES;
use crate::policy::{DEFAULT_MAX_AUTH_RETRIES, RedirectPolicy};
use crate::retry::{RetryMode, RetryPolicy};

pub const RETRY_MODE_ENV: &str = "AWS_RETRY_MODE";
pub const MAX_ATTEMPTS_ENV: &str = "AWS_MAX_ATTEMPTS";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Bytes of a non-seekable body kept for replay; one over 128 KiB so a body
/// of exactly 128 KiB can still be rewound.
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 128 * 1024 + 1;
pub const DEFAULT_USER_AGENT: &str = concat!("cosreq/", env!("CARGO_PKG_VERSION"));

/// Client-wide settings. Every field has a default; `from_env` layers the
/// standard environment variables on top.
#[derive(Clone, Debug)]
pub struct ClientConfiguration {
    retry_mode: RetryMode,
    retry_policy: RetryPolicy,
    max_error_retry: Option<usize>,
    use_throttle_retries: bool,
    max_consecutive_retries_before_throttling: usize,
    request_timeout: Option<Duration>,
    client_execution_timeout: Option<Duration>,
    connect_timeout: Duration,
    fast_fail_rate_limiting: bool,
    redirect_policy: RedirectPolicy,
    max_auth_retries: usize,
    stream_buffer_size: usize,
    max_error_body_bytes: usize,
    user_agent: String,
    clock_skew_threshold: Duration,
}

impl Default for ClientConfiguration {
    fn default() -> Self {
        Self {
            retry_mode: RetryMode::default(),
            retry_policy: RetryPolicy::standard(),
            max_error_retry: None,
            use_throttle_retries: true,
            max_consecutive_retries_before_throttling:
                DEFAULT_MAX_CONSECUTIVE_RETRIES_BEFORE_THROTTLING,
            request_timeout: None,
            client_execution_timeout: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            fast_fail_rate_limiting: false,
            redirect_policy: RedirectPolicy::default(),
            max_auth_retries: DEFAULT_MAX_AUTH_RETRIES,
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            max_error_body_bytes: DEFAULT_MAX_ERROR_BODY_BYTES,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            clock_skew_threshold: DEFAULT_CLOCK_SKEW_THRESHOLD,
        }
    }
}

impl ClientConfiguration {
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|name| std::env::var(name).ok())
    }

    pub(crate) fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup(RETRY_MODE_ENV) {
            match value.parse::<RetryMode>() {
                Ok(retry_mode) => self.retry_mode = retry_mode,
                Err(error) => warn!(variable = RETRY_MODE_ENV, error = %error, "ignoring invalid retry mode"),
            }
        }
        if let Some(value) = lookup(MAX_ATTEMPTS_ENV) {
            match value.trim().parse::<usize>() {
                Ok(max_attempts) if max_attempts >= 1 => {
                    self.max_error_retry = Some(max_attempts - 1);
                }
                _ => warn!(
                    variable = MAX_ATTEMPTS_ENV,
                    value = %value,
                    "ignoring invalid max attempts"
                ),
            }
        }
        self
    }

    pub fn with_retry_mode(mut self, retry_mode: RetryMode) -> Self {
        self.retry_mode = retry_mode;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Overrides the retry count of any policy that honors the client's.
    pub fn with_max_error_retry(mut self, max_error_retry: usize) -> Self {
        self.max_error_retry = Some(max_error_retry);
        self
    }

    pub fn with_throttle_retries(mut self, use_throttle_retries: bool) -> Self {
        self.use_throttle_retries = use_throttle_retries;
        self
    }

    pub fn with_max_consecutive_retries_before_throttling(mut self, retries: usize) -> Self {
        self.max_consecutive_retries_before_throttling = retries;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = Some(request_timeout);
        self
    }

    pub fn with_client_execution_timeout(mut self, client_execution_timeout: Duration) -> Self {
        self.client_execution_timeout = Some(client_execution_timeout);
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_fast_fail_rate_limiting(mut self, fast_fail: bool) -> Self {
        self.fast_fail_rate_limiting = fast_fail;
        self
    }

    pub fn with_redirect_policy(mut self, redirect_policy: RedirectPolicy) -> Self {
        self.redirect_policy = redirect_policy;
        self
    }

    pub fn with_max_auth_retries(mut self, max_auth_retries: usize) -> Self {
        self.max_auth_retries = max_auth_retries;
        self
    }

    pub fn with_stream_buffer_size(mut self, stream_buffer_size: usize) -> Self {
        self.stream_buffer_size = stream_buffer_size;
        self
    }

    pub fn with_max_error_body_bytes(mut self, max_error_body_bytes: usize) -> Self {
        self.max_error_body_bytes = max_error_body_bytes;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_clock_skew_threshold(mut self, clock_skew_threshold: Duration) -> Self {
        self.clock_skew_threshold = clock_skew_threshold;
        self
    }

    pub fn retry_mode(&self) -> RetryMode {
        self.retry_mode
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn max_error_retry(&self) -> Option<usize> {
        self.max_error_retry
    }

    pub fn use_throttle_retries(&self) -> bool {
        self.use_throttle_retries
    }

    pub fn max_consecutive_retries_before_throttling(&self) -> usize {
        self.max_consecutive_retries_before_throttling
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn client_execution_timeout(&self) -> Option<Duration> {
        self.client_execution_timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn fast_fail_rate_limiting(&self) -> bool {
        self.fast_fail_rate_limiting
    }

    pub fn redirect_policy(&self) -> RedirectPolicy {
        self.redirect_policy
    }

    pub fn max_auth_retries(&self) -> usize {
        self.max_auth_retries
    }

    pub fn stream_buffer_size(&self) -> usize {
        self.stream_buffer_size
    }

    pub fn max_error_body_bytes(&self) -> usize {
        self.max_error_body_bytes
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn clock_skew_threshold(&self) -> Duration {
        self.clock_skew_threshold
    }

    /// Shared retry pool sized from this configuration; unbounded when
    /// throttled retries are turned off.
    pub fn retry_capacity(&self) -> CapacityManager {
        if self.use_throttle_retries {
            CapacityManager::for_consecutive_retries(self.max_consecutive_retries_before_throttling)
        } else {
            CapacityManager::unbounded()
        }
    }
}

/// Per-call overrides of the client configuration.
#[derive(Clone, Debug, Default)]
pub struct RequestConfig {
    pub request_timeout: Option<Duration>,
    pub client_execution_timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
}

impl RequestConfig {
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = Some(request_timeout);
        self
    }

    pub fn with_client_execution_timeout(mut self, client_execution_timeout: Duration) -> Self {
        self.client_execution_timeout = Some(client_execution_timeout);
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }
}
