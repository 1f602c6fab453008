use std::sync::Arc;

use crate::CosResult;
use crate::auth::{
    AuthRetryStrategy, CredentialsProvider, FixedSignerProvider, SignerProvider,
    StaticCredentialsProvider,
};
use crate::capacity::CapacityManager;
use crate::clock::{Clock, SystemClock};
use crate::clock_skew::{ClockSkewAdjuster, ClockSkewState};
use crate::config::ClientConfiguration;
use crate::handler::ErrorResponseHandler;
use crate::metrics::ClientMetrics;
use crate::policy::RequestHandler;
use crate::rate_limit::TokenBucket;
use crate::timer::{ClientExecutionTimer, RequestTimer, TimeoutScheduler};
use crate::transport::HttpTransport;

use super::{ClientInner, HttpClient};

const TIMER_THREAD_NAME: &str = "cosreq-timeouts";

/// Assembles an [`HttpClient`]. Only the configuration is required; the
/// transport defaults to [`crate::UreqTransport`] when that feature is on.
pub struct HttpClientBuilder {
    config: ClientConfiguration,
    transport: Option<Arc<dyn HttpTransport>>,
    clock: Arc<dyn Clock>,
    clock_skew_state: Option<ClockSkewState>,
    retry_capacity: Option<Arc<CapacityManager>>,
    token_bucket: Option<Arc<TokenBucket>>,
    credentials_provider: Arc<dyn CredentialsProvider>,
    signer_provider: Arc<dyn SignerProvider>,
    auth_retry_strategy: Option<Arc<dyn AuthRetryStrategy>>,
    error_response_handler: Option<Arc<dyn ErrorResponseHandler>>,
    request_handlers: Vec<Arc<dyn RequestHandler>>,
}

impl std::fmt::Debug for HttpClientBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpClientBuilder")
            .field("config", &self.config)
            .field("has_transport", &self.transport.is_some())
            .field("request_handlers", &self.request_handlers.len())
            .finish_non_exhaustive()
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClientBuilder {
    pub(crate) fn new() -> Self {
        Self {
            config: ClientConfiguration::default(),
            transport: None,
            clock: Arc::new(SystemClock),
            clock_skew_state: None,
            retry_capacity: None,
            token_bucket: None,
            credentials_provider: Arc::new(StaticCredentialsProvider::anonymous()),
            signer_provider: Arc::new(FixedSignerProvider::default()),
            auth_retry_strategy: None,
            error_response_handler: None,
            request_handlers: Vec::new(),
        }
    }

    pub fn config(mut self, config: ClientConfiguration) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Clock used for skew estimates and the send-rate limiter.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Isolates this client from the process-wide skew estimate.
    pub fn clock_skew_state(mut self, state: ClockSkewState) -> Self {
        self.clock_skew_state = Some(state);
        self
    }

    /// Shares a retry pool between clients. Overrides the pool sized from
    /// the configuration.
    pub fn retry_capacity(mut self, capacity: Arc<CapacityManager>) -> Self {
        self.retry_capacity = Some(capacity);
        self
    }

    pub fn token_bucket(mut self, token_bucket: Arc<TokenBucket>) -> Self {
        self.token_bucket = Some(token_bucket);
        self
    }

    pub fn credentials_provider(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.credentials_provider = provider;
        self
    }

    pub fn signer_provider(mut self, provider: Arc<dyn SignerProvider>) -> Self {
        self.signer_provider = provider;
        self
    }

    pub fn auth_retry_strategy(mut self, strategy: Arc<dyn AuthRetryStrategy>) -> Self {
        self.auth_retry_strategy = Some(strategy);
        self
    }

    pub fn error_response_handler(mut self, handler: Arc<dyn ErrorResponseHandler>) -> Self {
        self.error_response_handler = Some(handler);
        self
    }

    pub fn request_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.request_handlers.push(handler);
        self
    }

    pub fn build(self) -> CosResult<HttpClient> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(&self.config)?,
        };
        let capacity = self
            .retry_capacity
            .unwrap_or_else(|| Arc::new(self.config.retry_capacity()));
        let token_bucket = self
            .token_bucket
            .unwrap_or_else(|| Arc::new(TokenBucket::with_clock(Arc::clone(&self.clock))));
        let clock_skew = ClockSkewAdjuster::with_clock(
            self.clock_skew_state.unwrap_or_else(ClockSkewState::global),
            self.config.clock_skew_threshold(),
            Arc::clone(&self.clock),
        );
        let scheduler = Arc::new(TimeoutScheduler::new(TIMER_THREAD_NAME));

        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                transport,
                capacity,
                token_bucket,
                clock_skew,
                client_execution_timer: ClientExecutionTimer::new(Arc::clone(&scheduler)),
                request_timer: RequestTimer::new(scheduler),
                metrics: ClientMetrics::default(),
                credentials_provider: self.credentials_provider,
                signer_provider: self.signer_provider,
                auth_retry_strategy: self.auth_retry_strategy,
                error_response_handler: self.error_response_handler,
                request_handlers: self.request_handlers,
            }),
        })
    }
}

#[cfg(feature = "ureq-transport")]
fn default_transport(config: &ClientConfiguration) -> CosResult<Arc<dyn HttpTransport>> {
    Ok(Arc::new(crate::transport::UreqTransport::from_config(config)))
}

#[cfg(not(feature = "ureq-transport"))]
fn default_transport(_config: &ClientConfiguration) -> CosResult<Arc<dyn HttpTransport>> {
    Err(crate::error::Error::MissingTransport)
}
