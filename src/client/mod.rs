use std::sync::Arc;

use crate::CosResult;
use crate::auth::{AuthRetryStrategy, CredentialsProvider, SignerProvider};
use crate::cancel::CancellationToken;
use crate::capacity::CapacityManager;
use crate::clock_skew::ClockSkewAdjuster;
use crate::config::{ClientConfiguration, RequestConfig};
use crate::handler::{ErrorResponseHandler, ResponseHandler};
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::policy::RequestHandler;
use crate::rate_limit::{TokenBucket, TokenBucketSnapshot};
use crate::request::Request;
use crate::response::Response;
use crate::timer::{ClientExecutionTimer, RequestTimer};
use crate::transport::HttpTransport;

mod attempt;
mod builder;
mod execute;

pub use builder::HttpClientBuilder;
pub use execute::{INVOCATION_ID_HEADER, RETRY_INFO_HEADER};

/// Executes marshalled requests with retries, redirects, clock-skew
/// correction and client-side timeouts.
///
/// Cloning is cheap; clones share the retry capacity pool, the send-rate
/// limiter, the skew state and the metrics.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    config: ClientConfiguration,
    transport: Arc<dyn HttpTransport>,
    capacity: Arc<CapacityManager>,
    token_bucket: Arc<TokenBucket>,
    clock_skew: ClockSkewAdjuster,
    client_execution_timer: ClientExecutionTimer,
    request_timer: RequestTimer,
    metrics: ClientMetrics,
    credentials_provider: Arc<dyn CredentialsProvider>,
    signer_provider: Arc<dyn SignerProvider>,
    auth_retry_strategy: Option<Arc<dyn AuthRetryStrategy>>,
    error_response_handler: Option<Arc<dyn ErrorResponseHandler>>,
    request_handlers: Vec<Arc<dyn RequestHandler>>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpClient")
            .field("config", &self.inner.config)
            .field("capacity", &self.inner.capacity)
            .field("token_bucket", &self.inner.token_bucket)
            .field("clock_skew", &self.inner.clock_skew)
            .field("request_handlers", &self.inner.request_handlers.len())
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    /// Runs one logical call to completion.
    pub fn execute<T>(&self, request: Request, context: ExecutionContext<T>) -> CosResult<Response<T>> {
        execute::execute(&self.inner, request, &context)
    }

    pub fn configuration(&self) -> &ClientConfiguration {
        &self.inner.config
    }

    pub fn retry_capacity(&self) -> &CapacityManager {
        &self.inner.capacity
    }

    pub fn token_bucket_snapshot(&self) -> TokenBucketSnapshot {
        self.inner.token_bucket.snapshot()
    }

    pub fn clock_skew(&self) -> &ClockSkewAdjuster {
        &self.inner.clock_skew
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

/// Per-call collaborators. Anything left unset falls back to what the
/// client was built with.
pub struct ExecutionContext<T> {
    response_handler: Arc<dyn ResponseHandler<T>>,
    error_response_handler: Option<Arc<dyn ErrorResponseHandler>>,
    request_handlers: Vec<Arc<dyn RequestHandler>>,
    signer_provider: Option<Arc<dyn SignerProvider>>,
    credentials_provider: Option<Arc<dyn CredentialsProvider>>,
    auth_retry_strategy: Option<Arc<dyn AuthRetryStrategy>>,
    request_config: RequestConfig,
    cancellation: Option<CancellationToken>,
}

impl<T> std::fmt::Debug for ExecutionContext<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ExecutionContext")
            .field("request_handlers", &self.request_handlers.len())
            .field("request_config", &self.request_config)
            .field("cancellation", &self.cancellation)
            .finish_non_exhaustive()
    }
}

impl<T> ExecutionContext<T> {
    pub fn new(response_handler: impl ResponseHandler<T> + 'static) -> Self {
        Self::with_response_handler(Arc::new(response_handler))
    }

    pub fn with_response_handler(response_handler: Arc<dyn ResponseHandler<T>>) -> Self {
        Self {
            response_handler,
            error_response_handler: None,
            request_handlers: Vec::new(),
            signer_provider: None,
            credentials_provider: None,
            auth_retry_strategy: None,
            request_config: RequestConfig::default(),
            cancellation: None,
        }
    }

    pub fn error_response_handler(mut self, handler: Arc<dyn ErrorResponseHandler>) -> Self {
        self.error_response_handler = Some(handler);
        self
    }

    /// Runs after the client's own handlers.
    pub fn request_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.request_handlers.push(handler);
        self
    }

    pub fn signer_provider(mut self, provider: Arc<dyn SignerProvider>) -> Self {
        self.signer_provider = Some(provider);
        self
    }

    pub fn credentials_provider(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.credentials_provider = Some(provider);
        self
    }

    pub fn auth_retry_strategy(mut self, strategy: Arc<dyn AuthRetryStrategy>) -> Self {
        self.auth_retry_strategy = Some(strategy);
        self
    }

    pub fn request_config(mut self, request_config: RequestConfig) -> Self {
        self.request_config = request_config;
        self
    }

    /// Cancelling `token` aborts the call with [`crate::Error::Aborted`].
    ///
    /// Backoff sleeps and send-token waits stop at once. An exchange already
    /// on the wire stops only as soon as the transport notices: `UreqTransport`
    /// checks the token while streaming the request body, so a request with no
    /// body that is waiting on a stalled server keeps waiting until a request
    /// or client execution timeout ends it.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}
