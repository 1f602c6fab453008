//! `cosreq` is the request-execution core of an object storage SDK: it sends
//! marshalled requests and owns everything between "here is a signed-ready
//! request" and "here is a typed result or a classified error".
//!
//! That covers retries with a shared retry-capacity pool, an adaptive
//! client-side send-rate limiter, clock-skew correction of signing times,
//! `307` redirects, client-side request and call timeouts, and replay of
//! streaming bodies across attempts. Marshalling, signing and credentials are
//! plugged in through traits.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use cosreq::prelude::{
//!     BytesResponseHandler, ClientConfiguration, ExecutionContext, HttpClient, Request,
//!     RetryMode,
//! };
//! use http::{Method, Uri};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HttpClient::builder()
//!         .config(
//!             ClientConfiguration::from_env()
//!                 .with_retry_mode(RetryMode::Standard)
//!                 .with_request_timeout(Duration::from_secs(5))
//!                 .with_client_execution_timeout(Duration::from_secs(30)),
//!         )
//!         .build()?;
//!
//!     let request = Request::new(Method::GET, Uri::from_static("https://s3.example.com"))
//!         .with_service_name("Amazon S3")
//!         .with_operation_name("GetObject")
//!         .with_resource_path("/bucket/key.txt");
//!     let response = client.execute(
//!         request,
//!         ExecutionContext::new(BytesResponseHandler::new(1024 * 1024)),
//!     )?;
//!
//!     println!("read {} bytes", response.result().len());
//!     Ok(())
//! }
//! ```
//!
//! # Retry Modes
//!
//! - `legacy` (default): up to 3 retries; throttling errors do not draw on
//!   retry capacity.
//! - `standard`: up to 2 retries; every retry draws on capacity, timeouts
//!   twice as much.
//! - `adaptive`: `standard` plus a CUBIC send-rate limiter that engages
//!   after the first throttling response.

mod auth;
mod cancel;
mod capacity;
mod client;
mod clock;
mod clock_skew;
mod config;
mod error;
mod handler;
mod metrics;
mod policy;
mod progress;
mod rate_limit;
mod request;
mod response;
mod retry;
mod timer;
mod transport;
mod util;

pub use crate::auth::{
    AuthRetryParameters, AuthRetryStrategy, Credentials, CredentialsProvider,
    FixedSignerProvider, NoOpSigner, Signer, SignerProvider, StaticCredentialsProvider,
};
pub use crate::cancel::CancellationToken;
pub use crate::capacity::{
    CapacityManager, DEFAULT_MAX_CONSECUTIVE_RETRIES_BEFORE_THROTTLING, THROTTLED_RETRY_COST,
    TIMEOUT_RETRY_COST,
};
pub use crate::client::{
    ExecutionContext, HttpClient, HttpClientBuilder, INVOCATION_ID_HEADER, RETRY_INFO_HEADER,
};
pub use crate::clock::{Clock, SystemClock};
pub use crate::clock_skew::{ClockSkewAdjuster, ClockSkewState, DEFAULT_CLOCK_SKEW_THRESHOLD};
pub use crate::config::{
    ClientConfiguration, DEFAULT_CONNECT_TIMEOUT, DEFAULT_STREAM_BUFFER_SIZE, DEFAULT_USER_AGENT,
    MAX_ATTEMPTS_ENV, RETRY_MODE_ENV, RequestConfig,
};
pub use crate::error::{
    BoxError, Error, ErrorCode, ErrorType, HookPhase, ServiceError, TransportErrorKind,
};
pub use crate::handler::{
    BytesResponseHandler, DEFAULT_MAX_ERROR_BODY_BYTES, DEFAULT_MAX_RESPONSE_BODY_BYTES,
    ERROR_CODE_HEADER, ERROR_TYPE_HEADER, EXTENDED_REQUEST_ID_HEADER, ErrorResponseHandler,
    JsonResponseHandler, REQUEST_ID_HEADER, ResponseHandler, ServiceErrorResponseHandler,
};
pub use crate::metrics::ClientMetricsSnapshot;
pub use crate::policy::{
    AttemptContext, DEFAULT_MAX_AUTH_RETRIES, DEFAULT_MAX_REDIRECTS, RedirectPolicy,
    RequestHandler,
};
pub use crate::progress::{ProgressEvent, ProgressListener};
pub use crate::rate_limit::{SEND_TOKEN_COST, TokenBucket, TokenBucketSnapshot};
pub use crate::request::{
    BufferedReplay, OneShot, ReplayableRead, Request, RequestBody, SeekableReplay,
};
pub use crate::response::{HttpResponse, Response, ResponseHead};
pub use crate::retry::{
    BackoffStrategy, DEFAULT_BASE_DELAY, DEFAULT_MAX_BACKOFF, DEFAULT_THROTTLED_BASE_DELAY,
    DefaultRetryCondition, ExponentialBackoff, ParseRetryModeError, RetryCondition, RetryMode,
    RetryPolicy, RetryPolicyContext, is_clock_skew_error, is_retryable_error,
    is_throttling_error,
};
#[cfg(feature = "ureq-transport")]
pub use crate::transport::UreqTransport;
pub use crate::transport::{HttpTransport, TransportBody, TransportError, TransportRequest};

pub type CosResult<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        BytesResponseHandler, CancellationToken, ClientConfiguration, CosResult, Error,
        ErrorCode, ExecutionContext, HttpClient, HttpResponse, JsonResponseHandler,
        RedirectPolicy, Request, RequestBody, RequestConfig, Response, RetryMode, RetryPolicy,
        ServiceError, TransportErrorKind,
    };
}
