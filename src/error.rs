use http::Method;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Timeout,
    Other,
}

impl TransportErrorKind {
    pub const fn is_timeout(self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ErrorType {
    Client,
    Service,
    #[default]
    Unknown,
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Client => "client",
            Self::Service => "service",
            Self::Unknown => "unknown",
        };
        formatter.write_str(text)
    }
}

/// An error response returned by the remote service.
#[derive(Clone, Debug, Default, Error)]
#[error(
    "{message} (service: {service_name}; status code: {status_code}; error code: {}; request id: {})",
    .error_code.as_deref().unwrap_or("<none>"),
    .request_id.as_deref().unwrap_or("<none>")
)]
pub struct ServiceError {
    pub status_code: u16,
    pub error_code: Option<String>,
    pub error_type: ErrorType,
    pub message: String,
    pub request_id: Option<String>,
    pub extended_request_id: Option<String>,
    pub service_name: String,
    pub raw_body: Option<String>,
}

impl ServiceError {
    pub fn new(status_code: u16, message: impl Into<String>) -> Self {
        let error_type = match status_code {
            400..=499 => ErrorType::Client,
            500..=599 => ErrorType::Service,
            _ => ErrorType::Unknown,
        };
        Self {
            status_code,
            message: message.into(),
            error_type,
            ..Self::default()
        }
    }

    pub fn with_error_code(mut self, error_code: impl Into<String>) -> Self {
        self.error_code = Some(error_code.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_error_type(mut self, error_type: ErrorType) -> Self {
        self.error_type = error_type;
        self
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    RequestBuild,
    MissingTransport,
    Transport,
    RequestTimeout,
    ClientExecutionTimeout,
    Aborted,
    Service,
    ResetStream,
    SendTokenUnavailable,
    RedirectLimitExceeded,
    Credentials,
    Signing,
    ResponseHandler,
    HookFailed,
    ReadBody,
    ResponseBodyTooLarge,
    Deserialize,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::RequestBuild => "request_build",
            Self::MissingTransport => "missing_transport",
            Self::Transport => "transport",
            Self::RequestTimeout => "request_timeout",
            Self::ClientExecutionTimeout => "client_execution_timeout",
            Self::Aborted => "aborted",
            Self::Service => "service",
            Self::ResetStream => "reset_stream",
            Self::SendTokenUnavailable => "send_token_unavailable",
            Self::RedirectLimitExceeded => "redirect_limit_exceeded",
            Self::Credentials => "credentials",
            Self::Signing => "signing",
            Self::ResponseHandler => "response_handler",
            Self::HookFailed => "hook_failed",
            Self::ReadBody => "read_body",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::Deserialize => "deserialize",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookPhase {
    BeforeRequest,
    BeforeAttempt,
    AfterAttempt,
    AfterResponse,
    AfterError,
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::BeforeRequest => "before_request",
            Self::BeforeAttempt => "before_attempt",
            Self::AfterAttempt => "after_attempt",
            Self::AfterResponse => "after_response",
            Self::AfterError => "after_error",
        };
        formatter.write_str(text)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("no http transport configured; enable the `ureq-transport` feature or supply one")]
    MissingTransport,
    #[error("unable to execute http request ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("request did not complete within the request timeout of {timeout_ms}ms for {method} {uri}")]
    RequestTimeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("client execution did not complete before the {timeout_ms}ms timeout for {method} {uri}")]
    ClientExecutionTimeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("request was aborted for {method} {uri}")]
    Aborted { method: Method, uri: String },
    #[error(transparent)]
    Service(Box<ServiceError>),
    #[error("failed to reset the request input stream for retry: {source}; retry cause: {}", .cause.as_deref().map(ToString::to_string).unwrap_or_else(|| "redirect".to_owned()))]
    ResetStream {
        #[source]
        source: std::io::Error,
        cause: Option<Box<Error>>,
    },
    #[error(
        "unable to acquire a send token immediately without waiting for {method} {uri}; adaptive retry mode with fast-fail rate limiting is engaged after prior throttled requests"
    )]
    SendTokenUnavailable { method: Method, uri: String },
    #[error("redirect limit exceeded ({max_redirects}) for {method} {uri}")]
    RedirectLimitExceeded {
        max_redirects: usize,
        method: Method,
        uri: String,
    },
    #[error("failed to load credentials: {source}")]
    Credentials {
        #[source]
        source: BoxError,
    },
    #[error("failed to sign request for {uri}: {source}")]
    Signing {
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("response handler failed for status {status}: {source}")]
    ResponseHandler {
        status: u16,
        #[source]
        source: BoxError,
    },
    #[error("request handler failed in {phase}: {source}")]
    HookFailed {
        phase: HookPhase,
        #[source]
        source: Box<Error>,
        replaced: Option<Box<Error>>,
    },
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: std::io::Error,
    },
    #[error("response body exceeds limit {limit_bytes} bytes (read {actual_bytes})")]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
    },
    #[error("failed to decode response json: {source}; body={body}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::MissingTransport => ErrorCode::MissingTransport,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::RequestTimeout { .. } => ErrorCode::RequestTimeout,
            Self::ClientExecutionTimeout { .. } => ErrorCode::ClientExecutionTimeout,
            Self::Aborted { .. } => ErrorCode::Aborted,
            Self::Service(_) => ErrorCode::Service,
            Self::ResetStream { .. } => ErrorCode::ResetStream,
            Self::SendTokenUnavailable { .. } => ErrorCode::SendTokenUnavailable,
            Self::RedirectLimitExceeded { .. } => ErrorCode::RedirectLimitExceeded,
            Self::Credentials { .. } => ErrorCode::Credentials,
            Self::Signing { .. } => ErrorCode::Signing,
            Self::ResponseHandler { .. } => ErrorCode::ResponseHandler,
            Self::HookFailed { .. } => ErrorCode::HookFailed,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
        }
    }

    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::Service(error) => Some(error),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        self.service_error().map(|error| error.status_code)
    }

    /// Connect and socket timeouts, including the per-attempt request timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::RequestTimeout { .. } => true,
            Self::Transport { kind, .. } => kind.is_timeout(),
            _ => false,
        }
    }

    pub(crate) fn hook(phase: HookPhase, source: Error, replaced: Option<Error>) -> Self {
        Self::HookFailed {
            phase,
            source: Box::new(source),
            replaced: replaced.map(Box::new),
        }
    }
}

impl From<ServiceError> for Error {
    fn from(error: ServiceError) -> Self {
        Self::Service(Box::new(error))
    }
}
