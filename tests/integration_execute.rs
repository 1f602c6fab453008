use std::collections::VecDeque;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};

use cosreq::{
    AttemptContext, AuthRetryParameters, AuthRetryStrategy, BytesResponseHandler,
    CancellationToken, CapacityManager, ClientConfiguration, ClockSkewState, Credentials,
    CredentialsProvider, Error, ErrorCode, ExecutionContext, ExponentialBackoff,
    FixedSignerProvider, HookPhase, HttpClient, HttpResponse, HttpTransport, INVOCATION_ID_HEADER,
    ProgressEvent, ProgressListener, RETRY_INFO_HEADER, RedirectPolicy, Request, RequestBody,
    RequestHandler, ResponseHead, RetryMode, RetryPolicy, ServiceError, Signer,
    StaticCredentialsProvider, TransportBody, TransportError, TransportErrorKind,
    TIMEOUT_RETRY_COST, TransportRequest,
};

enum Reply {
    Respond {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: Vec<u8>,
    },
    /// Blocks until the attempt is cancelled.
    Hang,
    /// Sends the status line, then stalls the body until the attempt is
    /// cancelled.
    StalledBody { status: u16 },
}

impl Reply {
    fn ok(body: &str) -> Self {
        Self::Respond {
            status: 200,
            headers: Vec::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    fn error(status: u16, code: &str) -> Self {
        Self::Respond {
            status,
            headers: Vec::new(),
            body: format!(
                "<?xml version=\"1.0\"?><Error><Code>{code}</Code><Message>{code} happened</Message></Error>"
            )
            .into_bytes(),
        }
    }

    fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        if let Self::Respond { headers, .. } = &mut self {
            headers.push((name, value.into()));
        }
        self
    }
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    method: Method,
    uri: String,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl CapturedRequest {
    fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
    }
}

/// Plays back a fixed list of replies and records every request it sees.
#[derive(Default)]
struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    captured: Mutex<Vec<CapturedRequest>>,
}

impl ScriptedTransport {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            captured: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<CapturedRequest> {
        self.captured.lock().expect("lock captured requests").clone()
    }

    fn calls(&self) -> usize {
        self.captured.lock().expect("lock captured requests").len()
    }
}

impl HttpTransport for ScriptedTransport {
    fn send(
        &self,
        request: TransportRequest<'_>,
        cancellation: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        let body = match request.body {
            TransportBody::Empty => Vec::new(),
            TransportBody::Bytes(bytes) => bytes.to_vec(),
            TransportBody::Reader(reader) => {
                let mut collected = Vec::new();
                reader
                    .read_to_end(&mut collected)
                    .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?;
                collected
            }
        };
        self.captured
            .lock()
            .expect("lock captured requests")
            .push(CapturedRequest {
                method: request.method.clone(),
                uri: request.uri.to_string(),
                headers: request.headers.clone(),
                body,
            });

        let reply = self
            .replies
            .lock()
            .expect("lock replies")
            .pop_front()
            .unwrap_or_else(|| Reply::ok(""));
        match reply {
            Reply::Respond {
                status,
                headers,
                body,
            } => {
                let mut header_map = HeaderMap::new();
                for (name, value) in headers {
                    header_map.insert(
                        HeaderName::from_static(name),
                        HeaderValue::from_str(&value).expect("valid mock header"),
                    );
                }
                Ok(HttpResponse::from_bytes(
                    StatusCode::from_u16(status).expect("valid mock status"),
                    header_map,
                    body,
                ))
            }
            Reply::StalledBody { status } => Ok(HttpResponse::new(
                StatusCode::from_u16(status).expect("valid mock status"),
                HeaderMap::new(),
                Box::new(StalledBody {
                    cancellation: cancellation.clone(),
                }),
            )),
            Reply::Hang => {
                cancellation.sleep(Duration::from_secs(10));
                Err(TransportError::new(
                    TransportErrorKind::Read,
                    "exchange interrupted",
                ))
            }
        }
    }
}

struct StalledBody {
    cancellation: CancellationToken,
}

impl Read for StalledBody {
    fn read(&mut self, _output: &mut [u8]) -> std::io::Result<usize> {
        self.cancellation.sleep(Duration::from_secs(5));
        Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "body read aborted",
        ))
    }
}

fn fast_retry_policy() -> RetryPolicy {
    RetryPolicy::standard().backoff_strategy(Arc::new(
        ExponentialBackoff::default()
            .base_delay(Duration::from_millis(1))
            .throttled_base_delay(Duration::from_millis(2))
            .max_backoff(Duration::from_millis(5))
            .jitter_ratio(0.0),
    ))
}

fn base_config() -> ClientConfiguration {
    ClientConfiguration::default().with_retry_policy(fast_retry_policy())
}

fn client(transport: &Arc<ScriptedTransport>, config: ClientConfiguration) -> HttpClient {
    HttpClient::builder()
        .config(config)
        .transport(transport.clone())
        .clock_skew_state(ClockSkewState::new())
        .build()
        .expect("client should build")
}

fn get_object() -> Request {
    Request::new(Method::GET, Uri::from_static("https://s3.example.com"))
        .with_service_name("Amazon S3")
        .with_operation_name("GetObject")
        .with_resource_path("/bucket/key")
}

fn bytes_context() -> ExecutionContext<Bytes> {
    ExecutionContext::new(BytesResponseHandler::default())
}

#[test]
fn standard_retry_reports_attempt_header_and_returns_capacity() {
    let transport = ScriptedTransport::new(vec![Reply::error(500, "SlowDown"), Reply::ok("done")]);
    let client = HttpClient::builder()
        .config(
            base_config()
                .with_retry_mode(RetryMode::Standard)
                .with_max_error_retry(2),
        )
        .transport(transport.clone())
        .clock_skew_state(ClockSkewState::new())
        .retry_capacity(Arc::new(CapacityManager::new(25)))
        .build()
        .expect("client should build");

    let response = client
        .execute(get_object(), bytes_context())
        .expect("retry should succeed");
    assert_eq!(response.result().as_ref(), b"done");

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].header(RETRY_INFO_HEADER), "0/0/25");
    assert_eq!(requests[1].header(RETRY_INFO_HEADER), "1/2/20");

    let invocation_id = requests[0].header(INVOCATION_ID_HEADER);
    assert_eq!(invocation_id.len(), 36);
    assert_eq!(requests[1].header(INVOCATION_ID_HEADER), invocation_id);

    assert_eq!(client.retry_capacity().available_capacity(), 25);
}

#[test]
fn invocation_id_is_fresh_per_call() {
    let transport = ScriptedTransport::new(vec![Reply::ok("a"), Reply::ok("b")]);
    let client = client(&transport, base_config());
    client
        .execute(get_object(), bytes_context())
        .expect("first call");
    client
        .execute(get_object(), bytes_context())
        .expect("second call");

    let requests = transport.requests();
    assert_ne!(
        requests[0].header(INVOCATION_ID_HEADER),
        requests[1].header(INVOCATION_ID_HEADER)
    );
}

#[test]
fn empty_capacity_pool_stops_retries() {
    let transport = ScriptedTransport::new(vec![Reply::error(500, "InternalError")]);
    let client = HttpClient::builder()
        .config(base_config().with_retry_mode(RetryMode::Standard))
        .transport(transport.clone())
        .clock_skew_state(ClockSkewState::new())
        .retry_capacity(Arc::new(CapacityManager::new(4)))
        .build()
        .expect("client should build");

    let error = client
        .execute(get_object(), bytes_context())
        .expect_err("no capacity left for a retry");
    assert_eq!(error.status_code(), Some(500));
    assert_eq!(transport.calls(), 1);

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.retry_capacity_exhausted, 1);
    assert_eq!(metrics.retries, 0);
    assert_eq!(client.retry_capacity().available_capacity(), 4);
}

#[test]
fn legacy_throttling_retries_do_not_draw_capacity() {
    let transport = ScriptedTransport::new(vec![
        Reply::error(503, "SlowDown"),
        Reply::ok("after throttle"),
        Reply::error(500, "InternalError"),
    ]);
    let client = HttpClient::builder()
        .config(base_config())
        .transport(transport.clone())
        .clock_skew_state(ClockSkewState::new())
        .retry_capacity(Arc::new(CapacityManager::new(0)))
        .build()
        .expect("client should build");

    let response = client
        .execute(get_object(), bytes_context())
        .expect("throttled retry is free in legacy mode");
    assert_eq!(response.result().as_ref(), b"after throttle");
    assert_eq!(transport.calls(), 2);

    let error = client
        .execute(get_object(), bytes_context())
        .expect_err("non-throttling retry needs capacity");
    assert_eq!(error.status_code(), Some(500));
    assert_eq!(transport.calls(), 3);
}

#[test]
fn non_retryable_status_fails_without_retry() {
    let transport = ScriptedTransport::new(vec![Reply::error(404, "NoSuchKey")]);
    let client = client(&transport, base_config());

    let error = client
        .execute(get_object(), bytes_context())
        .expect_err("404 is final");
    let service_error = error.service_error().expect("service error");
    assert_eq!(service_error.error_code(), Some("NoSuchKey"));
    assert_eq!(service_error.service_name, "Amazon S3");
    assert_eq!(transport.calls(), 1);
}

#[test]
fn temporary_redirect_rewrites_target_without_capacity() {
    let transport = ScriptedTransport::new(vec![
        Reply::error(307, "TemporaryRedirect")
            .with_header("location", "https://bucket.s3-eu.example.com/bucket/key"),
        Reply::ok("redirected"),
    ]);
    let client = HttpClient::builder()
        .config(base_config().with_retry_mode(RetryMode::Standard))
        .transport(transport.clone())
        .clock_skew_state(ClockSkewState::new())
        .retry_capacity(Arc::new(CapacityManager::new(25)))
        .build()
        .expect("client should build");

    let request = get_object().with_parameter("versionId", "1");
    let response = client
        .execute(request, bytes_context())
        .expect("redirect should be followed");
    assert_eq!(response.result().as_ref(), b"redirected");

    let requests = transport.requests();
    assert_eq!(requests[0].uri, "https://s3.example.com/bucket/key?versionId=1");
    assert_eq!(
        requests[1].uri,
        "https://bucket.s3-eu.example.com/bucket/key?versionId=1"
    );
    assert_eq!(requests[1].header(RETRY_INFO_HEADER), "1/0/25");
    assert_eq!(client.retry_capacity().available_capacity(), 25);

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.redirects, 1);
    assert_eq!(metrics.retries, 0);
}

#[test]
fn redirect_limit_is_enforced() {
    let location = "https://other.example.com/bucket/key";
    let transport = ScriptedTransport::new(vec![
        Reply::error(307, "TemporaryRedirect").with_header("location", location),
        Reply::error(307, "TemporaryRedirect").with_header("location", location),
    ]);
    let client = client(
        &transport,
        base_config().with_redirect_policy(RedirectPolicy::limited(1)),
    );

    let error = client
        .execute(get_object(), bytes_context())
        .expect_err("second redirect exceeds the limit");
    assert_eq!(error.code(), ErrorCode::RedirectLimitExceeded);
    assert_eq!(transport.calls(), 2);
}

#[test]
fn redirect_is_an_error_response_when_disabled() {
    let transport = ScriptedTransport::new(vec![
        Reply::error(307, "TemporaryRedirect")
            .with_header("location", "https://other.example.com/bucket/key"),
    ]);
    let client = client(
        &transport,
        base_config().with_redirect_policy(RedirectPolicy::none()),
    );

    let error = client
        .execute(get_object(), bytes_context())
        .expect_err("redirects are disabled");
    assert_eq!(error.status_code(), Some(307));
    assert_eq!(transport.calls(), 1);
}

#[test]
fn buffered_stream_body_is_replayed_identically() {
    let transport = ScriptedTransport::new(vec![Reply::error(500, "InternalError"), Reply::ok("")]);
    let client = client(&transport, base_config());

    let request = Request::new(Method::PUT, Uri::from_static("https://s3.example.com"))
        .with_resource_path("/bucket/upload")
        .with_body(RequestBody::buffered(Cursor::new(b"streamed payload".to_vec())));
    client
        .execute(request, bytes_context())
        .expect("replayed upload should succeed");

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].body, b"streamed payload");
    assert_eq!(requests[1].body, requests[0].body);
    assert_eq!(requests[1].method, Method::PUT);
}

#[test]
fn stream_past_replay_buffer_fails_with_retry_cause() {
    let transport = ScriptedTransport::new(vec![Reply::error(500, "InternalError")]);
    let client = client(&transport, base_config().with_stream_buffer_size(4));

    let request = Request::new(Method::PUT, Uri::from_static("https://s3.example.com"))
        .with_resource_path("/bucket/upload")
        .with_body(RequestBody::buffered(Cursor::new(vec![9_u8; 64])));
    let error = client
        .execute(request, bytes_context())
        .expect_err("body cannot be rewound");

    match error {
        Error::ResetStream {
            cause: Some(cause), ..
        } => assert_eq!(cause.status_code(), Some(500)),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(transport.calls(), 1);
    assert_eq!(client.metrics_snapshot().reset_stream_failures, 1);
}

#[test]
fn one_shot_body_is_never_retried() {
    let transport = ScriptedTransport::new(vec![Reply::error(503, "ServiceUnavailable")]);
    let client = client(&transport, base_config());

    let request = Request::new(Method::PUT, Uri::from_static("https://s3.example.com"))
        .with_resource_path("/bucket/upload")
        .with_body(RequestBody::one_shot(Cursor::new(b"once".to_vec())));
    let error = client
        .execute(request, bytes_context())
        .expect_err("one-shot bodies are not replayed");
    assert_eq!(error.status_code(), Some(503));
    assert_eq!(transport.calls(), 1);
}

#[test]
fn request_timeout_is_retried_then_reported() {
    let transport = ScriptedTransport::new(vec![Reply::Hang, Reply::Hang]);
    let client = client(
        &transport,
        base_config()
            .with_request_timeout(Duration::from_millis(30))
            .with_max_error_retry(1),
    );

    let started = Instant::now();
    let error = client
        .execute(get_object(), bytes_context())
        .expect_err("every attempt hangs");
    assert_eq!(error.code(), ErrorCode::RequestTimeout);
    assert!(error.is_timeout());
    assert_eq!(transport.calls(), 2);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(client.metrics_snapshot().request_timeouts, 1);
}

#[test]
fn client_execution_timeout_wins_over_request_timeout() {
    let transport = ScriptedTransport::new(vec![Reply::Hang, Reply::Hang, Reply::Hang, Reply::Hang]);
    let client = client(
        &transport,
        base_config()
            .with_request_timeout(Duration::from_millis(40))
            .with_client_execution_timeout(Duration::from_millis(100)),
    );

    let started = Instant::now();
    let error = client
        .execute(get_object(), bytes_context())
        .expect_err("call deadline should expire");
    assert_eq!(error.code(), ErrorCode::ClientExecutionTimeout);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(client.metrics_snapshot().client_execution_timeouts, 1);
}

#[test]
fn per_call_timeout_overrides_client_configuration() {
    let transport = ScriptedTransport::new(vec![Reply::Hang]);
    let client = client(&transport, base_config());

    let context = bytes_context().request_config(
        cosreq::RequestConfig::default()
            .with_client_execution_timeout(Duration::from_millis(50)),
    );
    let error = client
        .execute(get_object(), context)
        .expect_err("call deadline should expire");
    assert_eq!(error.code(), ErrorCode::ClientExecutionTimeout);
}

#[test]
fn caller_cancellation_aborts_the_call() {
    let transport = ScriptedTransport::new(vec![Reply::Hang]);
    let client = client(&transport, base_config());

    let token = CancellationToken::new();
    let canceller = token.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        canceller.cancel();
    });

    let error = client
        .execute(get_object(), bytes_context().cancellation(token))
        .expect_err("caller cancelled");
    handle.join().expect("canceller thread should not panic");
    assert_eq!(error.code(), ErrorCode::Aborted);
    assert_eq!(transport.calls(), 1);
}

#[test]
fn successful_timeout_retry_returns_exactly_its_cost() {
    let capacity = Arc::new(CapacityManager::new(100));
    assert!(capacity.acquire_n(30));
    let transport = ScriptedTransport::new(vec![Reply::Hang, Reply::ok("done")]);
    let client = HttpClient::builder()
        .config(
            base_config()
                .with_retry_mode(RetryMode::Standard)
                .with_request_timeout(Duration::from_millis(30)),
        )
        .transport(transport.clone())
        .clock_skew_state(ClockSkewState::new())
        .retry_capacity(Arc::clone(&capacity))
        .build()
        .expect("client should build");

    client
        .execute(get_object(), bytes_context())
        .expect("retry should succeed");

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].header(RETRY_INFO_HEADER), "0/0/70");
    assert!(
        requests[1]
            .header(RETRY_INFO_HEADER)
            .ends_with(&format!("/{}", 70 - TIMEOUT_RETRY_COST))
    );
    assert_eq!(capacity.available_capacity(), 70);
}

#[test]
fn stalled_body_read_reports_client_execution_timeout() {
    let transport = ScriptedTransport::new(vec![Reply::StalledBody { status: 200 }]);
    let client = client(
        &transport,
        base_config().with_client_execution_timeout(Duration::from_millis(50)),
    );

    let started = Instant::now();
    let error = client
        .execute(get_object(), bytes_context())
        .expect_err("call deadline should expire while reading the body");
    assert_eq!(error.code(), ErrorCode::ClientExecutionTimeout);
    assert_eq!(transport.calls(), 1);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(client.metrics_snapshot().client_execution_timeouts, 1);
}

#[test]
fn stalled_error_body_reports_client_execution_timeout() {
    let transport = ScriptedTransport::new(vec![Reply::StalledBody { status: 503 }]);
    let client = client(
        &transport,
        base_config().with_client_execution_timeout(Duration::from_millis(50)),
    );

    let error = client
        .execute(get_object(), bytes_context())
        .expect_err("call deadline should expire while reading the error body");
    assert_eq!(error.code(), ErrorCode::ClientExecutionTimeout);
    assert_eq!(transport.calls(), 1);
}

#[test]
fn stalled_body_read_past_request_timeout_is_retried() {
    let transport = ScriptedTransport::new(vec![
        Reply::StalledBody { status: 200 },
        Reply::ok("done"),
    ]);
    let client = client(
        &transport,
        base_config().with_request_timeout(Duration::from_millis(40)),
    );

    let response = client
        .execute(get_object(), bytes_context())
        .expect("second attempt should succeed");
    assert_eq!(response.result().as_ref(), b"done");
    assert_eq!(transport.calls(), 2);
    assert_eq!(client.metrics_snapshot().retries, 1);
}

#[test]
fn adaptive_fast_fail_rejects_once_throttled() {
    let transport = ScriptedTransport::new(vec![Reply::error(503, "SlowDown"), Reply::ok("")]);
    let client = client(
        &transport,
        base_config()
            .with_retry_mode(RetryMode::Adaptive)
            .with_fast_fail_rate_limiting(true),
    );

    let error = client
        .execute(get_object(), bytes_context())
        .expect_err("send token should be unavailable");
    assert_eq!(error.code(), ErrorCode::SendTokenUnavailable);
    assert_eq!(transport.calls(), 1);
    assert!(client.token_bucket_snapshot().enabled);

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.throttling_errors, 1);
    assert_eq!(metrics.send_token_rejections, 1);
}

#[test]
fn adaptive_mode_without_throttling_never_limits() {
    let transport = ScriptedTransport::new(vec![Reply::ok("1"), Reply::ok("2"), Reply::ok("3")]);
    let client = client(
        &transport,
        base_config()
            .with_retry_mode(RetryMode::Adaptive)
            .with_fast_fail_rate_limiting(true),
    );
    for _ in 0..3 {
        client
            .execute(get_object(), bytes_context())
            .expect("limiter stays disabled");
    }
    assert!(!client.token_bucket_snapshot().enabled);
}

#[derive(Default)]
struct RecordingHandler {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    fail_after_attempt: bool,
    fail_after_response: bool,
    fail_after_error: bool,
}

impl RecordingHandler {
    fn push(&self, entry: String) {
        self.log
            .lock()
            .expect("lock hook log")
            .push(format!("{}:{entry}", self.name));
    }
}

impl RequestHandler for RecordingHandler {
    fn before_request(&self, _request: &mut Request) -> cosreq::CosResult<()> {
        self.push("before_request".to_owned());
        Ok(())
    }

    fn before_attempt(
        &self,
        context: &AttemptContext,
        _request: &mut Request,
    ) -> cosreq::CosResult<()> {
        self.push(format!("before_attempt:{}", context.attempt()));
        Ok(())
    }

    fn after_attempt(
        &self,
        context: &AttemptContext,
        response: Option<&ResponseHead>,
        error: Option<&Error>,
    ) -> cosreq::CosResult<()> {
        let outcome = response
            .map(|head| head.status.as_u16().to_string())
            .or_else(|| error.map(|error| error.code().as_str().to_owned()))
            .unwrap_or_default();
        self.push(format!("after_attempt:{}:{outcome}", context.attempt()));
        if self.fail_after_attempt {
            return Err(ServiceError::new(418, "hook rejected attempt").into());
        }
        Ok(())
    }

    fn after_response(&self, _request: &Request, response: &ResponseHead) -> cosreq::CosResult<()> {
        self.push(format!("after_response:{}", response.status.as_u16()));
        if self.fail_after_response {
            return Err(ServiceError::new(418, "hook rejected response").into());
        }
        Ok(())
    }

    fn after_error(
        &self,
        _request: &Request,
        _response: Option<&ResponseHead>,
        error: &Error,
    ) -> cosreq::CosResult<()> {
        self.push(format!("after_error:{}", error.code().as_str()));
        if self.fail_after_error {
            return Err(ServiceError::new(418, "hook rejected error").into());
        }
        Ok(())
    }
}

#[test]
fn hooks_run_in_order_around_each_attempt() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let transport = ScriptedTransport::new(vec![Reply::error(503, "SlowDown"), Reply::ok("")]);
    let client = HttpClient::builder()
        .config(base_config())
        .transport(transport.clone())
        .clock_skew_state(ClockSkewState::new())
        .request_handler(Arc::new(RecordingHandler {
            name: "client",
            log: Arc::clone(&log),
            ..RecordingHandler::default()
        }))
        .build()
        .expect("client should build");

    let context = bytes_context().request_handler(Arc::new(RecordingHandler {
        name: "call",
        log: Arc::clone(&log),
        ..RecordingHandler::default()
    }));
    client
        .execute(get_object(), context)
        .expect("retry should succeed");

    let log = log.lock().expect("lock hook log").clone();
    assert_eq!(
        log,
        vec![
            "client:before_request",
            "call:before_request",
            "client:before_attempt:1",
            "call:before_attempt:1",
            "client:after_attempt:1:503",
            "call:after_attempt:1:503",
            "client:before_attempt:2",
            "call:before_attempt:2",
            "client:after_attempt:2:200",
            "call:after_attempt:2:200",
            "client:after_response:200",
            "call:after_response:200",
        ]
    );
}

#[test]
fn failing_after_attempt_hook_replaces_the_outcome() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let transport = ScriptedTransport::new(vec![Reply::error(503, "SlowDown"), Reply::ok("")]);
    let client = client(&transport, base_config());

    let context = bytes_context().request_handler(Arc::new(RecordingHandler {
        name: "call",
        log: Arc::clone(&log),
        fail_after_attempt: true,
        ..RecordingHandler::default()
    }));
    let error = client
        .execute(get_object(), context)
        .expect_err("hook failure ends the call");

    match &error {
        Error::HookFailed {
            phase, replaced, ..
        } => {
            assert_eq!(*phase, HookPhase::AfterAttempt);
            let replaced = replaced.as_deref().expect("retry cause is kept");
            assert_eq!(replaced.status_code(), Some(503));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(transport.calls(), 1);
    assert_eq!(
        log.lock().expect("lock hook log").last().map(String::as_str),
        Some("call:after_error:hook_failed")
    );
}

#[test]
fn failing_after_response_hook_replaces_the_result() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let transport = ScriptedTransport::new(vec![Reply::ok("payload")]);
    let client = client(&transport, base_config());

    let context = bytes_context().request_handler(Arc::new(RecordingHandler {
        name: "call",
        log: Arc::clone(&log),
        fail_after_response: true,
        ..RecordingHandler::default()
    }));
    let error = client
        .execute(get_object(), context)
        .expect_err("hook failure discards the result");

    match &error {
        Error::HookFailed {
            phase, replaced, ..
        } => {
            assert_eq!(*phase, HookPhase::AfterResponse);
            assert!(replaced.is_none());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(transport.calls(), 1);

    let log = log.lock().expect("lock hook log").clone();
    assert_eq!(log.last().map(String::as_str), Some("call:after_response:200"));
    assert!(!log.iter().any(|entry| entry.starts_with("call:after_error")));

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.requests_succeeded, 0);
    assert_eq!(metrics.requests_failed, 1);
}

#[test]
fn failing_after_error_hook_keeps_the_service_error() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let transport = ScriptedTransport::new(vec![Reply::error(404, "NoSuchKey")]);
    let client = client(&transport, base_config());

    let context = bytes_context().request_handler(Arc::new(RecordingHandler {
        name: "call",
        log: Arc::clone(&log),
        fail_after_error: true,
        ..RecordingHandler::default()
    }));
    let error = client
        .execute(get_object(), context)
        .expect_err("missing key fails");

    match &error {
        Error::HookFailed {
            phase, replaced, ..
        } => {
            assert_eq!(*phase, HookPhase::AfterError);
            let replaced = replaced.as_deref().expect("service error is kept");
            assert_eq!(replaced.status_code(), Some(404));
            assert_eq!(
                replaced.service_error().and_then(ServiceError::error_code),
                Some("NoSuchKey")
            );
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(transport.calls(), 1);
    assert_eq!(
        log.lock().expect("lock hook log").last().map(String::as_str),
        Some("call:after_error:service")
    );
}

/// Stamps the credentials and signing offset onto the request.
struct HeaderSigner;

impl Signer for HeaderSigner {
    fn sign(&self, request: &mut Request, credentials: Option<&Credentials>) -> cosreq::CosResult<()> {
        let access_key = credentials.map(Credentials::access_key_id).unwrap_or("anonymous");
        let value = format!("{access_key}/{}", request.time_offset());
        request.headers_mut().insert(
            HeaderName::from_static("x-test-signature"),
            HeaderValue::from_str(&value).expect("valid signature header"),
        );
        Ok(())
    }
}

fn signing_client(transport: &Arc<ScriptedTransport>, config: ClientConfiguration) -> HttpClient {
    HttpClient::builder()
        .config(config)
        .transport(transport.clone())
        .clock_skew_state(ClockSkewState::new())
        .credentials_provider(Arc::new(StaticCredentialsProvider::new(Credentials::new(
            "AKIDEXAMPLE",
            "secret",
        ))))
        .signer_provider(Arc::new(FixedSignerProvider::new(Arc::new(HeaderSigner))))
        .build()
        .expect("client should build")
}

fn signed_offset(request: &CapturedRequest) -> i64 {
    let signature = request.header("x-test-signature");
    let (_, offset) = signature.split_once('/').expect("signature has an offset");
    offset.parse().expect("offset is numeric")
}

#[test]
fn clock_skew_error_adjusts_offset_for_next_attempt() {
    let server_time = SystemTime::now() + Duration::from_secs(900);
    let transport = ScriptedTransport::new(vec![
        Reply::error(403, "RequestTimeTooSkewed")
            .with_header("date", httpdate::fmt_http_date(server_time)),
        Reply::ok("signed"),
    ]);
    let client = signing_client(&transport, base_config());

    client
        .execute(get_object(), bytes_context())
        .expect("retry with corrected offset should succeed");

    let requests = transport.requests();
    assert_eq!(signed_offset(&requests[0]), 0);
    let corrected = signed_offset(&requests[1]);
    assert!((-902..=-898).contains(&corrected), "offset {corrected}");
    assert_eq!(client.clock_skew().state().offset_seconds(), corrected);
    assert_eq!(client.metrics_snapshot().clock_skew_adjustments, 1);
}

#[test]
fn caller_supplied_offset_is_used_for_signing() {
    let transport = ScriptedTransport::new(vec![Reply::ok("")]);
    let client = signing_client(&transport, base_config());
    client.clock_skew().state().set_offset_seconds(42);

    client
        .execute(get_object().with_time_offset(-7), bytes_context())
        .expect("call should succeed");
    assert_eq!(signed_offset(&transport.requests()[0]), -7);
}

struct RegionRedirect;

impl AuthRetryStrategy for RegionRedirect {
    fn should_retry_with_auth(
        &self,
        _request: &Request,
        _response: &ResponseHead,
        error: &ServiceError,
    ) -> Option<AuthRetryParameters> {
        (error.error_code() == Some("AuthorizationHeaderMalformed"))
            .then(|| AuthRetryParameters::new(Uri::from_static("https://s3.eu-west-1.example.com")))
    }
}

#[test]
fn auth_retry_resends_to_new_endpoint() {
    let transport = ScriptedTransport::new(vec![
        Reply::error(400, "AuthorizationHeaderMalformed"),
        Reply::ok("regional"),
    ]);
    let client = signing_client(&transport, base_config());

    let response = client
        .execute(
            get_object(),
            bytes_context().auth_retry_strategy(Arc::new(RegionRedirect)),
        )
        .expect("auth retry should succeed");
    assert_eq!(response.result().as_ref(), b"regional");

    let requests = transport.requests();
    assert_eq!(requests[1].uri, "https://s3.eu-west-1.example.com/bucket/key");
    assert!(requests[1].header("x-test-signature").starts_with("AKIDEXAMPLE/"));

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.auth_retries, 1);
    assert_eq!(metrics.retries, 0);
}

struct FailingCredentials;

impl CredentialsProvider for FailingCredentials {
    fn credentials(&self) -> cosreq::CosResult<Option<Credentials>> {
        Err(Error::Credentials {
            source: "credential endpoint unreachable".into(),
        })
    }
}

#[test]
fn credentials_failure_is_not_retried() {
    let transport = ScriptedTransport::new(vec![Reply::ok("")]);
    let client = client(&transport, base_config());

    let error = client
        .execute(
            get_object(),
            bytes_context().credentials_provider(Arc::new(FailingCredentials)),
        )
        .expect_err("credentials are required");
    assert_eq!(error.code(), ErrorCode::Credentials);
    assert_eq!(transport.calls(), 0);
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressListener for RecordingListener {
    fn progress_changed(&self, event: ProgressEvent) {
        self.events.lock().expect("lock events").push(event);
    }
}

#[test]
fn progress_events_cover_retries_and_completion() {
    let listener = Arc::new(RecordingListener::default());
    let transport = ScriptedTransport::new(vec![Reply::error(500, "InternalError"), Reply::ok("")]);
    let client = client(&transport, base_config());

    let request = Request::new(Method::PUT, Uri::from_static("https://s3.example.com"))
        .with_resource_path("/bucket/upload")
        .with_body(RequestBody::buffered(Cursor::new(b"abc".to_vec())))
        .with_progress_listener(listener.clone());
    client
        .execute(request, bytes_context())
        .expect("upload should succeed");

    let events = listener.events.lock().expect("lock events").clone();
    assert!(events.contains(&ProgressEvent::RequestBytesReset(3)));
    assert!(events.iter().any(|event| matches!(
        event,
        ProgressEvent::RetryScheduled { attempt: 2, .. }
    )));
    assert_eq!(events.last(), Some(&ProgressEvent::ClientRequestSucceeded));

    let transferred: u64 = events
        .iter()
        .map(|event| match event {
            ProgressEvent::RequestBytesTransferred(bytes) => *bytes,
            _ => 0,
        })
        .sum();
    assert_eq!(transferred, 6);
}

#[test]
fn metrics_snapshot_tracks_attempts_and_statuses() {
    let transport = ScriptedTransport::new(vec![Reply::error(503, "SlowDown"), Reply::ok("")]);
    let client = client(&transport, base_config());
    client
        .execute(get_object(), bytes_context())
        .expect("retry should succeed");

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.requests_started, 1);
    assert_eq!(metrics.requests_succeeded, 1);
    assert_eq!(metrics.attempts, 2);
    assert_eq!(metrics.retries, 1);
    assert_eq!(metrics.throttling_errors, 1);
    assert_eq!(metrics.in_flight, 0);
    assert_eq!(metrics.status_counts.get(&503), Some(&1));
    assert_eq!(metrics.status_counts.get(&200), Some(&1));
}

#[test]
fn response_body_is_read_by_custom_handler() {
    let transport = ScriptedTransport::new(vec![
        Reply::ok("{\"name\":\"bucket\"}").with_header("x-amz-request-id", "req-9"),
    ]);
    let client = client(&transport, base_config());

    let context = ExecutionContext::new(|response: &mut HttpResponse| -> cosreq::CosResult<usize> {
        let text = response.text_limited(1024)?;
        Ok(text.len())
    });
    let response = client
        .execute(get_object(), context)
        .expect("handler should run");
    assert_eq!(*response.result(), 17);
    assert_eq!(response.http_response().header("x-amz-request-id"), Some("req-9"));
}

#[test]
fn drained_reader_does_not_leak_into_next_attempt() {
    struct ChunkedReader {
        remaining: usize,
    }

    impl Read for ChunkedReader {
        fn read(&mut self, output: &mut [u8]) -> std::io::Result<usize> {
            let count = self.remaining.min(output.len()).min(3);
            output[..count].fill(b'z');
            self.remaining -= count;
            Ok(count)
        }
    }

    let transport = ScriptedTransport::new(vec![Reply::error(502, "BadGateway"), Reply::ok("")]);
    let client = client(&transport, base_config());
    let request = Request::new(Method::PUT, Uri::from_static("https://s3.example.com"))
        .with_resource_path("/bucket/chunked")
        .with_body(RequestBody::buffered(ChunkedReader { remaining: 10 }));
    client
        .execute(request, bytes_context())
        .expect("chunked upload should succeed");

    let requests = transport.requests();
    assert_eq!(requests[0].body, vec![b'z'; 10]);
    assert_eq!(requests[1].body, vec![b'z'; 10]);
}
