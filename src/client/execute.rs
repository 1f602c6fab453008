use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::header::{HeaderName, HeaderValue, LOCATION};
use http::{HeaderMap, StatusCode, Uri};
use tracing::{debug, info_span, warn};
use uuid::Uuid;

use crate::CosResult;
use crate::auth::{AuthRetryStrategy, CredentialsProvider, SignerProvider};
use crate::cancel::CancellationToken;
use crate::error::{Error, HookPhase};
use crate::handler::{ErrorResponseHandler, ServiceErrorResponseHandler};
use crate::policy::{AttemptContext, RequestHandler};
use crate::progress::{ProgressEvent, ProgressReader};
use crate::rate_limit::SEND_TOKEN_COST;
use crate::request::{Request, RequestBody};
use crate::response::{HttpResponse, Response, ResponseHead};
use crate::retry::{RetryMode, RetryPolicy, RetryPolicyContext, is_throttling_error};
use crate::timer::TimerTask;
use crate::transport::{TransportBody, TransportError, TransportRequest};
use crate::util::{endpoint_of, redact_uri_for_logs, resolve_redirect_uri};

use super::attempt::{AttemptState, AttemptTarget, SignerCache};
use super::{ClientInner, ExecutionContext};

pub const INVOCATION_ID_HEADER: &str = "amz-sdk-invocation-id";
pub const RETRY_INFO_HEADER: &str = "amz-sdk-retry";

/// Unread response bytes discarded so the connection can be reused.
const DRAIN_LIMIT_BYTES: u64 = 64 * 1024;

enum Step<T> {
    Complete(Response<T>),
    Next(AttemptState),
}

struct RetryDecision {
    capacity: i64,
    delay: Duration,
}

/// Headers and parameters as they stood before the first attempt.
struct RequestSnapshot {
    headers: HeaderMap,
    parameters: BTreeMap<String, Vec<String>>,
}

pub(super) fn execute<T>(
    client: &ClientInner,
    mut request: Request,
    context: &ExecutionContext<T>,
) -> CosResult<Response<T>> {
    let span = info_span!(
        "cosreq.execute",
        service = %request.service_name(),
        operation = request.operation_name().unwrap_or(""),
        method = %request.method(),
    );
    let _entered = span.enter();

    client.metrics.record_request_started();
    let _in_flight = client.metrics.enter_in_flight();
    let started_at = Instant::now();

    let mut call = Call::new(client, context, &request);
    let result = call.run(&mut request);
    call.execution_task.cancel_task();
    let result = call.finish(&request, result);

    let listener = request.progress_listener();
    match &result {
        Ok(_) => {
            client.metrics.record_request_succeeded(started_at.elapsed());
            if let Some(listener) = listener {
                listener.progress_changed(ProgressEvent::ClientRequestSucceeded);
            }
        }
        Err(error) => {
            client
                .metrics
                .record_request_failed(error, started_at.elapsed());
            if let Some(listener) = listener {
                listener.progress_changed(ProgressEvent::ClientRequestFailed);
            }
        }
    }
    result
}

/// State for one logical call, shared by all of its attempts.
struct Call<'a, T> {
    client: &'a ClientInner,
    context: &'a ExecutionContext<T>,
    retry_policy: &'a RetryPolicy,
    max_error_retry: usize,
    request_timeout: Option<Duration>,
    error_handler: Arc<dyn ErrorResponseHandler>,
    signer_provider: &'a dyn SignerProvider,
    credentials_provider: &'a dyn CredentialsProvider,
    auth_retry_strategy: Option<&'a dyn AuthRetryStrategy>,
    call_token: CancellationToken,
    execution_task: TimerTask,
    last_head: Option<ResponseHead>,
    bytes_sent: u64,
}

impl<'a, T> Call<'a, T> {
    fn new(client: &'a ClientInner, context: &'a ExecutionContext<T>, request: &Request) -> Self {
        let config = &client.config;
        let request_config = &context.request_config;
        let retry_policy = request_config
            .retry_policy
            .as_ref()
            .unwrap_or_else(|| config.retry_policy());
        let max_error_retry =
            retry_policy.effective_max_error_retry(config.retry_mode(), config.max_error_retry());
        let error_handler = context
            .error_response_handler
            .clone()
            .or_else(|| client.error_response_handler.clone())
            .unwrap_or_else(|| {
                Arc::new(
                    ServiceErrorResponseHandler::new(request.service_name())
                        .with_max_body_bytes(config.max_error_body_bytes()),
                )
            });

        let call_token = context
            .cancellation
            .as_ref()
            .map(CancellationToken::child)
            .unwrap_or_default();
        let execution_task = client.client_execution_timer.start(
            request_config
                .client_execution_timeout
                .or(config.client_execution_timeout()),
            &call_token,
        );

        Self {
            client,
            context,
            retry_policy,
            max_error_retry,
            request_timeout: request_config.request_timeout.or(config.request_timeout()),
            error_handler,
            signer_provider: context
                .signer_provider
                .as_deref()
                .unwrap_or(client.signer_provider.as_ref()),
            credentials_provider: context
                .credentials_provider
                .as_deref()
                .unwrap_or(client.credentials_provider.as_ref()),
            auth_retry_strategy: context
                .auth_retry_strategy
                .as_deref()
                .or(client.auth_retry_strategy.as_deref()),
            call_token,
            execution_task,
            last_head: None,
            bytes_sent: 0,
        }
    }

    fn handlers(&self) -> impl Iterator<Item = &'a Arc<dyn RequestHandler>> + 'a {
        self.client
            .request_handlers
            .iter()
            .chain(self.context.request_handlers.iter())
    }

    fn retry_mode(&self) -> RetryMode {
        self.client.config.retry_mode()
    }

    fn run(&mut self, request: &mut Request) -> CosResult<Response<T>> {
        for handler in self.handlers() {
            handler
                .before_request(request)
                .map_err(|error| Error::hook(HookPhase::BeforeRequest, error, None))?;
        }

        let invocation_id = HeaderValue::try_from(Uuid::new_v4().to_string()).map_err(|source| {
            Error::InvalidHeaderValue {
                name: INVOCATION_ID_HEADER.to_owned(),
                source,
            }
        })?;
        request
            .headers_mut()
            .insert(HeaderName::from_static(INVOCATION_ID_HEADER), invocation_id);
        let snapshot = RequestSnapshot {
            headers: request.headers().clone(),
            parameters: request.parameters().clone(),
        };
        let stream_buffer_size = self.client.config.stream_buffer_size();
        if let Some(RequestBody::Stream(stream)) = request.body_mut() {
            stream.mark(stream_buffer_size);
        }
        let offset_pinned = request.time_offset() != 0;

        let mut signer_cache = SignerCache::default();
        let mut state = AttemptState::initial();
        loop {
            let outcome = self.attempt(
                request,
                &mut state,
                &snapshot,
                &mut signer_cache,
                offset_pinned,
            );
            let context = AttemptContext::new(
                state.attempt,
                redacted_uri(request),
                state.redirects,
                state.last_backoff,
            );
            match self.after_attempt(&context, outcome)? {
                Step::Complete(response) => return Ok(response),
                Step::Next(next) => {
                    if matches!(next.target, AttemptTarget::Initial) {
                        debug!(attempt = next.attempt, "starting retry attempt");
                    }
                    state = next;
                }
            }
        }
    }

    fn attempt(
        &mut self,
        request: &mut Request,
        state: &mut AttemptState,
        snapshot: &RequestSnapshot,
        signer_cache: &mut SignerCache,
        offset_pinned: bool,
    ) -> CosResult<Step<T>> {
        self.last_head = None;

        match &state.target {
            AttemptTarget::Initial => {}
            AttemptTarget::Redirected(location) => {
                request.set_endpoint(endpoint_of(location)?);
                request.set_encoded_resource_path(location.path());
            }
            AttemptTarget::AuthRetry(parameters) => {
                request.set_endpoint(parameters.endpoint.clone());
            }
        }

        if !state.is_first() {
            *request.headers_mut() = snapshot.headers.clone();
            request.replace_parameters(snapshot.parameters.clone());
            self.reset_body(request, state)?;
        }

        if self.retry_mode() == RetryMode::Adaptive
            && !self.client.token_bucket.acquire(
                SEND_TOKEN_COST,
                self.client.config.fast_fail_rate_limiting(),
                &self.call_token,
            )
        {
            if self.call_token.is_cancelled() {
                return Err(self.interrupted(request));
            }
            return Err(Error::SendTokenUnavailable {
                method: request.method().clone(),
                uri: redacted_uri(request),
            });
        }

        if state.needs_backoff()
            && !state.last_backoff.is_zero()
            && !self.call_token.sleep(state.last_backoff)
        {
            return Err(self.interrupted(request));
        }

        request
            .headers_mut()
            .insert(HeaderName::from_static(RETRY_INFO_HEADER), self.retry_info(state)?);

        let attempt_context = AttemptContext::new(
            state.attempt,
            redacted_uri(request),
            state.redirects,
            state.last_backoff,
        );
        for handler in self.handlers() {
            handler
                .before_attempt(&attempt_context, request)
                .map_err(|error| Error::hook(HookPhase::BeforeAttempt, error, None))?;
        }

        if !offset_pinned {
            request.set_time_offset(self.client.clock_skew.state().offset_seconds());
        }
        let target_uri = request.uri()?;
        let signer =
            signer_cache.resolve(&state.target, self.signer_provider, request, &target_uri);
        let credentials = self.credentials_provider.credentials()?;
        if credentials.is_some() || signer.supports_anonymous() {
            signer.sign(request, credentials.as_ref())?;
        }
        let uri = request.uri()?;

        if self.call_token.is_cancelled() {
            return Err(self.interrupted(request));
        }
        let attempt_token = self.call_token.child();
        let request_task = self
            .client
            .request_timer
            .start(self.request_timeout, &attempt_token);
        let timeout = [request_task.remaining(), self.execution_task.remaining()]
            .into_iter()
            .flatten()
            .min();

        self.client.metrics.record_attempt();
        debug!(
            attempt = state.attempt,
            uri = %redact_uri_for_logs(&uri.to_string()),
            timeout_ms = timeout.map(|timeout| timeout.as_millis() as u64),
            "sending request"
        );
        let sent = self.send(request, &uri, timeout, &attempt_token);

        let response = match sent {
            Ok(response) => response,
            Err(failure) => {
                request_task.cancel_task();
                let error = self.transport_failure(request, &uri, &request_task, failure);
                return self.retry_or_fail(request, state, error);
            }
        };

        let status = response.status();
        self.client.metrics.record_response_status(status.as_u16());
        self.last_head = Some(response.head().clone());

        if status.is_success() {
            return self.handle_success(request, state, &uri, &request_task, response);
        }

        if status == StatusCode::TEMPORARY_REDIRECT
            && let Some(location) = response.head().header(LOCATION.as_str())
            && let Some(redirected) = resolve_redirect_uri(&uri, location)
        {
            let redirect_policy = self.client.config.redirect_policy();
            if redirect_policy.enabled() {
                if state.redirects >= redirect_policy.max_redirects() {
                    return Err(Error::RedirectLimitExceeded {
                        max_redirects: redirect_policy.max_redirects(),
                        method: request.method().clone(),
                        uri: redact_uri_for_logs(&uri.to_string()),
                    });
                }
                warn!(
                    attempt = state.attempt,
                    location = %redact_uri_for_logs(&redirected.to_string()),
                    "following temporary redirect"
                );
                self.client.metrics.record_redirect();
                return Ok(Step::Next(state.next_redirect(redirected)));
            }
        }

        self.handle_error_response(request, state, &uri, &request_task, response)
    }

    fn send(
        &mut self,
        request: &mut Request,
        uri: &Uri,
        timeout: Option<Duration>,
        attempt_token: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        let transport = &self.client.transport;
        let (method, headers, body, listener) = request.send_parts();
        match body {
            None => transport.send(
                TransportRequest {
                    method,
                    uri,
                    headers,
                    body: TransportBody::Empty,
                    timeout,
                },
                attempt_token,
            ),
            Some(RequestBody::Bytes(bytes)) => {
                let sent = transport.send(
                    TransportRequest {
                        method,
                        uri,
                        headers,
                        body: TransportBody::Bytes(bytes),
                        timeout,
                    },
                    attempt_token,
                );
                if sent.is_ok() {
                    self.bytes_sent = bytes.len() as u64;
                    if let Some(listener) = listener {
                        listener.progress_changed(ProgressEvent::RequestBytesTransferred(
                            self.bytes_sent,
                        ));
                    }
                }
                sent
            }
            Some(RequestBody::Stream(stream)) => {
                let mut reader = ProgressReader::new(&mut **stream, listener);
                let sent = transport.send(
                    TransportRequest {
                        method,
                        uri,
                        headers,
                        body: TransportBody::Reader(&mut reader),
                        timeout,
                    },
                    attempt_token,
                );
                self.bytes_sent = reader.transferred();
                sent
            }
        }
    }

    fn reset_body(&mut self, request: &mut Request, state: &mut AttemptState) -> CosResult<()> {
        let bytes_sent = std::mem::take(&mut self.bytes_sent);
        let Some(RequestBody::Stream(stream)) = request.body_mut() else {
            return Ok(());
        };
        if let Err(source) = stream.reset() {
            warn!(error = %source, "request body could not be reset for retry");
            return Err(Error::ResetStream {
                source,
                cause: state.retry_cause.take().map(Box::new),
            });
        }
        if bytes_sent > 0
            && let Some(listener) = request.progress_listener()
        {
            listener.progress_changed(ProgressEvent::RequestBytesReset(bytes_sent));
        }
        Ok(())
    }

    /// The request timer stays armed until the handler has read the body.
    fn handle_success(
        &mut self,
        request: &Request,
        state: &mut AttemptState,
        uri: &Uri,
        request_task: &TimerTask,
        mut response: HttpResponse,
    ) -> CosResult<Step<T>> {
        if let Some(offset) = self.client.clock_skew.update_estimated_skew(response.head()) {
            debug!(offset, "clock skew estimate updated");
        }

        if state.capacity_consumed > 0 {
            self.client.capacity.release_n(state.capacity_consumed);
        } else {
            self.client.capacity.release();
        }
        if self.retry_mode() == RetryMode::Adaptive {
            self.client.token_bucket.update_client_sending_rate(false);
        }

        let response_handler = &self.context.response_handler;
        state.leave_connection_open = response_handler.needs_connection_left_open();
        let result = match response_handler.handle(&mut response) {
            Ok(result) => result,
            Err(error) => return self.handler_failure(request, state, uri, request_task, error),
        };
        request_task.cancel_task();
        if !state.leave_connection_open {
            discard_body(&mut response);
        }
        Ok(Step::Complete(Response::new(result, response.into_head())))
    }

    fn handle_error_response(
        &mut self,
        request: &mut Request,
        state: &AttemptState,
        uri: &Uri,
        request_task: &TimerTask,
        mut response: HttpResponse,
    ) -> CosResult<Step<T>> {
        let mut service_error = match self.error_handler.handle(&mut response) {
            Ok(service_error) => service_error,
            Err(error) => return self.handler_failure(request, state, uri, request_task, error),
        };
        request_task.cancel_task();
        if service_error.service_name.is_empty() {
            service_error.service_name = request.service_name().to_owned();
        }
        let head = response.into_head();

        if let Some(offset) =
            self.client
                .clock_skew
                .get_adjustment(request.time_offset(), &head, &service_error)
        {
            request.set_time_offset(offset);
            self.client.metrics.record_clock_skew_adjustment();
        }

        let auth_retry = match self.auth_retry_strategy {
            Some(strategy) if state.auth_retries < self.client.config.max_auth_retries() => {
                strategy.should_retry_with_auth(request, &head, &service_error)
            }
            _ => None,
        };

        let error = Error::from(service_error);
        let throttled = is_throttling_error(&error);
        if throttled {
            self.client.metrics.record_throttling_error();
        }
        if self.retry_mode() == RetryMode::Adaptive {
            self.client.token_bucket.update_client_sending_rate(throttled);
        }

        if let Some(parameters) = auth_retry {
            warn!(
                attempt = state.attempt,
                endpoint = %parameters.endpoint,
                error = %error,
                "retrying with new authentication parameters"
            );
            self.client.metrics.record_auth_retry();
            return Ok(Step::Next(state.next_auth_retry(parameters)));
        }
        self.retry_or_fail(request, state, error)
    }

    fn retry_or_fail(
        &self,
        request: &Request,
        state: &AttemptState,
        error: Error,
    ) -> CosResult<Step<T>> {
        let Some(decision) = self.retry_decision(request, state, &error) else {
            return Err(error);
        };
        warn!(
            attempt = state.attempt,
            retries_attempted = state.retries_attempted,
            delay_ms = decision.delay.as_millis() as u64,
            capacity_cost = decision.capacity,
            error = %error,
            "retrying request"
        );
        self.client.metrics.record_retry();
        if let Some(listener) = request.progress_listener() {
            listener.progress_changed(ProgressEvent::RetryScheduled {
                attempt: state.attempt + 1,
                delay: decision.delay,
            });
        }
        Ok(Step::Next(state.next_retry(
            error,
            decision.capacity,
            decision.delay,
        )))
    }

    fn retry_decision(
        &self,
        request: &Request,
        state: &AttemptState,
        error: &Error,
    ) -> Option<RetryDecision> {
        if !matches!(
            error,
            Error::Transport { .. } | Error::RequestTimeout { .. } | Error::Service(_)
        ) {
            return None;
        }
        if !request.is_repeatable() {
            debug!("request body cannot be replayed; not retrying");
            return None;
        }

        let capacity = &self.client.capacity;
        let cost = self.retry_mode().retry_cost(error);
        if !capacity.acquire_n(cost) {
            self.client.metrics.record_retry_capacity_exhausted();
            debug!(
                cost,
                available = capacity.available_capacity(),
                "retry capacity exhausted"
            );
            return None;
        }

        let context = RetryPolicyContext {
            request,
            error,
            retries_attempted: state.retries_attempted,
        };
        if !self.retry_policy.should_retry(&context, self.max_error_retry) {
            capacity.release_n(cost);
            return None;
        }
        Some(RetryDecision {
            capacity: cost,
            delay: self.retry_policy.delay_before_next_retry(&context),
        })
    }

    /// `{attempt - 1}/{last backoff ms}/{available capacity}`; the last field
    /// is blank when capacity is unbounded.
    fn retry_info(&self, state: &AttemptState) -> CosResult<HeaderValue> {
        let available = self.client.capacity.available_capacity();
        let available = if available >= 0 {
            available.to_string()
        } else {
            String::new()
        };
        let value = format!(
            "{}/{}/{}",
            state.attempt - 1,
            state.last_backoff.as_millis(),
            available
        );
        HeaderValue::try_from(value).map_err(|source| Error::InvalidHeaderValue {
            name: RETRY_INFO_HEADER.to_owned(),
            source,
        })
    }

    /// The call deadline wins over the attempt deadline, which wins over
    /// whatever the transport reported.
    fn transport_failure(
        &self,
        request: &Request,
        uri: &Uri,
        request_task: &TimerTask,
        failure: TransportError,
    ) -> Error {
        self.cut_short(request, uri, request_task)
            .unwrap_or_else(|| Error::Transport {
                kind: failure.kind,
                method: request.method().clone(),
                uri: redact_uri_for_logs(&uri.to_string()),
                source: failure.source,
            })
    }

    /// A handler error raised while a deadline or the caller cut the body
    /// read short is reported like a failed send: a request timeout may be
    /// retried, the rest end the call.
    fn handler_failure(
        &self,
        request: &Request,
        state: &AttemptState,
        uri: &Uri,
        request_task: &TimerTask,
        error: Error,
    ) -> CosResult<Step<T>> {
        let classified = self.cut_short(request, uri, request_task);
        request_task.cancel_task();
        match classified {
            Some(timeout @ Error::RequestTimeout { .. }) => {
                debug!(error = %error, "response body read outlived the request timeout");
                self.retry_or_fail(request, state, timeout)
            }
            Some(other) => Err(other),
            None => Err(error),
        }
    }

    /// Which deadline, if any, interrupted the attempt. The call deadline
    /// wins over the attempt deadline, which wins over caller cancellation.
    fn cut_short(&self, request: &Request, uri: &Uri, request_task: &TimerTask) -> Option<Error> {
        if self.execution_task.has_timeout_expired() {
            return Some(self.client_execution_timeout(request));
        }
        let uri = redact_uri_for_logs(&uri.to_string());
        if request_task.has_timeout_expired() {
            return Some(Error::RequestTimeout {
                timeout_ms: request_task.timeout().as_millis(),
                method: request.method().clone(),
                uri,
            });
        }
        if self.call_token.is_cancelled() {
            return Some(Error::Aborted {
                method: request.method().clone(),
                uri,
            });
        }
        None
    }

    /// A wait that returned early: either the call deadline or the caller.
    fn interrupted(&self, request: &Request) -> Error {
        if self.execution_task.has_timeout_expired() {
            return self.client_execution_timeout(request);
        }
        Error::Aborted {
            method: request.method().clone(),
            uri: redacted_uri(request),
        }
    }

    fn client_execution_timeout(&self, request: &Request) -> Error {
        Error::ClientExecutionTimeout {
            timeout_ms: self.execution_task.timeout().as_millis(),
            method: request.method().clone(),
            uri: redacted_uri(request),
        }
    }

    /// Runs `after_attempt` hooks. A failing hook replaces the attempt's
    /// outcome and keeps the error it displaced.
    fn after_attempt(
        &self,
        context: &AttemptContext,
        outcome: CosResult<Step<T>>,
    ) -> CosResult<Step<T>> {
        for handler in self.handlers() {
            let observed_error = match &outcome {
                Err(error) => Some(error),
                Ok(Step::Next(next)) => next.retry_cause.as_ref(),
                Ok(Step::Complete(_)) => None,
            };
            if let Err(hook_error) =
                handler.after_attempt(context, self.last_head.as_ref(), observed_error)
            {
                let replaced = match outcome {
                    Err(error) => Some(error),
                    Ok(Step::Next(next)) => next.retry_cause,
                    Ok(Step::Complete(_)) => None,
                };
                return Err(Error::hook(HookPhase::AfterAttempt, hook_error, replaced));
            }
        }
        outcome
    }

    fn finish(&self, request: &Request, result: CosResult<Response<T>>) -> CosResult<Response<T>> {
        match result {
            Ok(response) => {
                for handler in self.handlers() {
                    handler
                        .after_response(request, response.http_response())
                        .map_err(|error| Error::hook(HookPhase::AfterResponse, error, None))?;
                }
                Ok(response)
            }
            Err(error) => {
                for handler in self.handlers() {
                    if let Err(hook_error) =
                        handler.after_error(request, self.last_head.as_ref(), &error)
                    {
                        return Err(Error::hook(HookPhase::AfterError, hook_error, Some(error)));
                    }
                }
                Err(error)
            }
        }
    }
}

fn redacted_uri(request: &Request) -> String {
    match request.uri() {
        Ok(uri) => redact_uri_for_logs(&uri.to_string()),
        Err(_) => redact_uri_for_logs(&request.endpoint().to_string()),
    }
}

fn discard_body(response: &mut HttpResponse) {
    if let Some(body) = response.take_body() {
        let _ = std::io::copy(&mut body.take(DRAIN_LIMIT_BYTES), &mut std::io::sink());
    }
}
