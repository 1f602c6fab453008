use std::io::Read;
use std::time::Duration;

use tracing::debug;

use super::{HttpTransport, TransportBody, TransportError, TransportRequest};
use crate::cancel::CancellationToken;
use crate::config::{ClientConfiguration, DEFAULT_CONNECT_TIMEOUT, DEFAULT_USER_AGENT};
use crate::error::TransportErrorKind;
use crate::response::HttpResponse;
use crate::util::redact_uri_for_logs;

/// Blocking transport on a pooled `ureq` agent.
///
/// Statuses are never turned into errors and redirects are never followed
/// here; the executor owns both decisions. Each attempt gets a global timeout equal to the time it has
/// left, so an expiring timer also ends the exchange on the wire.
#[derive(Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl std::fmt::Debug for UreqTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("UreqTransport").finish_non_exhaustive()
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new(DEFAULT_USER_AGENT, DEFAULT_CONNECT_TIMEOUT)
    }
}

impl UreqTransport {
    pub fn new(user_agent: &str, connect_timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .max_redirects(0)
            .user_agent(user_agent)
            .timeout_connect(Some(connect_timeout))
            .build();
        Self {
            agent: config.new_agent(),
        }
    }

    pub fn from_config(config: &ClientConfiguration) -> Self {
        Self::new(config.user_agent(), config.connect_timeout())
    }

    pub fn from_agent(agent: ureq::Agent) -> Self {
        Self { agent }
    }

    fn run<S: ureq::AsSendBody>(
        &self,
        request: &TransportRequest<'_>,
        body: S,
    ) -> Result<ureq::http::Response<ureq::Body>, TransportError> {
        let mut builder = ureq::http::Request::builder()
            .method(request.method.clone())
            .uri(request.uri.clone());
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }
        let built = builder
            .body(body)
            .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?;
        let configured = self
            .agent
            .configure_request(built)
            .timeout_global(request.timeout)
            .build();

        self.agent.run(configured).map_err(|source| {
            let kind = classify_ureq_transport_error(&source);
            debug!(
                kind = %kind,
                uri = %redact_uri_for_logs(&request.uri.to_string()),
                error = %source,
                "ureq transport failure"
            );
            TransportError::new(kind, source)
        })
    }
}

impl HttpTransport for UreqTransport {
    fn send(
        &self,
        mut request: TransportRequest<'_>,
        cancellation: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        let body = std::mem::replace(&mut request.body, TransportBody::Empty);
        let response = match body {
            TransportBody::Empty => self.run(&request, ())?,
            TransportBody::Bytes(bytes) => self.run(&request, bytes.as_ref())?,
            TransportBody::Reader(reader) => {
                let mut reader = CancellableReader {
                    inner: reader,
                    cancellation,
                };
                self.run(&request, ureq::SendBody::from_reader(&mut reader))?
            }
        };

        let (parts, body) = response.into_parts();
        Ok(HttpResponse::new(
            parts.status,
            parts.headers,
            Box::new(body.into_reader()),
        ))
    }
}

/// Stops feeding the request body once the attempt is cancelled, which is
/// the only point at which a blocking upload can be cut short.
struct CancellableReader<'a, 'b> {
    inner: &'a mut (dyn Read + Send),
    cancellation: &'b CancellationToken,
}

impl Read for CancellableReader<'_, '_> {
    fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
        if self.cancellation.is_cancelled() {
            return Err(std::io::Error::other("request body upload cancelled"));
        }
        self.inner.read(buffer)
    }
}

pub(crate) fn classify_ureq_transport_error(error: &ureq::Error) -> TransportErrorKind {
    match error {
        ureq::Error::HostNotFound => TransportErrorKind::Dns,
        ureq::Error::Tls(_) => TransportErrorKind::Tls,
        ureq::Error::Timeout(_) => TransportErrorKind::Timeout,
        ureq::Error::ConnectProxyFailed(_) | ureq::Error::ConnectionFailed => {
            TransportErrorKind::Connect
        }
        ureq::Error::Io(source) => match source.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportErrorKind::Timeout
            }
            std::io::ErrorKind::NotFound => TransportErrorKind::Dns,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::AddrNotAvailable => TransportErrorKind::Connect,
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => TransportErrorKind::Read,
            _ => TransportErrorKind::Other,
        },
        _ => TransportErrorKind::Other,
    }
}
