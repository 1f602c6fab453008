use std::io::Read;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::error::{BoxError, TransportErrorKind};
use crate::response::HttpResponse;

#[cfg(feature = "ureq-transport")]
mod ureq_transport;

#[cfg(feature = "ureq-transport")]
pub use ureq_transport::UreqTransport;

/// Body of one attempt. Stream bodies are borrowed so the executor can
/// rewind them for the next attempt.
pub enum TransportBody<'a> {
    Empty,
    Bytes(&'a Bytes),
    Reader(&'a mut (dyn Read + Send)),
}

impl std::fmt::Debug for TransportBody<'_> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => formatter.write_str("Empty"),
            Self::Bytes(bytes) => formatter.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Reader(_) => formatter.write_str("Reader"),
        }
    }
}

/// One fully signed HTTP exchange handed to the transport.
#[derive(Debug)]
pub struct TransportRequest<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub body: TransportBody<'a>,
    /// Time left for this attempt, already capped by the call deadline.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Error)]
#[error("{kind} failure: {source}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    #[source]
    pub source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }
}

/// Sends one attempt over the wire.
///
/// Non-2xx statuses are responses, not errors. Implementations should give
/// up promptly once `cancellation` is cancelled; the executor decides
/// whether that was a timeout or a caller abort.
pub trait HttpTransport: Send + Sync {
    fn send(
        &self,
        request: TransportRequest<'_>,
        cancellation: &CancellationToken,
    ) -> Result<HttpResponse, TransportError>;
}
