use std::io::Read;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::CosResult;
use crate::error::Error;
use crate::util::{header_text, truncate_body};

const READ_CHUNK_SIZE: usize = 8192;

/// Status line and headers of a response, kept after the body is consumed.
#[derive(Clone, Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self { status, headers }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_text(&self.headers, name)
    }
}

/// A response whose body has not been read yet.
pub struct HttpResponse {
    head: ResponseHead,
    body: Option<Box<dyn Read + Send>>,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpResponse")
            .field("status", &self.head.status)
            .field("headers", &self.head.headers)
            .field("body_taken", &self.body.is_none())
            .finish()
    }
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Box<dyn Read + Send>) -> Self {
        Self {
            head: ResponseHead::new(status, headers),
            body: Some(body),
        }
    }

    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self::new(status, headers, Box::new(std::io::Cursor::new(body)))
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn into_head(self) -> ResponseHead {
        self.head
    }

    /// Hands the body stream to the caller. Later reads see an empty body.
    pub fn take_body(&mut self) -> Option<Box<dyn Read + Send>> {
        self.body.take()
    }

    /// Reads the whole body, failing once it grows past `max_bytes`.
    pub fn bytes_limited(&mut self, max_bytes: usize) -> CosResult<Bytes> {
        let Some(mut body) = self.body.take() else {
            return Ok(Bytes::new());
        };
        let max_bytes = max_bytes.max(1);
        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        let mut collected = Vec::new();
        let mut total_len = 0_usize;

        loop {
            let read = match body.read(&mut chunk) {
                Ok(read) => read,
                Err(source) if source.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(source) => return Err(Error::ReadBody { source }),
            };
            if read == 0 {
                break;
            }
            total_len = total_len.saturating_add(read);
            if total_len > max_bytes {
                return Err(Error::ResponseBodyTooLarge {
                    limit_bytes: max_bytes,
                    actual_bytes: total_len,
                });
            }
            collected.extend_from_slice(&chunk[..read]);
        }

        Ok(Bytes::from(collected))
    }

    /// Reads at most `max_bytes` and drops the rest. Used for error bodies,
    /// where a partial payload is still useful.
    pub fn bytes_truncated(&mut self, max_bytes: usize) -> CosResult<Bytes> {
        let Some(body) = self.body.take() else {
            return Ok(Bytes::new());
        };
        let mut collected = Vec::new();
        body.take(max_bytes as u64)
            .read_to_end(&mut collected)
            .map_err(|source| Error::ReadBody { source })?;
        Ok(Bytes::from(collected))
    }

    pub fn text_limited(&mut self, max_bytes: usize) -> CosResult<String> {
        let body = self.bytes_limited(max_bytes)?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    pub fn json_limited<T>(&mut self, max_bytes: usize) -> CosResult<T>
    where
        T: DeserializeOwned,
    {
        let body = self.bytes_limited(max_bytes)?;
        serde_json::from_slice(&body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&body),
        })
    }
}

/// Result of a successful call: the handler's output plus the response head
/// it was built from.
#[derive(Debug)]
pub struct Response<T> {
    result: T,
    head: ResponseHead,
}

impl<T> Response<T> {
    pub(crate) fn new(result: T, head: ResponseHead) -> Self {
        Self { result, head }
    }

    pub fn result(&self) -> &T {
        &self.result
    }

    pub fn into_result(self) -> T {
        self.result
    }

    pub fn http_response(&self) -> &ResponseHead {
        &self.head
    }

    pub fn into_parts(self) -> (T, ResponseHead) {
        (self.result, self.head)
    }
}
