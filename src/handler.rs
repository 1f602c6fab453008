use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::CosResult;
use crate::error::{ErrorType, ServiceError};
use crate::response::HttpResponse;
use crate::util::truncate_body;

pub const REQUEST_ID_HEADER: &str = "x-amz-request-id";
pub const EXTENDED_REQUEST_ID_HEADER: &str = "x-amz-id-2";
pub const ERROR_CODE_HEADER: &str = "x-amz-error-code";
pub const ERROR_TYPE_HEADER: &str = "x-amzn-errortype";

pub const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;
pub const DEFAULT_MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Turns a 2xx response into the caller's result type.
pub trait ResponseHandler<T>: Send + Sync {
    fn handle(&self, response: &mut HttpResponse) -> CosResult<T>;

    /// `true` when the handler returns something that keeps reading from the
    /// connection after `handle` returns (a streaming download).
    fn needs_connection_left_open(&self) -> bool {
        false
    }
}

impl<T, F> ResponseHandler<T> for F
where
    F: Fn(&mut HttpResponse) -> CosResult<T> + Send + Sync,
{
    fn handle(&self, response: &mut HttpResponse) -> CosResult<T> {
        self(response)
    }
}

/// Turns a non-2xx response into a [`ServiceError`].
pub trait ErrorResponseHandler: Send + Sync {
    fn handle(&self, response: &mut HttpResponse) -> CosResult<ServiceError>;
}

#[derive(Debug)]
pub struct JsonResponseHandler<T> {
    max_body_bytes: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonResponseHandler<T> {
    pub fn new() -> Self {
        Self::with_max_body_bytes(DEFAULT_MAX_RESPONSE_BODY_BYTES)
    }

    pub fn with_max_body_bytes(max_body_bytes: usize) -> Self {
        Self {
            max_body_bytes,
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonResponseHandler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResponseHandler<T> for JsonResponseHandler<T>
where
    T: DeserializeOwned,
{
    fn handle(&self, response: &mut HttpResponse) -> CosResult<T> {
        response.json_limited(self.max_body_bytes)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BytesResponseHandler {
    max_body_bytes: usize,
}

impl BytesResponseHandler {
    pub fn new(max_body_bytes: usize) -> Self {
        Self { max_body_bytes }
    }
}

impl Default for BytesResponseHandler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RESPONSE_BODY_BYTES)
    }
}

impl ResponseHandler<Bytes> for BytesResponseHandler {
    fn handle(&self, response: &mut HttpResponse) -> CosResult<Bytes> {
        response.bytes_limited(self.max_body_bytes)
    }
}

/// Builds a [`ServiceError`] from the status, the `x-amz-*` headers and an
/// XML or JSON error document when one is present.
#[derive(Clone, Debug)]
pub struct ServiceErrorResponseHandler {
    service_name: String,
    max_body_bytes: usize,
}

impl ServiceErrorResponseHandler {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            max_body_bytes: DEFAULT_MAX_ERROR_BODY_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }
}

impl ErrorResponseHandler for ServiceErrorResponseHandler {
    fn handle(&self, response: &mut HttpResponse) -> CosResult<ServiceError> {
        let status = response.status();
        let head = response.head().clone();
        let body = response.bytes_truncated(self.max_body_bytes)?;
        let document = parse_error_document(&body);

        let message = document
            .message
            .or_else(|| status.canonical_reason().map(str::to_owned))
            .unwrap_or_else(|| format!("status code {}", status.as_u16()));
        let mut error = ServiceError::new(status.as_u16(), message);
        error.service_name = self.service_name.clone();
        error.error_code = head
            .header(ERROR_CODE_HEADER)
            .map(str::to_owned)
            .or(document.code);
        error.request_id = head
            .header(REQUEST_ID_HEADER)
            .map(str::to_owned)
            .or(document.request_id);
        error.extended_request_id = head.header(EXTENDED_REQUEST_ID_HEADER).map(str::to_owned);
        if let Some(error_type) = head.header(ERROR_TYPE_HEADER) {
            error.error_type = match error_type.to_ascii_lowercase().as_str() {
                "client" | "sender" => ErrorType::Client,
                "service" | "server" | "receiver" => ErrorType::Service,
                _ => error.error_type,
            };
        }
        if !body.is_empty() {
            error.raw_body = Some(truncate_body(&body));
        }
        Ok(error)
    }
}

#[derive(Debug, Default)]
struct ErrorDocument {
    code: Option<String>,
    message: Option<String>,
    request_id: Option<String>,
}

fn parse_error_document(body: &[u8]) -> ErrorDocument {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        return parse_json_error(trimmed);
    }
    if trimmed.starts_with('<') {
        return ErrorDocument {
            code: xml_element(trimmed, "Code"),
            message: xml_element(trimmed, "Message"),
            request_id: xml_element(trimmed, "RequestId"),
        };
    }
    ErrorDocument::default()
}

fn parse_json_error(text: &str) -> ErrorDocument {
    let Ok(serde_json::Value::Object(fields)) = serde_json::from_str::<serde_json::Value>(text)
    else {
        return ErrorDocument::default();
    };
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| fields.get(*name).and_then(serde_json::Value::as_str))
            .map(str::to_owned)
    };
    ErrorDocument {
        // `__type` may be namespaced as `prefix#Code`.
        code: field(&["code", "Code", "__type"])
            .map(|code| code.rsplit('#').next().unwrap_or(&code).to_owned()),
        message: field(&["message", "Message", "errorMessage"]),
        request_id: field(&["requestId", "RequestId"]),
    }
}

fn xml_element(document: &str, name: &str) -> Option<String> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let start = document.find(&open)? + open.len();
    let end = start + document[start..].find(&close)?;
    let value = document[start..end].trim();
    (!value.is_empty()).then(|| unescape_xml(value))
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
