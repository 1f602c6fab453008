use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};

use crate::CosResult;
use crate::progress::ProgressListener;
use crate::util::{build_uri, encode_path, parse_header_name, parse_header_value};

/// Request body the transport can re-read for every attempt.
///
/// Readers that cannot rewind report `mark_supported() == false`; requests
/// carrying them are sent once and never retried.
pub trait ReplayableRead: Read + Send {
    fn mark_supported(&self) -> bool;

    /// Remembers the current position. Up to `read_limit` bytes may be read
    /// before the mark is invalidated.
    fn mark(&mut self, read_limit: usize);

    fn reset(&mut self) -> std::io::Result<()>;
}

/// Replays any reader by buffering what was read since the last mark.
pub struct BufferedReplay<R> {
    inner: R,
    buffer: Vec<u8>,
    position: usize,
    read_limit: usize,
    marked: bool,
}

impl<R> BufferedReplay<R>
where
    R: Read + Send,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            position: 0,
            read_limit: 0,
            marked: false,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R> Read for BufferedReplay<R>
where
    R: Read + Send,
{
    fn read(&mut self, output: &mut [u8]) -> std::io::Result<usize> {
        if self.position < self.buffer.len() {
            let available = &self.buffer[self.position..];
            let count = available.len().min(output.len());
            output[..count].copy_from_slice(&available[..count]);
            self.position += count;
            return Ok(count);
        }

        let read = self.inner.read(output)?;
        if self.marked && read > 0 {
            if self.buffer.len() + read > self.read_limit {
                self.marked = false;
                self.buffer.clear();
            } else {
                self.buffer.extend_from_slice(&output[..read]);
            }
            self.position = self.buffer.len();
        }
        Ok(read)
    }
}

impl<R> ReplayableRead for BufferedReplay<R>
where
    R: Read + Send,
{
    fn mark_supported(&self) -> bool {
        true
    }

    fn mark(&mut self, read_limit: usize) {
        self.buffer.drain(..self.position);
        self.position = 0;
        self.read_limit = read_limit;
        self.marked = true;
    }

    fn reset(&mut self) -> std::io::Result<()> {
        if !self.marked {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "resetting to invalid mark: read limit exceeded",
            ));
        }
        self.position = 0;
        Ok(())
    }
}

/// Replays a seekable source (files, cursors) by seeking back to the mark.
pub struct SeekableReplay<R> {
    inner: R,
    mark: Option<u64>,
}

impl<R> SeekableReplay<R>
where
    R: Read + Seek + Send,
{
    pub fn new(inner: R) -> Self {
        Self { inner, mark: None }
    }
}

impl<R> Read for SeekableReplay<R>
where
    R: Read + Seek + Send,
{
    fn read(&mut self, output: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(output)
    }
}

impl<R> ReplayableRead for SeekableReplay<R>
where
    R: Read + Seek + Send,
{
    fn mark_supported(&self) -> bool {
        true
    }

    fn mark(&mut self, _read_limit: usize) {
        self.mark = self.inner.stream_position().ok();
    }

    fn reset(&mut self) -> std::io::Result<()> {
        let position = self.mark.unwrap_or(0);
        self.inner.seek(SeekFrom::Start(position)).map(|_| ())
    }
}

/// A reader that can be consumed once.
pub struct OneShot<R> {
    inner: R,
}

impl<R> OneShot<R>
where
    R: Read + Send,
{
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R> Read for OneShot<R>
where
    R: Read + Send,
{
    fn read(&mut self, output: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(output)
    }
}

impl<R> ReplayableRead for OneShot<R>
where
    R: Read + Send,
{
    fn mark_supported(&self) -> bool {
        false
    }

    fn mark(&mut self, _read_limit: usize) {}

    fn reset(&mut self) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "one-shot request body cannot be reset",
        ))
    }
}

pub enum RequestBody {
    Bytes(Bytes),
    Stream(Box<dyn ReplayableRead>),
}

impl RequestBody {
    /// Wraps `reader` in a [`BufferedReplay`] so it can be retried.
    pub fn buffered<R>(reader: R) -> Self
    where
        R: Read + Send + 'static,
    {
        Self::Stream(Box::new(BufferedReplay::new(reader)))
    }

    pub fn one_shot<R>(reader: R) -> Self
    where
        R: Read + Send + 'static,
    {
        Self::Stream(Box::new(OneShot::new(reader)))
    }

    pub fn seekable<R>(reader: R) -> Self
    where
        R: Read + Seek + Send + 'static,
    {
        Self::Stream(Box::new(SeekableReplay::new(reader)))
    }

    pub fn is_repeatable(&self) -> bool {
        match self {
            Self::Bytes(_) => true,
            Self::Stream(stream) => stream.mark_supported(),
        }
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(bytes) => formatter
                .debug_tuple("Bytes")
                .field(&bytes.len())
                .finish(),
            Self::Stream(stream) => formatter
                .debug_struct("Stream")
                .field("mark_supported", &stream.mark_supported())
                .finish(),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

/// A marshalled service request: endpoint, resource path, parameters,
/// headers and body, plus the signing time offset carried across attempts.
pub struct Request {
    method: Method,
    endpoint: Uri,
    resource_path: String,
    encoded_resource_path: Option<String>,
    parameters: BTreeMap<String, Vec<String>>,
    headers: HeaderMap,
    body: Option<RequestBody>,
    time_offset: i64,
    service_name: String,
    operation_name: Option<String>,
    progress_listener: Option<Arc<dyn ProgressListener>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Request")
            .field("method", &self.method)
            .field("endpoint", &self.endpoint)
            .field("resource_path", &self.resource_path)
            .field("parameters", &self.parameters)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("time_offset", &self.time_offset)
            .field("service_name", &self.service_name)
            .field("operation_name", &self.operation_name)
            .finish()
    }
}

impl Request {
    pub fn new(method: Method, endpoint: Uri) -> Self {
        Self {
            method,
            endpoint,
            resource_path: String::new(),
            encoded_resource_path: None,
            parameters: BTreeMap::new(),
            headers: HeaderMap::new(),
            body: None,
            time_offset: 0,
            service_name: String::new(),
            operation_name: None,
            progress_listener: None,
        }
    }

    pub fn with_resource_path(mut self, resource_path: impl Into<String>) -> Self {
        self.set_resource_path(resource_path);
        self
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    pub fn with_operation_name(mut self, operation_name: impl Into<String>) -> Self {
        self.operation_name = Some(operation_name.into());
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_with_header(self, name: &str, value: &str) -> CosResult<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.with_header(name, value))
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_parameter(name, value);
        self
    }

    /// Adds a value-less parameter such as `?uploads`.
    pub fn with_flag_parameter(mut self, name: impl Into<String>) -> Self {
        self.parameters.entry(name.into()).or_default();
        self
    }

    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_time_offset(mut self, time_offset: i64) -> Self {
        self.time_offset = time_offset;
        self
    }

    pub fn with_progress_listener(mut self, listener: Arc<dyn ProgressListener>) -> Self {
        self.progress_listener = Some(listener);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }

    pub fn set_endpoint(&mut self, endpoint: Uri) {
        self.endpoint = endpoint;
    }

    pub fn resource_path(&self) -> &str {
        &self.resource_path
    }

    pub fn set_resource_path(&mut self, resource_path: impl Into<String>) {
        self.resource_path = resource_path.into();
        self.encoded_resource_path = None;
    }

    /// Points the request at an already-encoded path, as taken verbatim from
    /// a redirect `Location`.
    pub(crate) fn set_encoded_resource_path(&mut self, encoded_path: impl Into<String>) {
        let encoded_path = encoded_path.into();
        self.resource_path = encoded_path.clone();
        self.encoded_resource_path = Some(encoded_path);
    }

    pub fn parameters(&self) -> &BTreeMap<String, Vec<String>> {
        &self.parameters
    }

    pub fn add_parameter(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.parameters
            .entry(name.into())
            .or_default()
            .push(value.into());
    }

    pub(crate) fn replace_parameters(&mut self, parameters: BTreeMap<String, Vec<String>>) {
        self.parameters = parameters;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    pub(crate) fn body_mut(&mut self) -> Option<&mut RequestBody> {
        self.body.as_mut()
    }

    /// Borrows what the transport needs for one send.
    pub(crate) fn send_parts(
        &mut self,
    ) -> (
        &Method,
        &HeaderMap,
        Option<&mut RequestBody>,
        Option<&Arc<dyn ProgressListener>>,
    ) {
        (
            &self.method,
            &self.headers,
            self.body.as_mut(),
            self.progress_listener.as_ref(),
        )
    }

    /// Seconds to subtract from the local clock when signing.
    pub fn time_offset(&self) -> i64 {
        self.time_offset
    }

    pub fn set_time_offset(&mut self, time_offset: i64) {
        self.time_offset = time_offset;
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn operation_name(&self) -> Option<&str> {
        self.operation_name.as_deref()
    }

    pub fn progress_listener(&self) -> Option<&Arc<dyn ProgressListener>> {
        self.progress_listener.as_ref()
    }

    pub fn is_repeatable(&self) -> bool {
        self.body.as_ref().is_none_or(RequestBody::is_repeatable)
    }

    /// Full target URI: endpoint, resource path and encoded parameters.
    pub fn uri(&self) -> CosResult<Uri> {
        let encoded_path = self
            .encoded_resource_path
            .clone()
            .unwrap_or_else(|| encode_path(&self.resource_path));
        build_uri(&self.endpoint, &encoded_path, &self.parameters)
    }
}
