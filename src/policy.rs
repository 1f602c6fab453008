use std::time::Duration;

use crate::CosResult;
use crate::error::Error;
use crate::request::Request;
use crate::response::ResponseHead;

pub const DEFAULT_MAX_REDIRECTS: usize = 10;
pub const DEFAULT_MAX_AUTH_RETRIES: usize = 3;

/// Limits how many `307 Temporary Redirect` hops a call follows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedirectPolicy {
    enabled: bool,
    max_redirects: usize,
}

impl RedirectPolicy {
    pub const fn none() -> Self {
        Self {
            enabled: false,
            max_redirects: 0,
        }
    }

    pub const fn limited(max_redirects: usize) -> Self {
        Self {
            enabled: true,
            max_redirects,
        }
    }

    pub const fn enabled(self) -> bool {
        self.enabled
    }

    pub const fn max_redirects(self) -> usize {
        if self.enabled { self.max_redirects } else { 0 }
    }
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::limited(DEFAULT_MAX_REDIRECTS)
    }
}

/// Per-attempt view handed to request handlers.
#[derive(Clone, Debug)]
pub struct AttemptContext {
    attempt: usize,
    uri: String,
    redirect_count: usize,
    last_backoff: Duration,
}

impl AttemptContext {
    pub(crate) fn new(attempt: usize, uri: String, redirect_count: usize, last_backoff: Duration) -> Self {
        Self {
            attempt,
            uri,
            redirect_count,
            last_backoff,
        }
    }

    /// Starts at 1 and counts redirects and auth retries too.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Target of this attempt with query and credentials removed.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn redirect_count(&self) -> usize {
        self.redirect_count
    }

    pub fn last_backoff(&self) -> Duration {
        self.last_backoff
    }
}

/// Hooks around a call and each of its attempts. Handlers run in
/// registration order; an error from any of them ends the call.
pub trait RequestHandler: Send + Sync {
    fn before_request(&self, _request: &mut Request) -> CosResult<()> {
        Ok(())
    }

    fn before_attempt(&self, _context: &AttemptContext, _request: &mut Request) -> CosResult<()> {
        Ok(())
    }

    fn after_attempt(
        &self,
        _context: &AttemptContext,
        _response: Option<&ResponseHead>,
        _error: Option<&Error>,
    ) -> CosResult<()> {
        Ok(())
    }

    fn after_response(&self, _request: &Request, _response: &ResponseHead) -> CosResult<()> {
        Ok(())
    }

    fn after_error(
        &self,
        _request: &Request,
        _response: Option<&ResponseHead>,
        _error: &Error,
    ) -> CosResult<()> {
        Ok(())
    }
}
