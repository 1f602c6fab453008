use std::sync::Arc;
use std::time::Duration;

use http::Uri;

use crate::auth::{AuthRetryParameters, Signer, SignerProvider};
use crate::error::Error;
use crate::request::Request;

/// Where the next attempt goes.
#[derive(Debug)]
pub(crate) enum AttemptTarget {
    Initial,
    Redirected(Uri),
    AuthRetry(AuthRetryParameters),
}

impl AttemptTarget {
    fn changes_target(&self) -> bool {
        !matches!(self, Self::Initial)
    }
}

/// Immutable record of one attempt. Each iteration of the executor loop
/// builds a new one from the outcome of the previous attempt.
#[derive(Debug)]
pub(crate) struct AttemptState {
    pub(crate) attempt: usize,
    pub(crate) retries_attempted: usize,
    pub(crate) redirects: usize,
    pub(crate) auth_retries: usize,
    pub(crate) last_backoff: Duration,
    /// Error that warranted this attempt; `None` for the first attempt and
    /// for redirects or auth retries.
    pub(crate) retry_cause: Option<Error>,
    pub(crate) target: AttemptTarget,
    /// Retry capacity acquired by the most recent retry; carried across
    /// redirects so a later success returns it.
    pub(crate) capacity_consumed: i64,
    pub(crate) leave_connection_open: bool,
}

impl AttemptState {
    pub(crate) fn initial() -> Self {
        Self {
            attempt: 1,
            retries_attempted: 0,
            redirects: 0,
            auth_retries: 0,
            last_backoff: Duration::ZERO,
            retry_cause: None,
            target: AttemptTarget::Initial,
            capacity_consumed: 0,
            leave_connection_open: false,
        }
    }

    pub(crate) fn is_first(&self) -> bool {
        self.attempt == 1
    }

    /// Redirects and auth retries resend immediately.
    pub(crate) fn needs_backoff(&self) -> bool {
        self.retry_cause.is_some()
    }

    pub(crate) fn next_retry(&self, cause: Error, capacity_consumed: i64, backoff: Duration) -> Self {
        Self {
            attempt: self.attempt + 1,
            retries_attempted: self.retries_attempted + 1,
            redirects: self.redirects,
            auth_retries: self.auth_retries,
            last_backoff: backoff,
            retry_cause: Some(cause),
            target: AttemptTarget::Initial,
            capacity_consumed,
            leave_connection_open: false,
        }
    }

    pub(crate) fn next_redirect(&self, location: Uri) -> Self {
        Self {
            attempt: self.attempt + 1,
            retries_attempted: self.retries_attempted,
            redirects: self.redirects + 1,
            auth_retries: self.auth_retries,
            last_backoff: Duration::ZERO,
            retry_cause: None,
            target: AttemptTarget::Redirected(location),
            capacity_consumed: self.capacity_consumed,
            leave_connection_open: false,
        }
    }

    pub(crate) fn next_auth_retry(&self, parameters: AuthRetryParameters) -> Self {
        Self {
            attempt: self.attempt + 1,
            retries_attempted: self.retries_attempted,
            redirects: self.redirects,
            auth_retries: self.auth_retries + 1,
            last_backoff: Duration::ZERO,
            retry_cause: None,
            target: AttemptTarget::AuthRetry(parameters),
            capacity_consumed: self.capacity_consumed,
            leave_connection_open: false,
        }
    }
}

/// Signer resolved for the current target. Reused across plain retries and
/// re-resolved when a redirect or auth retry moves the request.
#[derive(Default)]
pub(crate) struct SignerCache {
    signer: Option<Arc<dyn Signer>>,
}

impl SignerCache {
    pub(crate) fn resolve(
        &mut self,
        target: &AttemptTarget,
        provider: &dyn SignerProvider,
        request: &Request,
        uri: &Uri,
    ) -> Arc<dyn Signer> {
        if let AttemptTarget::AuthRetry(AuthRetryParameters {
            signer: Some(signer),
            ..
        }) = target
        {
            self.signer = Some(Arc::clone(signer));
        } else if self.signer.is_none() || target.changes_target() {
            self.signer = Some(provider.signer_for(request, uri));
        }
        match &self.signer {
            Some(signer) => Arc::clone(signer),
            None => provider.signer_for(request, uri),
        }
    }
}
