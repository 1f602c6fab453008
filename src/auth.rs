use std::sync::Arc;

use http::Uri;

use crate::CosResult;
use crate::error::ServiceError;
use crate::request::Request;
use crate::response::ResponseHead;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    pub fn with_session_token(mut self, session_token: impl Into<String>) -> Self {
        self.session_token = Some(session_token.into());
        self
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }
}

/// `Ok(None)` means anonymous access.
pub trait CredentialsProvider: Send + Sync {
    fn credentials(&self) -> CosResult<Option<Credentials>>;
}

#[derive(Clone, Debug)]
pub struct StaticCredentialsProvider {
    credentials: Option<Credentials>,
}

impl StaticCredentialsProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials: Some(credentials),
        }
    }

    pub fn anonymous() -> Self {
        Self { credentials: None }
    }
}

impl CredentialsProvider for StaticCredentialsProvider {
    fn credentials(&self) -> CosResult<Option<Credentials>> {
        Ok(self.credentials.clone())
    }
}

/// Signs a request in place. Signers read [`Request::time_offset`] to
/// correct for clock skew.
pub trait Signer: Send + Sync {
    fn sign(&self, request: &mut Request, credentials: Option<&Credentials>) -> CosResult<()>;

    /// Anonymous requests are only passed to signers that opt in.
    fn supports_anonymous(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpSigner;

impl Signer for NoOpSigner {
    fn sign(&self, _request: &mut Request, _credentials: Option<&Credentials>) -> CosResult<()> {
        Ok(())
    }
}

/// Chooses the signer for a target URI. Called again only when the target
/// changes through a redirect or an auth retry.
pub trait SignerProvider: Send + Sync {
    fn signer_for(&self, request: &Request, target: &Uri) -> Arc<dyn Signer>;
}

#[derive(Clone)]
pub struct FixedSignerProvider {
    signer: Arc<dyn Signer>,
}

impl std::fmt::Debug for FixedSignerProvider {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("FixedSignerProvider").finish_non_exhaustive()
    }
}

impl FixedSignerProvider {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self { signer }
    }
}

impl Default for FixedSignerProvider {
    fn default() -> Self {
        Self::new(Arc::new(NoOpSigner))
    }
}

impl SignerProvider for FixedSignerProvider {
    fn signer_for(&self, _request: &Request, _target: &Uri) -> Arc<dyn Signer> {
        Arc::clone(&self.signer)
    }
}

/// Where and how to resend after an authentication failure.
#[derive(Clone)]
pub struct AuthRetryParameters {
    pub endpoint: Uri,
    /// Overrides the provider's signer for the retried attempt.
    pub signer: Option<Arc<dyn Signer>>,
}

impl std::fmt::Debug for AuthRetryParameters {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AuthRetryParameters")
            .field("endpoint", &self.endpoint)
            .field("has_signer", &self.signer.is_some())
            .finish()
    }
}

impl AuthRetryParameters {
    pub fn new(endpoint: Uri) -> Self {
        Self {
            endpoint,
            signer: None,
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }
}

/// Recognises errors that call for resending to a different endpoint or
/// with a different signer, such as a wrong-region response.
pub trait AuthRetryStrategy: Send + Sync {
    fn should_retry_with_auth(
        &self,
        request: &Request,
        response: &ResponseHead,
        error: &ServiceError,
    ) -> Option<AuthRetryParameters>;
}
