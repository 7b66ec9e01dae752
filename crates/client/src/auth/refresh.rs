// Credential refresh for reconnecting sessions.
//
// A Session never signs tokens itself; when a connect fails it asks its
// `CredentialRefresher` for a fresh access credential. Refreshers own the
// rotating refresh credential and clear it when rotation fails, which is the
// caller's cue that full reauthentication is required.

use std::future::Future;
use std::sync::{Arc, Mutex};

use chatgen_common::protocol::reissue::{TokenReissueRequest, TokenReissueResponse, REISSUE_PATH};
use thiserror::Error;
use tracing::{debug, warn};

use super::token::{AuthError, Credential, CredentialPair, TokenProvider};

#[derive(Debug, Error)]
pub enum RefreshError {
    /// The stored refresh credential is missing, invalid or expired.
    #[error("reauthentication required: {reason}")]
    ReauthenticationRequired { reason: String },
    /// The provider itself is misconfigured; never retried.
    #[error("token provider failure: {0}")]
    Provider(#[from] AuthError),
}

/// Produces a fresh access credential for a reconnect attempt.
pub trait CredentialRefresher: Send + Sync + 'static {
    fn refresh(&self) -> impl Future<Output = Result<Credential, RefreshError>> + Send;
}

/// Holds the current credential pair. Cleared on failed rotation.
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    inner: Arc<Mutex<Option<CredentialPair>>>,
}

impl TokenStore {
    pub fn new(pair: CredentialPair) -> Self {
        Self { inner: Arc::new(Mutex::new(Some(pair))) }
    }

    pub fn current(&self) -> Option<CredentialPair> {
        self.lock().clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.lock().as_ref().map(|pair| pair.refresh.token.clone())
    }

    pub fn replace(&self, pair: CredentialPair) {
        *self.lock() = Some(pair);
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<CredentialPair>> {
        // A poisoned store still holds a usable value.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Rotates credentials through a local [`TokenProvider`]. Used by bots and
/// fleet members, which hold the signing secret themselves.
#[derive(Debug, Clone)]
pub struct LocalRefresher {
    provider: Arc<TokenProvider>,
    store: TokenStore,
}

impl LocalRefresher {
    pub fn new(provider: Arc<TokenProvider>, store: TokenStore) -> Self {
        Self { provider, store }
    }

    /// Issue an initial pair for `subject` and wrap it in a refresher.
    pub fn for_subject(
        provider: Arc<TokenProvider>,
        subject: &str,
    ) -> Result<(Credential, Self), AuthError> {
        let pair = provider.issue_pair(subject)?;
        let access = pair.access.clone();
        Ok((access, Self::new(provider, TokenStore::new(pair))))
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }
}

impl CredentialRefresher for LocalRefresher {
    async fn refresh(&self) -> Result<Credential, RefreshError> {
        let Some(refresh_token) = self.store.refresh_token() else {
            return Err(RefreshError::ReauthenticationRequired {
                reason: "no refresh credential stored".to_string(),
            });
        };

        match self.provider.refresh(&refresh_token) {
            Ok(pair) => {
                let access = pair.access.clone();
                self.store.replace(pair);
                debug!(subject = %access.subject, "credential rotated locally");
                Ok(access)
            }
            Err(error @ (AuthError::MissingSecret | AuthError::Clock)) => {
                Err(RefreshError::Provider(error))
            }
            Err(error) => {
                self.store.clear();
                warn!(%error, "refresh credential rejected, store cleared");
                Err(RefreshError::ReauthenticationRequired { reason: error.to_string() })
            }
        }
    }
}

/// Rotates credentials through the user service's re-issuance endpoint.
#[derive(Debug, Clone)]
pub struct HttpRefresher {
    http: reqwest::Client,
    endpoint: String,
    store: TokenStore,
}

impl HttpRefresher {
    pub fn new(base_url: &str, store: TokenStore) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, store)
    }

    pub fn with_client(http: reqwest::Client, base_url: &str, store: TokenStore) -> Self {
        let endpoint = format!("{}{REISSUE_PATH}", base_url.trim_end_matches('/'));
        Self { http, endpoint, store }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn reissue(&self, refresh_token: String) -> Result<TokenReissueResponse, String> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&TokenReissueRequest { refresh_token })
            .send()
            .await
            .map_err(|error| format!("reissue request failed: {error}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("reissue rejected with status {status}"));
        }

        response
            .json::<TokenReissueResponse>()
            .await
            .map_err(|error| format!("reissue response was not understood: {error}"))
    }
}

impl CredentialRefresher for HttpRefresher {
    async fn refresh(&self) -> Result<Credential, RefreshError> {
        let Some(current) = self.store.current() else {
            return Err(RefreshError::ReauthenticationRequired {
                reason: "no refresh credential stored".to_string(),
            });
        };

        match self.reissue(current.refresh.token.clone()).await {
            Ok(tokens) => {
                // The service does not echo lifetimes; keep the subject and
                // assume a full access lifetime from now.
                let now = super::token::current_unix_timestamp()?;
                let access = Credential {
                    subject: current.access.subject.clone(),
                    issued_at: now,
                    expires_at: now + super::token::ACCESS_TOKEN_TTL_SECONDS,
                    token: tokens.access_token,
                };
                let refresh = Credential {
                    subject: current.refresh.subject,
                    issued_at: now,
                    expires_at: now + super::token::REFRESH_TOKEN_TTL_SECONDS,
                    token: tokens.refresh_token,
                };
                self.store.replace(CredentialPair { access: access.clone(), refresh });
                debug!(endpoint = %self.endpoint, "credential reissued");
                Ok(access)
            }
            Err(reason) => {
                self.store.clear();
                warn!(endpoint = %self.endpoint, %reason, "token reissue failed, store cleared");
                Err(RefreshError::ReauthenticationRequired { reason })
            }
        }
    }
}
