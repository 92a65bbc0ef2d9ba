//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP agent connector linking attributes to upstream endpoints."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Authorization header providers: fixed basic credentials and OAuth2 bearer tokens.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::HeaderValue;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::config::{AuthConfig, GrantKind, OAuthGrant};
use crate::error::{ConfigError, TokenError};
use crate::metrics::HttpAgentMetrics;

/// Tokens expiring within this window are renewed before use.
pub const TOKEN_EXPIRY_GRACE: Duration = Duration::from_secs(10);

/// Supplies the `Authorization` header for upstream requests.
#[async_trait]
pub trait AuthProvider: Send + Sync + fmt::Debug {
    /// Header to attach, or `None` when no credential is currently available.
    async fn authorization(&self) -> Option<HeaderValue>;
}

/// Build the provider described by `config`; `None` for unauthenticated agents.
pub fn build_auth_provider(
    agent_id: &str,
    config: &AuthConfig,
    client: Client,
    timeout: Duration,
    metrics: Option<HttpAgentMetrics>,
) -> Result<Option<Arc<dyn AuthProvider>>, ConfigError> {
    let provider: Arc<dyn AuthProvider> = match config {
        AuthConfig::None => return Ok(None),
        AuthConfig::Basic { username, password } => {
            Arc::new(BasicAuthProvider::new(username, password)?)
        }
        AuthConfig::OAuth(grant) => {
            let mut provider = OAuthTokenProvider::new(agent_id, grant.clone(), client, timeout)?;
            if let Some(metrics) = metrics {
                provider = provider.with_metrics(metrics);
            }
            Arc::new(provider)
        }
    };
    Ok(Some(provider))
}

/// Attaches the same basic credentials to every request.
#[derive(Debug, Clone)]
pub struct BasicAuthProvider {
    header: HeaderValue,
}

impl BasicAuthProvider {
    pub fn new(username: &str, password: &str) -> Result<Self, ConfigError> {
        let encoded = STANDARD.encode(format!("{username}:{password}"));
        let mut header = HeaderValue::from_str(&format!("Basic {encoded}"))
            .map_err(|err| ConfigError::InvalidAuth(err.to_string()))?;
        header.set_sensitive(true);
        Ok(Self { header })
    }
}

#[async_trait]
impl AuthProvider for BasicAuthProvider {
    async fn authorization(&self) -> Option<HeaderValue> {
        Some(self.header.clone())
    }
}

/// Cached OAuth2 session.
#[derive(Debug, Clone, PartialEq)]
pub struct OAuthTokenState {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// `None` means the token does not expire.
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthTokenState {
    /// True when the token is usable beyond the grace window.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let grace = ChronoDuration::milliseconds(TOKEN_EXPIRY_GRACE.as_millis() as i64);
        match self.expires_at {
            None => true,
            Some(expires_at) => expires_at > now + grace,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl TokenResponse {
    fn into_state(self, previous_refresh: Option<String>) -> OAuthTokenState {
        OAuthTokenState {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: self.expires_in.and_then(expiry_after),
        }
    }
}

/// Expiry `seconds` from now; `None` (never expires) when the instant is unrepresentable.
fn expiry_after(seconds: i64) -> Option<DateTime<Utc>> {
    let expiry = ChronoDuration::try_seconds(seconds)
        .and_then(|lifetime| Utc::now().checked_add_signed(lifetime));
    if expiry.is_none() {
        warn!(expires_in = seconds, "token lifetime out of range; treating as non-expiring");
    }
    expiry
}

/// OAuth2 bearer token provider with caching and refresh.
///
/// All callers share one async mutex, so concurrent ticks never issue duplicate token
/// requests. A refresh answered with 403 discards the session and performs exactly one
/// full grant; any other failure clears the cache and yields no header.
pub struct OAuthTokenProvider {
    agent_id: String,
    grant: OAuthGrant,
    endpoint: Url,
    client: Client,
    timeout: Duration,
    state: Mutex<Option<OAuthTokenState>>,
    metrics: Option<HttpAgentMetrics>,
}

impl OAuthTokenProvider {
    pub fn new(
        agent_id: impl Into<String>,
        grant: OAuthGrant,
        client: Client,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        grant.validate()?;
        let endpoint = grant.token_endpoint()?;
        Ok(Self {
            agent_id: agent_id.into(),
            grant,
            endpoint,
            client,
            timeout,
            state: Mutex::new(None),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: HttpAgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Seed the cache, e.g. with a persisted session.
    pub async fn prime(&self, state: OAuthTokenState) {
        *self.state.lock().await = Some(state);
    }

    /// Snapshot of the cached session.
    pub async fn token_state(&self) -> Option<OAuthTokenState> {
        self.state.lock().await.clone()
    }

    async fn update_token(&self, slot: &mut Option<OAuthTokenState>) {
        let cached_refresh = slot.as_ref().and_then(|state| state.refresh_token.clone());
        if let Some(refresh_token) = cached_refresh {
            match self
                .request_token(GrantKind::RefreshToken, Some(&refresh_token))
                .await
            {
                Ok(response) => {
                    *slot = Some(response.into_state(Some(refresh_token)));
                    return;
                }
                Err(TokenError::Rejected(403)) => {
                    warn!(agent = %self.agent_id, "refresh token rejected; requesting a new grant");
                    *slot = None;
                }
                Err(err) => {
                    warn!(agent = %self.agent_id, error = %err, "token refresh failed");
                    *slot = None;
                    return;
                }
            }
        }

        let configured_refresh = self.grant.refresh_token.clone();
        match self
            .request_token(self.grant.grant_type, configured_refresh.as_deref())
            .await
        {
            Ok(response) => *slot = Some(response.into_state(configured_refresh)),
            Err(err) => {
                warn!(agent = %self.agent_id, error = %err, "token grant failed");
                *slot = None;
            }
        }
    }

    async fn request_token(
        &self,
        kind: GrantKind,
        refresh_token: Option<&str>,
    ) -> Result<TokenResponse, TokenError> {
        debug!(agent = %self.agent_id, grant = kind.as_str(), "requesting access token");
        let result = self.send_token_request(kind, refresh_token).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_token_request(&self.agent_id, kind, result.is_ok());
        }
        result
    }

    async fn send_token_request(
        &self,
        kind: GrantKind,
        refresh_token: Option<&str>,
    ) -> Result<TokenResponse, TokenError> {
        let grant = &self.grant;
        let mut form: Vec<(&str, &str)> = vec![("grant_type", kind.as_str())];
        match kind {
            GrantKind::ClientCredentials => {}
            GrantKind::Password => {
                form.push(("username", grant.username.as_deref().unwrap_or_default()));
                form.push(("password", grant.password.as_deref().unwrap_or_default()));
            }
            GrantKind::RefreshToken => {
                form.push(("refresh_token", refresh_token.unwrap_or_default()));
            }
        }
        if let Some(scope) = grant.scope.as_deref() {
            form.push(("scope", scope));
        }
        for (name, values) in &grant.additional_values {
            for value in values {
                form.push((name.as_str(), value.as_str()));
            }
        }

        let mut request = self.client.post(self.endpoint.clone()).timeout(self.timeout);
        if grant.basic_auth_header {
            request = request.basic_auth(
                grant.client_id.as_deref().unwrap_or_default(),
                grant.client_secret.as_deref(),
            );
        } else {
            if let Some(client_id) = grant.client_id.as_deref() {
                form.push(("client_id", client_id));
            }
            if let Some(client_secret) = grant.client_secret.as_deref() {
                form.push(("client_secret", client_secret));
            }
        }

        let response = request.form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TokenError::Rejected(status.as_u16()));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| TokenError::Malformed(err.to_string()))?;
        if token.access_token.is_empty() {
            return Err(TokenError::Malformed("empty access_token".into()));
        }
        Ok(token)
    }
}

impl fmt::Debug for OAuthTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthTokenProvider")
            .field("agent_id", &self.agent_id)
            .field("endpoint", &self.endpoint.as_str())
            .field("grant_type", &self.grant.grant_type)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthProvider for OAuthTokenProvider {
    async fn authorization(&self) -> Option<HeaderValue> {
        let mut slot = self.state.lock().await;
        let fresh = slot
            .as_ref()
            .is_some_and(|state| state.is_fresh(Utc::now()));
        if !fresh {
            self.update_token(&mut slot).await;
        }
        let token = slot.as_ref()?;
        let mut header = HeaderValue::from_str(&format!("Bearer {}", token.access_token)).ok()?;
        header.set_sensitive(true);
        Some(header)
    }
}
