//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP agent connector linking attributes to upstream endpoints."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Typed agent and link configuration.
//!
//! Everything is validated once, when an agent starts or an attribute is linked, so
//! the polling hot path never has to re-check configuration.

use std::collections::BTreeSet;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::formats::PreferMany;
use serde_with::{serde_as, DurationMilliSeconds, OneOrMany};
use url::Url;

use crate::attribute::AttributeRef;
use crate::error::ConfigError;

/// Content type used for request bodies when none is configured.
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";
/// Polling floor applied when the agent does not configure one.
pub const DEFAULT_MIN_POLLING_INTERVAL: Duration = Duration::from_millis(5_000);
/// Heartbeat cadence when the heartbeat block omits an interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(60_000);
/// Lowest accepted heartbeat cadence.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10_000);

/// Header or query parameter map: name to one or more values.
pub type MultiValueMap = IndexMap<String, Vec<String>>;
/// Link-level header map; a `None` value removes the inherited agent header.
pub type HeaderOverrides = IndexMap<String, Option<Vec<String>>>;

fn default_request_timeout() -> Duration {
    Duration::from_millis(10_000)
}

fn default_max_concurrent_requests() -> usize {
    10
}

fn default_min_polling_interval() -> Duration {
    DEFAULT_MIN_POLLING_INTERVAL
}

fn default_max_pages() -> usize {
    100
}

fn default_heartbeat_interval() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
}

/// HTTP verbs supported by request templates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    /// Convert into the transport's method type.
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }

    pub fn is_get(&self) -> bool {
        matches!(self, HttpMethod::Get)
    }
}

/// How response bodies are turned into attribute values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageDecoding {
    /// UTF-8 text.
    #[default]
    Text,
    /// Upper-case hex string of the raw bytes.
    Hex,
    /// String of `0`/`1` digits, eight per byte.
    Binary,
}

/// OAuth2 grant flavours accepted by the token endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    ClientCredentials,
    Password,
    RefreshToken,
}

impl GrantKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantKind::ClientCredentials => "client_credentials",
            GrantKind::Password => "password",
            GrantKind::RefreshToken => "refresh_token",
        }
    }
}

/// OAuth2 grant used to obtain access tokens.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthGrant {
    pub token_endpoint_uri: String,
    pub grant_type: GrantKind,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Send client credentials as an HTTP Basic header instead of form fields.
    #[serde(default)]
    pub basic_auth_header: bool,
    #[serde(default)]
    #[serde_as(as = "IndexMap<_, OneOrMany<_, PreferMany>>")]
    pub additional_values: MultiValueMap,
}

impl OAuthGrant {
    /// Client credentials grant helper.
    pub fn client_credentials(
        token_endpoint_uri: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            token_endpoint_uri: token_endpoint_uri.into(),
            grant_type: GrantKind::ClientCredentials,
            client_id: Some(client_id.into()),
            client_secret: Some(client_secret.into()),
            scope: None,
            username: None,
            password: None,
            refresh_token: None,
            basic_auth_header: false,
            additional_values: MultiValueMap::new(),
        }
    }

    /// Parsed token endpoint.
    pub fn token_endpoint(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.token_endpoint_uri).map_err(|err| {
            ConfigError::InvalidAuth(format!(
                "token endpoint '{}' is invalid: {err}",
                self.token_endpoint_uri
            ))
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.token_endpoint()?;
        match self.grant_type {
            GrantKind::ClientCredentials => Ok(()),
            GrantKind::Password => {
                if self.username.as_deref().unwrap_or("").is_empty() || self.password.is_none() {
                    return Err(ConfigError::InvalidAuth(
                        "password grant requires username and password".into(),
                    ));
                }
                Ok(())
            }
            GrantKind::RefreshToken => {
                if self.refresh_token.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::InvalidAuth(
                        "refresh_token grant requires a refresh token".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Authentication applied to every upstream request of an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    #[serde(rename = "oauth")]
    OAuth(OAuthGrant),
}

impl AuthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            AuthConfig::None => Ok(()),
            AuthConfig::Basic { username, .. } => {
                if username.trim().is_empty() {
                    return Err(ConfigError::InvalidAuth(
                        "basic authentication requires a username".into(),
                    ));
                }
                Ok(())
            }
            AuthConfig::OAuth(grant) => grant.validate(),
        }
    }
}

/// Dedicated lightweight request that owns the connection status when configured.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    #[serde_as(as = "IndexMap<_, Option<OneOrMany<_, PreferMany>>>")]
    pub headers: HeaderOverrides,
    #[serde(default)]
    #[serde_as(as = "IndexMap<_, OneOrMany<_, PreferMany>>")]
    pub query_parameters: MultiValueMap,
    #[serde(rename = "interval_ms", default = "default_heartbeat_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            path: None,
            method: HttpMethod::Get,
            body: None,
            content_type: None,
            headers: HeaderOverrides::new(),
            query_parameters: MultiValueMap::new(),
            interval: default_heartbeat_interval(),
        }
    }
}

impl HeartbeatConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval < MIN_HEARTBEAT_INTERVAL {
            return Err(ConfigError::InvalidHeartbeat(format!(
                "interval must be at least {} ms",
                MIN_HEARTBEAT_INTERVAL.as_millis()
            )));
        }
        Ok(())
    }

    /// View the heartbeat as a link so it can share the template builder.
    pub fn as_link(&self) -> AttributeLinkConfig {
        AttributeLinkConfig {
            path: self.path.clone(),
            method: self.method,
            content_type: self.content_type.clone(),
            headers: self.headers.clone(),
            query_parameters: self.query_parameters.clone(),
            polling_interval: Some(self.interval),
            write_value: self.body.clone(),
            ..AttributeLinkConfig::default()
        }
    }
}

/// Shared connection configuration for one upstream endpoint.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub base_uri: Option<String>,
    #[serde(default)]
    pub follow_redirects: bool,
    #[serde(rename = "request_timeout_ms", default = "default_request_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default)]
    #[serde_as(as = "IndexMap<_, OneOrMany<_, PreferMany>>")]
    pub headers: MultiValueMap,
    #[serde(default)]
    #[serde_as(as = "IndexMap<_, OneOrMany<_, PreferMany>>")]
    pub query_parameters: MultiValueMap,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Response codes that permanently disable the agent.
    #[serde(default)]
    pub failure_codes: BTreeSet<u16>,
    /// Overrides every link's decoding mode when set.
    #[serde(default)]
    pub message_decoding: Option<MessageDecoding>,
    #[serde(
        rename = "min_polling_interval_ms",
        default = "default_min_polling_interval"
    )]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_polling_interval: Duration,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default)]
    pub heartbeat: Option<HeartbeatConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_uri: None,
            follow_redirects: false,
            request_timeout: default_request_timeout(),
            max_concurrent_requests: default_max_concurrent_requests(),
            headers: MultiValueMap::new(),
            query_parameters: MultiValueMap::new(),
            auth: AuthConfig::None,
            failure_codes: BTreeSet::new(),
            message_decoding: None,
            min_polling_interval: default_min_polling_interval(),
            max_pages: default_max_pages(),
            heartbeat: None,
        }
    }
}

impl AgentConfig {
    /// Minimal configuration targeting `base_uri`.
    pub fn new(base_uri: impl Into<String>) -> Self {
        Self {
            base_uri: Some(base_uri.into()),
            ..Self::default()
        }
    }

    /// Parsed base URI with any trailing slash removed.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let raw = self
            .base_uri
            .as_deref()
            .map(str::trim)
            .filter(|uri| !uri.is_empty())
            .ok_or(ConfigError::MissingBaseUri)?;
        let trimmed = raw.strip_suffix('/').unwrap_or(raw);
        let url = Url::parse(trimmed).map_err(|err| ConfigError::InvalidBaseUri {
            uri: raw.to_owned(),
            reason: err.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidBaseUri {
                uri: raw.to_owned(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        Ok(url)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.base_url()?;
        self.auth.validate()?;
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrent_requests",
                reason: "must be greater than zero".into(),
            });
        }
        if self.max_pages == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_pages",
                reason: "must be greater than zero".into(),
            });
        }
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.validate()?;
        }
        Ok(())
    }
}

impl std::str::FromStr for AgentConfig {
    type Err = ConfigError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

/// Per-attribute request configuration.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AttributeLinkConfig {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    #[serde_as(as = "IndexMap<_, Option<OneOrMany<_, PreferMany>>>")]
    pub headers: HeaderOverrides,
    #[serde(default)]
    #[serde_as(as = "IndexMap<_, OneOrMany<_, PreferMany>>")]
    pub query_parameters: MultiValueMap,
    #[serde(rename = "polling_interval_ms", default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub polling_interval: Option<Duration>,
    #[serde(default)]
    pub paging_enabled: bool,
    /// Attribute on the same entity whose response this link receives.
    #[serde(default)]
    pub polling_attribute: Option<String>,
    /// Body template sent with non-GET requests.
    #[serde(default)]
    pub write_value: Option<String>,
    #[serde(default)]
    pub failure_codes: BTreeSet<u16>,
    #[serde(default)]
    pub message_decoding: MessageDecoding,
}

impl AttributeLinkConfig {
    /// Link polling `path` every `interval`.
    pub fn polling(path: impl Into<String>, interval: Duration) -> Self {
        Self {
            path: Some(path.into()),
            polling_interval: Some(interval),
            ..Self::default()
        }
    }

    /// Link that only issues requests on attribute writes.
    pub fn command(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            method,
            ..Self::default()
        }
    }

    /// Link that receives the response polled by `source` on the same entity.
    pub fn shared(source: impl Into<String>) -> Self {
        Self {
            polling_attribute: Some(source.into()),
            ..Self::default()
        }
    }

    /// Polling source ref, if this link piggybacks on another attribute.
    pub fn polling_source(&self, attribute: &AttributeRef) -> Option<AttributeRef> {
        self.polling_attribute
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| attribute.sibling(name))
    }

    pub fn validate(&self, attribute: &AttributeRef) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidLink {
            attribute: attribute.clone(),
            reason: reason.to_owned(),
        };
        if let Some(source) = self.polling_source(attribute) {
            if &source == attribute {
                return Err(invalid("polling_attribute cannot reference itself"));
            }
            if self.polling_interval.is_some() {
                return Err(invalid(
                    "polling_interval_ms and polling_attribute are mutually exclusive",
                ));
            }
        }
        if matches!(self.polling_interval, Some(interval) if interval.is_zero()) {
            return Err(invalid("polling_interval_ms must be greater than zero"));
        }
        Ok(())
    }

    /// Decoding mode after applying the agent-level override.
    pub fn effective_decoding(&self, agent: &AgentConfig) -> MessageDecoding {
        agent.message_decoding.unwrap_or(self.message_decoding)
    }

    /// Agent and link failure codes combined.
    pub fn effective_failure_codes(&self, agent: &AgentConfig) -> BTreeSet<u16> {
        agent
            .failure_codes
            .union(&self.failure_codes)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_agent_from_toml() {
        let config: AgentConfig = r#"
            base_uri = "https://api.example.com/v1/"
            follow_redirects = true
            request_timeout_ms = 2500
            failure_codes = [410, 451]

            [headers]
            accept = "application/json"
            x-trace = ["a", "b"]

            [query_parameters]
            site = "north"

            [auth]
            type = "oauth"
            token_endpoint_uri = "https://auth.example.com/token"
            grant_type = "client_credentials"
            client_id = "ems"
            client_secret = "secret"

            [heartbeat]
            path = "health"
            interval_ms = 30000
        "#
        .parse()
        .unwrap();

        assert_eq!(config.base_url().unwrap().as_str(), "https://api.example.com/v1");
        assert_eq!(config.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.headers["accept"], vec!["application/json"]);
        assert_eq!(config.headers["x-trace"], vec!["a", "b"]);
        assert!(config.failure_codes.contains(&451));
        assert!(matches!(
            config.auth,
            AuthConfig::OAuth(ref grant) if grant.grant_type == GrantKind::ClientCredentials
        ));
        assert_eq!(
            config.heartbeat.as_ref().unwrap().interval,
            Duration::from_secs(30)
        );
        assert_eq!(config.min_polling_interval, DEFAULT_MIN_POLLING_INTERVAL);
    }

    #[test]
    fn rejects_missing_or_invalid_base_uri() {
        assert!(matches!(
            AgentConfig::default().validate(),
            Err(ConfigError::MissingBaseUri)
        ));
        assert!(matches!(
            AgentConfig::new("not a uri").validate(),
            Err(ConfigError::InvalidBaseUri { .. })
        ));
        assert!(matches!(
            AgentConfig::new("ftp://files.example.com").validate(),
            Err(ConfigError::InvalidBaseUri { .. })
        ));
    }

    #[test]
    fn rejects_malformed_auth() {
        let mut config = AgentConfig::new("http://localhost:8080");
        config.auth = AuthConfig::Basic {
            username: " ".into(),
            password: "pw".into(),
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidAuth(_))));

        let mut grant = OAuthGrant::client_credentials("::bad::", "id", "secret");
        config.auth = AuthConfig::OAuth(grant.clone());
        assert!(matches!(config.validate(), Err(ConfigError::InvalidAuth(_))));

        grant.token_endpoint_uri = "http://localhost/token".into();
        grant.grant_type = GrantKind::Password;
        config.auth = AuthConfig::OAuth(grant);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidAuth(_))));
    }

    #[test]
    fn rejects_fast_heartbeat() {
        let mut config = AgentConfig::new("http://localhost:8080");
        config.heartbeat = Some(HeartbeatConfig {
            interval: Duration::from_millis(500),
            ..HeartbeatConfig::default()
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidHeartbeat(_))
        ));
    }

    #[test]
    fn link_header_null_is_preserved() {
        let link: AttributeLinkConfig = serde_json::from_value(serde_json::json!({
            "path": "meters/{$value}",
            "headers": { "accept": null, "x-extra": "1" },
            "polling_interval_ms": 1000
        }))
        .unwrap();
        assert_eq!(link.headers["accept"], None);
        assert_eq!(link.headers["x-extra"], Some(vec!["1".to_string()]));
        assert_eq!(link.polling_interval, Some(Duration::from_secs(1)));
    }

    #[test]
    fn link_validation_catches_conflicts() {
        let attr = AttributeRef::new("meter-1", "power");
        let mut link = AttributeLinkConfig::shared("power");
        assert!(link.validate(&attr).is_err());

        link.polling_attribute = Some("raw".into());
        link.polling_interval = Some(Duration::from_secs(5));
        assert!(link.validate(&attr).is_err());

        link.polling_interval = None;
        assert!(link.validate(&attr).is_ok());
        assert_eq!(
            link.polling_source(&attr),
            Some(AttributeRef::new("meter-1", "raw"))
        );
    }

    #[test]
    fn agent_overrides_link_decoding_and_failure_codes_merge() {
        let mut agent = AgentConfig::new("http://localhost");
        agent.failure_codes = [410].into_iter().collect();
        let mut link = AttributeLinkConfig::polling("x", Duration::from_secs(5));
        link.message_decoding = MessageDecoding::Hex;
        link.failure_codes = [451].into_iter().collect();

        assert_eq!(link.effective_decoding(&agent), MessageDecoding::Hex);
        agent.message_decoding = Some(MessageDecoding::Binary);
        assert_eq!(link.effective_decoding(&agent), MessageDecoding::Binary);
        assert_eq!(
            link.effective_failure_codes(&agent).into_iter().collect::<Vec<_>>(),
            vec![410, 451]
        );
    }
}
