//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP agent connector linking attributes to upstream endpoints."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use thiserror::Error;

use crate::attribute::AttributeRef;

/// Invalid agent or link configuration. The only error class allowed to abort agent start.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Agent configuration did not provide a base URI.
    #[error("missing base URI")]
    MissingBaseUri,
    /// Base URI could not be parsed or uses an unsupported scheme.
    #[error("invalid base URI '{uri}': {reason}")]
    InvalidBaseUri {
        /// Offending value.
        uri: String,
        /// Parser feedback.
        reason: String,
    },
    /// Authentication block is incomplete or malformed.
    #[error("invalid authentication configuration: {0}")]
    InvalidAuth(String),
    /// Heartbeat block is invalid.
    #[error("invalid heartbeat configuration: {0}")]
    InvalidHeartbeat(String),
    /// Attribute link configuration is invalid.
    #[error("invalid link for attribute {attribute}: {reason}")]
    InvalidLink {
        /// Attribute being linked.
        attribute: AttributeRef,
        /// Validation feedback.
        reason: String,
    },
    /// Configuration value outside its permitted range.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Configuration field name.
        field: &'static str,
        /// Validation feedback.
        reason: String,
    },
    /// Configuration text could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// Shared transport could not be created.
    #[error("failed to build http transport: {0}")]
    Transport(#[source] reqwest::Error),
}

/// Failure talking to the upstream server; always treated as a synthetic 500 by ticks.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request exceeded the configured timeout.
    #[error("request to {url} timed out")]
    Timeout {
        /// Target URL.
        url: String,
    },
    /// Connection, DNS or protocol failure.
    #[error("request to {url} failed: {source}")]
    Request {
        /// Target URL.
        url: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },
    /// A path or link could not be turned into a URL.
    #[error("invalid request url '{0}'")]
    InvalidUrl(String),
    /// A header produced by substitution is not a valid header value.
    #[error("invalid header '{0}'")]
    InvalidHeader(String),
    /// The connection's request queue has been closed.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    pub(crate) fn from_reqwest(url: &str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            TransportError::Timeout {
                url: url.to_owned(),
            }
        } else {
            TransportError::Request {
                url: url.to_owned(),
                source,
            }
        }
    }
}

/// Token endpoint failures. Surfaced to callers only as an absent auth header.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Token endpoint answered with a non-success status.
    #[error("token endpoint rejected the request with status {0}")]
    Rejected(u16),
    /// Token endpoint body did not contain an access token.
    #[error("malformed token response: {0}")]
    Malformed(String),
    /// Token endpoint could not be reached.
    #[error("token request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Errors returned from connector entry points.
#[derive(Debug, Error)]
pub enum HttpAgentError {
    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Upstream call failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Attribute is not linked to this agent.
    #[error("attribute {0} is not linked")]
    NotLinked(AttributeRef),
    /// Agent has been disabled after a permanent failure.
    #[error("agent '{0}' is disabled")]
    Disabled(String),
    /// Agent has been stopped.
    #[error("agent '{0}' is stopped")]
    Stopped(String),
}

/// Response body could not be decoded into an attribute value.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Text decoding was requested but the body is not UTF-8.
    #[error("response body is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}
