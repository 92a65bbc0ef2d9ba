//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP agent connector linking attributes to upstream endpoints."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! HTTP agent connector for R-EMS.
//!
//! An agent describes one upstream HTTP endpoint (base URI, authentication, default
//! headers). Attributes linked to the agent are polled on a fixed delay, written through
//! request templates, or share the response polled for another attribute. Connection
//! health is published as a [`ConnectionStatus`] and configured failure codes disable the
//! agent until an operator re-enables it.

pub mod attribute;
pub mod auth;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod metrics;
pub mod pagination;
pub mod placeholder;
pub mod router;
pub mod scheduler;
pub mod status;
pub mod template;

pub use attribute::{AttributeRef, AttributeStore, InMemoryAttributeStore, StoredValue};
pub use auth::{AuthProvider, BasicAuthProvider, OAuthTokenProvider, OAuthTokenState};
pub use config::{
    AgentConfig, AttributeLinkConfig, AuthConfig, GrantKind, HeartbeatConfig, HttpMethod,
    MessageDecoding, OAuthGrant,
};
pub use connection::{Connection, HttpResponse, HttpTransport, ResponseBody};
pub use connector::{ConnectorOptions, HttpConnector};
pub use error::{ConfigError, DecodeError, HttpAgentError, TokenError, TransportError};
pub use metrics::{new_registry, HttpAgentMetrics, RequestKind, SharedRegistry};
pub use pagination::PaginationWalker;
pub use placeholder::{PlaceholderFlags, PlaceholderInjector};
pub use router::{PollingSourceMap, ResponseRouter, RouteOutcome};
pub use scheduler::{PollTarget, PollingScheduler, TickControl};
pub use status::{map_status, ConnectionStatus, HttpStatusMapper, StatusMapper};
pub use template::RequestTemplate;
