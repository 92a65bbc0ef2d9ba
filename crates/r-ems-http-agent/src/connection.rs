//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP agent connector linking attributes to upstream endpoints."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::redirect::Policy;
use reqwest::{Client, Method, RequestBuilder};
use tokio::sync::Semaphore;
use tracing::debug;
use url::Url;

use crate::config::AgentConfig;
use crate::error::{ConfigError, TransportError};

/// Idle connections kept per upstream host by the shared pool.
pub const CONNECTION_POOL_SIZE: usize = 10;
const MAX_REDIRECTS: usize = 10;

/// Pooled transport shared by every agent. Cloning is cheap and shares the pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    following: Client,
    direct: Client,
}

impl HttpTransport {
    /// Build both redirect flavours of the pooled client.
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            following: build_client(Policy::limited(MAX_REDIRECTS))?,
            direct: build_client(Policy::none())?,
        })
    }

    /// Client honouring the requested redirect policy.
    pub fn client(&self, follow_redirects: bool) -> &Client {
        if follow_redirects {
            &self.following
        } else {
            &self.direct
        }
    }
}

fn build_client(policy: Policy) -> Result<Client, ConfigError> {
    Client::builder()
        .redirect(policy)
        .pool_max_idle_per_host(CONNECTION_POOL_SIZE)
        .build()
        .map_err(ConfigError::Transport)
}

/// Body of a response, or the ordered page bodies when pagination ran.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Bytes(Bytes),
    Pages(Vec<Bytes>),
}

impl ResponseBody {
    fn from_bytes(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            ResponseBody::Empty
        } else {
            ResponseBody::Bytes(bytes)
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ResponseBody::Empty => true,
            ResponseBody::Bytes(bytes) => bytes.is_empty(),
            ResponseBody::Pages(pages) => pages.is_empty(),
        }
    }

    /// Raw bytes of a single-page body.
    pub fn bytes(&self) -> Bytes {
        match self {
            ResponseBody::Bytes(bytes) => bytes.clone(),
            _ => Bytes::new(),
        }
    }
}

/// Fully read upstream response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    /// Final URL after redirects; `None` for synthetic responses.
    pub url: Option<Url>,
}

impl HttpResponse {
    /// Response standing in for a failed call.
    pub fn synthetic(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
            url: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One agent's view of the shared transport.
#[derive(Debug)]
pub struct Connection {
    client: Client,
    base_url: Url,
    follow_redirects: bool,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl Connection {
    /// Bind the shared transport to a validated agent configuration.
    pub fn new(transport: &HttpTransport, config: &AgentConfig) -> Result<Self, ConfigError> {
        let base_url = config.base_url()?;
        debug!(
            base_url = %base_url,
            follow_redirects = config.follow_redirects,
            "creating connection"
        );
        Ok(Self {
            client: transport.client(config.follow_redirects).clone(),
            base_url,
            follow_redirects: config.follow_redirects,
            timeout: config.request_timeout,
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests)),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn follow_redirects(&self) -> bool {
        self.follow_redirects
    }

    /// Shared client; used for token requests which bypass the request queue.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Resolve a relative path (optionally carrying a query string) against the base URI.
    pub fn resolve(&self, path: &str) -> Result<Url, TransportError> {
        let (path_part, query_part) = path.split_once('?').unwrap_or((path, ""));
        let mut url = self.base_url.clone();
        if url.cannot_be_a_base() {
            return Err(TransportError::InvalidUrl(path.to_owned()));
        }
        if !path_part.is_empty() {
            let joined = format!("{}/{}", url.path().trim_end_matches('/'), path_part);
            url.set_path(&joined);
        }
        if !query_part.is_empty() {
            let combined = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{query_part}"),
                _ => query_part.to_owned(),
            };
            url.set_query(Some(&combined));
        }
        Ok(url)
    }

    /// Start a request with the agent timeout applied.
    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client.request(method, url).timeout(self.timeout)
    }

    /// Send a request once a slot is free and read the body to completion.
    pub async fn execute(&self, request: RequestBuilder) -> Result<HttpResponse, TransportError> {
        let request = request
            .build()
            .map_err(|err| TransportError::from_reqwest("<unbuilt request>", err))?;
        let url = request.url().to_string();
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::Closed)?;

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|err| TransportError::from_reqwest(&url, err))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let final_url = response.url().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError::from_reqwest(&url, err))?;

        Ok(HttpResponse {
            status,
            headers,
            body: ResponseBody::from_bytes(body),
            url: Some(final_url),
        })
    }

    /// Reject queued and future requests.
    pub fn close(&self) {
        self.permits.close();
    }
}
