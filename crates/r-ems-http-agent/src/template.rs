//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP agent connector linking attributes to upstream endpoints."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;

use crate::auth::AuthProvider;
use crate::config::{
    AgentConfig, AttributeLinkConfig, HttpMethod, MessageDecoding, MultiValueMap,
    DEFAULT_CONTENT_TYPE,
};
use crate::connection::{Connection, HttpResponse};
use crate::error::{ConfigError, TransportError};
use crate::placeholder::{stringify_value, PlaceholderFlags, PlaceholderInjector};

/// Immutable request description built once per link.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    method: HttpMethod,
    path: String,
    content_type: HeaderValue,
    headers: Vec<(HeaderName, Vec<String>)>,
    query: Vec<(String, Vec<String>)>,
    body: Option<String>,
    flags: PlaceholderFlags,
    paging_enabled: bool,
    decoding: MessageDecoding,
    failure_codes: BTreeSet<u16>,
}

impl RequestTemplate {
    /// Merge agent defaults with link overrides and pre-scan for placeholders.
    pub fn build(agent: &AgentConfig, link: &AttributeLinkConfig) -> Result<Self, ConfigError> {
        let mut merged: IndexMap<String, Vec<String>> = agent
            .headers
            .iter()
            .map(|(name, values)| (name.to_ascii_lowercase(), values.clone()))
            .collect();
        for (name, values) in &link.headers {
            let name = name.to_ascii_lowercase();
            match values {
                None => {
                    merged.shift_remove(&name);
                }
                Some(values) => merged.entry(name).or_default().extend(values.iter().cloned()),
            }
        }
        let headers = merged
            .into_iter()
            .map(|(name, values)| {
                HeaderName::from_bytes(name.as_bytes())
                    .map(|header| (header, values))
                    .map_err(|err| ConfigError::InvalidValue {
                        field: "headers",
                        reason: format!("'{name}': {err}"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let query = merge_query(&agent.query_parameters, &link.query_parameters);

        let content_type = link
            .content_type
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        let content_type =
            HeaderValue::from_str(content_type).map_err(|err| ConfigError::InvalidValue {
                field: "content_type",
                reason: err.to_string(),
            })?;

        let raw_path = link.path.as_deref().unwrap_or_default().trim();
        let path = raw_path.strip_prefix('/').unwrap_or(raw_path).to_owned();

        let flags = PlaceholderFlags::scan(
            std::iter::once(path.as_str())
                .chain(headers.iter().flat_map(|(_, values)| values.iter().map(String::as_str)))
                .chain(query.iter().flat_map(|(_, values)| values.iter().map(String::as_str)))
                .chain(link.write_value.as_deref()),
        );

        Ok(Self {
            method: link.method,
            path,
            content_type,
            headers,
            query,
            body: link.write_value.clone(),
            flags,
            paging_enabled: link.paging_enabled,
            decoding: link.effective_decoding(agent),
            failure_codes: link.effective_failure_codes(agent),
        })
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn flags(&self) -> PlaceholderFlags {
        self.flags
    }

    pub fn paging_enabled(&self) -> bool {
        self.paging_enabled
    }

    pub fn decoding(&self) -> MessageDecoding {
        self.decoding
    }

    pub fn failure_codes(&self) -> &BTreeSet<u16> {
        &self.failure_codes
    }

    /// Values configured for a merged header, if present.
    pub fn header_values(&self, name: &str) -> Option<&[String]> {
        self.headers
            .iter()
            .find(|(header, _)| header.as_str().eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
    }

    /// Substitute placeholders and issue the request over `connection`.
    pub async fn invoke(
        &self,
        connection: &Connection,
        auth: Option<&dyn AuthProvider>,
        value: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<HttpResponse, TransportError> {
        let injector = PlaceholderInjector::new(value, now);
        let flags = self.flags;

        let path = injector.inject(&self.path, flags);
        let mut url = connection.resolve(&path)?;
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, values) in &self.query {
                for value in values {
                    pairs.append_pair(name, &injector.inject(value, flags));
                }
            }
        }

        let mut request = connection.request(self.method.as_reqwest(), url);
        for (name, values) in &self.headers {
            for value in values {
                let value = injector.inject(value, flags);
                let header = HeaderValue::from_str(&value)
                    .map_err(|_| TransportError::InvalidHeader(name.to_string()))?;
                request = request.header(name.clone(), header);
            }
        }
        if let Some(auth) = auth {
            if let Some(header) = auth.authorization().await {
                request = request.header(AUTHORIZATION, header);
            }
        }

        if !self.method.is_get() {
            let body = match &self.body {
                Some(template) => Some(injector.inject(template, flags).into_owned()),
                None => value.and_then(stringify_value),
            };
            if let Some(body) = body {
                if self.header_values(CONTENT_TYPE.as_str()).is_none() {
                    request = request.header(CONTENT_TYPE, self.content_type.clone());
                }
                request = request.body(body);
            }
        }

        connection.execute(request).await
    }
}

fn merge_query(agent: &MultiValueMap, link: &MultiValueMap) -> Vec<(String, Vec<String>)> {
    let mut merged = agent.clone();
    for (name, values) in link {
        merged
            .entry(name.clone())
            .or_default()
            .extend(values.iter().cloned());
    }
    merged.into_iter().collect()
}
