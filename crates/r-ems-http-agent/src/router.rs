//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP agent connector linking attributes to upstream endpoints."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Turns responses into attribute writes, status updates and permanent-failure decisions.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use r_ems_logging::{ems_debug, ems_error, ems_info, ems_warn, LogContext};
use serde_json::Value;

use crate::attribute::{AttributeRef, AttributeStore};
use crate::config::MessageDecoding;
use crate::connection::{HttpResponse, ResponseBody};
use crate::error::DecodeError;
use crate::metrics::HttpAgentMetrics;
use crate::scheduler::PollTarget;
use crate::status::{
    is_permanent_failure, ConnectionStatus, ConnectionStatusTracker, StatusAuthority, StatusMapper,
};

/// Fan-out registrations: polling source to the attributes sharing its response.
#[derive(Debug, Default)]
pub struct PollingSourceMap {
    inner: RwLock<HashMap<AttributeRef, HashSet<AttributeRef>>>,
}

impl PollingSourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver responses polled for `source` to `target` as well.
    pub fn register(&self, source: AttributeRef, target: AttributeRef) {
        self.inner.write().entry(source).or_default().insert(target);
    }

    /// Drop every registration mentioning `attribute`, as source or as target.
    pub fn remove_attribute(&self, attribute: &AttributeRef) {
        let mut inner = self.inner.write();
        inner.remove(attribute);
        Self::prune_target(&mut inner, attribute);
    }

    /// Stop delivering other sources' responses to `attribute`. Attributes sharing its
    /// own response stay registered.
    pub fn remove_target(&self, attribute: &AttributeRef) {
        Self::prune_target(&mut self.inner.write(), attribute);
    }

    fn prune_target(
        inner: &mut HashMap<AttributeRef, HashSet<AttributeRef>>,
        attribute: &AttributeRef,
    ) {
        inner.retain(|_, targets| {
            targets.remove(attribute);
            !targets.is_empty()
        });
    }

    /// Attributes sharing `source`'s response, in stable order.
    pub fn targets(&self, source: &AttributeRef) -> Vec<AttributeRef> {
        let inner = self.inner.read();
        let mut targets: Vec<AttributeRef> = inner
            .get(source)
            .map(|targets| targets.iter().cloned().collect())
            .unwrap_or_default();
        targets.sort();
        targets
    }

    /// Polling source `target` is registered under, if any.
    pub fn source_of(&self, target: &AttributeRef) -> Option<AttributeRef> {
        self.inner
            .read()
            .iter()
            .find(|(_, targets)| targets.contains(target))
            .map(|(source, _)| source.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

/// Decode a body into an attribute value; `None` for empty bodies.
pub fn decode_body(
    body: &ResponseBody,
    mode: MessageDecoding,
) -> Result<Option<Value>, DecodeError> {
    match body {
        ResponseBody::Empty => Ok(None),
        ResponseBody::Bytes(bytes) if bytes.is_empty() => Ok(None),
        ResponseBody::Bytes(bytes) => decode_bytes(bytes, mode).map(Some),
        ResponseBody::Pages(pages) => pages
            .iter()
            .map(|page| decode_bytes(page, mode))
            .collect::<Result<Vec<_>, _>>()
            .map(|values| Some(Value::Array(values))),
    }
}

fn decode_bytes(bytes: &Bytes, mode: MessageDecoding) -> Result<Value, DecodeError> {
    let decoded = match mode {
        MessageDecoding::Text => std::str::from_utf8(bytes)?.to_owned(),
        MessageDecoding::Hex => hex::encode_upper(bytes),
        MessageDecoding::Binary => bytes.iter().fold(
            String::with_capacity(bytes.len() * 8),
            |mut bits, byte| {
                let _ = write!(bits, "{byte:08b}");
                bits
            },
        ),
    };
    Ok(Value::String(decoded))
}

/// Result of routing one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Success; `written` attributes received the decoded value.
    Delivered { written: usize },
    /// Non-success response; attribute values left untouched.
    Rejected { status: u16 },
    /// Response code is on the deny-list. `first` marks the call that disabled the agent.
    PermanentFailure { status: u16, first: bool },
}

/// Routes responses for one agent. Never fails: every problem ends up in the outcome.
pub struct ResponseRouter {
    agent_id: String,
    store: Arc<dyn AttributeStore>,
    sources: PollingSourceMap,
    status: ConnectionStatusTracker,
    authority: StatusAuthority,
    mapper: Arc<dyn StatusMapper>,
    follow_redirects: bool,
    metrics: Option<HttpAgentMetrics>,
}

impl ResponseRouter {
    pub fn new(
        agent_id: impl Into<String>,
        store: Arc<dyn AttributeStore>,
        mapper: Arc<dyn StatusMapper>,
        follow_redirects: bool,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            store,
            sources: PollingSourceMap::new(),
            status: ConnectionStatusTracker::new(),
            authority: StatusAuthority::new(),
            mapper,
            follow_redirects,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: HttpAgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn sources(&self) -> &PollingSourceMap {
        &self.sources
    }

    pub fn status(&self) -> &ConnectionStatusTracker {
        &self.status
    }

    pub fn authority(&self) -> &StatusAuthority {
        &self.authority
    }

    /// Route a polled response. Successful attribute polls are written to the origin and to
    /// every attribute sharing it, all with the same timestamp.
    pub fn route_poll(
        &self,
        origin: &PollTarget,
        decoding: MessageDecoding,
        failure_codes: &BTreeSet<u16>,
        response: HttpResponse,
        now: DateTime<Utc>,
    ) -> RouteOutcome {
        let mut status = response.status;
        let mut decoded = None;
        if response.is_success() {
            match decode_body(&response.body, decoding) {
                Ok(value) => decoded = value,
                Err(err) => {
                    self.log_target_warn(origin, &format!("failed to decode response: {err}"));
                    status = 500;
                }
            }
        }

        if let Some(outcome) = self.settle(origin, status, failure_codes) {
            return outcome;
        }

        let (PollTarget::Attribute(attribute), Some(value)) = (origin, decoded) else {
            return RouteOutcome::Delivered { written: 0 };
        };
        let targets = self.sources.targets(attribute);
        for target in &targets {
            self.store.write_attribute_value(target, value.clone(), now);
        }
        self.store.write_attribute_value(attribute, value, now);
        ems_debug!(
            context = LogContext::new()
                .with_agent(&self.agent_id)
                .with_entity(&attribute.entity_id)
                .with_attribute(&attribute.name),
            "delivered response to {} attribute(s)",
            targets.len() + 1
        );
        RouteOutcome::Delivered {
            written: targets.len() + 1,
        }
    }

    /// Route the response to an attribute write. Only status and failure handling apply.
    pub fn route_write(
        &self,
        attribute: &AttributeRef,
        failure_codes: &BTreeSet<u16>,
        status: u16,
    ) -> RouteOutcome {
        let origin = PollTarget::Attribute(attribute.clone());
        self.settle(&origin, status, failure_codes)
            .unwrap_or(RouteOutcome::Delivered { written: 0 })
    }

    /// Apply a status and the permanent-failure check. `None` means the response succeeded.
    fn settle(
        &self,
        origin: &PollTarget,
        status: u16,
        failure_codes: &BTreeSet<u16>,
    ) -> Option<RouteOutcome> {
        if self.authority.claim(origin) {
            self.update_status(self.mapper.map(Some(status), self.follow_redirects));
        }

        if is_permanent_failure(status, failure_codes) {
            let first = self.status.disable();
            if first {
                if let Some(metrics) = &self.metrics {
                    metrics.record_permanent_failure(&self.agent_id);
                    metrics.record_status(&self.agent_id, ConnectionStatus::Disabled);
                }
                ems_error!(
                    context = LogContext::new().with_agent(&self.agent_id),
                    "response {} from {} is a permanent failure; disabling agent",
                    status,
                    origin
                );
            }
            return Some(RouteOutcome::PermanentFailure { status, first });
        }

        if (200..300).contains(&status) {
            return None;
        }
        self.log_target_warn(origin, &format!("request failed with status {status}"));
        Some(RouteOutcome::Rejected { status })
    }

    /// Overwrite the agent status unless it is disabled.
    pub fn update_status(&self, status: ConnectionStatus) {
        if self.status.update(status) {
            if let Some(metrics) = &self.metrics {
                metrics.record_status(&self.agent_id, status);
            }
            ems_info!(
                context = LogContext::new().with_agent(&self.agent_id),
                "connection status changed to {}",
                status
            );
        }
    }

    fn log_target_warn(&self, origin: &PollTarget, message: &str) {
        match origin {
            PollTarget::Attribute(attribute) => ems_warn!(
                context = LogContext::new()
                    .with_agent(&self.agent_id)
                    .with_entity(&attribute.entity_id)
                    .with_attribute(&attribute.name),
                "{}",
                message
            ),
            PollTarget::Heartbeat => ems_warn!(
                context = LogContext::new().with_agent(&self.agent_id),
                "heartbeat: {}",
                message
            ),
        }
    }
}

impl std::fmt::Debug for ResponseRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseRouter")
            .field("agent_id", &self.agent_id)
            .field("status", &self.status.current())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::InMemoryAttributeStore;
    use crate::status::HttpStatusMapper;
    use serde_json::json;

    fn attr(name: &str) -> AttributeRef {
        AttributeRef::new("meter-1", name)
    }

    fn ok(body: &'static [u8]) -> HttpResponse {
        let mut response = HttpResponse::synthetic(200);
        response.body = ResponseBody::Bytes(Bytes::from_static(body));
        response
    }

    fn router(store: Arc<InMemoryAttributeStore>) -> ResponseRouter {
        ResponseRouter::new("agent-a", store, Arc::new(HttpStatusMapper), false)
    }

    #[test]
    fn source_map_prunes_on_removal() {
        let map = PollingSourceMap::new();
        map.register(attr("raw"), attr("power"));
        map.register(attr("raw"), attr("energy"));
        map.register(attr("other"), attr("power"));
        assert_eq!(map.targets(&attr("raw")), vec![attr("energy"), attr("power")]);

        map.remove_attribute(&attr("power"));
        assert_eq!(map.targets(&attr("raw")), vec![attr("energy")]);
        assert!(map.targets(&attr("other")).is_empty());
        assert_eq!(map.source_of(&attr("energy")), Some(attr("raw")));

        map.remove_attribute(&attr("raw"));
        assert!(map.is_empty());
    }

    #[test]
    fn removing_a_target_keeps_its_own_fan_out() {
        let map = PollingSourceMap::new();
        map.register(attr("raw"), attr("power"));
        map.register(attr("other"), attr("raw"));

        map.remove_target(&attr("raw"));
        assert_eq!(map.targets(&attr("raw")), vec![attr("power")]);
        assert!(map.targets(&attr("other")).is_empty());
        assert_eq!(map.source_of(&attr("raw")), None);
    }

    #[test]
    fn decodes_text_hex_and_binary() {
        let body = ResponseBody::Bytes(Bytes::from_static(&[0x0f, 0xa0]));
        assert_eq!(
            decode_body(&body, MessageDecoding::Hex).unwrap(),
            Some(json!("0FA0"))
        );
        assert_eq!(
            decode_body(&body, MessageDecoding::Binary).unwrap(),
            Some(json!("0000111110100000"))
        );
        let invalid = ResponseBody::Bytes(Bytes::from_static(&[0xff]));
        assert!(decode_body(&invalid, MessageDecoding::Text).is_err());
        assert_eq!(decode_body(&ResponseBody::Empty, MessageDecoding::Text).unwrap(), None);

        let pages = ResponseBody::Pages(vec![
            Bytes::from_static(b"[1]"),
            Bytes::from_static(b"[2]"),
        ]);
        assert_eq!(
            decode_body(&pages, MessageDecoding::Text).unwrap(),
            Some(json!(["[1]", "[2]"]))
        );
    }

    #[test]
    fn fan_out_shares_value_and_timestamp() {
        let store = Arc::new(InMemoryAttributeStore::new());
        let router = router(store.clone());
        router.sources().register(attr("raw"), attr("power"));

        let now = Utc::now();
        let outcome = router.route_poll(
            &PollTarget::Attribute(attr("raw")),
            MessageDecoding::Text,
            &BTreeSet::new(),
            ok(b"42.5"),
            now,
        );
        assert_eq!(outcome, RouteOutcome::Delivered { written: 2 });
        let raw = store.value(&attr("raw")).unwrap();
        let power = store.value(&attr("power")).unwrap();
        assert_eq!(raw, power);
        assert_eq!(raw.value, json!("42.5"));
        assert_eq!(raw.timestamp, now);
        assert_eq!(router.status().current(), ConnectionStatus::Connected);
    }

    #[test]
    fn failures_leave_values_untouched() {
        let store = Arc::new(InMemoryAttributeStore::new());
        let router = router(store.clone());
        let origin = PollTarget::Attribute(attr("power"));

        let outcome = router.route_poll(
            &origin,
            MessageDecoding::Text,
            &BTreeSet::new(),
            HttpResponse::synthetic(503),
            Utc::now(),
        );
        assert_eq!(outcome, RouteOutcome::Rejected { status: 503 });
        assert_eq!(store.write_count(&attr("power")), 0);
        assert_eq!(router.status().current(), ConnectionStatus::Error);

        let outcome = router.route_poll(
            &origin,
            MessageDecoding::Text,
            &BTreeSet::new(),
            ok(&[0xff, 0xfe]),
            Utc::now(),
        );
        assert_eq!(outcome, RouteOutcome::Rejected { status: 500 });
        assert_eq!(store.write_count(&attr("power")), 0);
    }

    #[test]
    fn only_the_authoritative_target_updates_status() {
        let store = Arc::new(InMemoryAttributeStore::new());
        let router = router(store);
        let first = PollTarget::Attribute(attr("a"));
        let second = PollTarget::Attribute(attr("b"));
        let none = BTreeSet::new();

        router.route_poll(&first, MessageDecoding::Text, &none, ok(b"1"), Utc::now());
        let denied = HttpResponse::synthetic(401);
        router.route_poll(&second, MessageDecoding::Text, &none, denied, Utc::now());
        assert_eq!(router.status().current(), ConnectionStatus::Connected);

        let denied = HttpResponse::synthetic(401);
        router.route_poll(&first, MessageDecoding::Text, &none, denied, Utc::now());
        assert_eq!(router.status().current(), ConnectionStatus::ErrorAuthentication);
    }

    #[test]
    fn permanent_failure_disables_once() {
        let store = Arc::new(InMemoryAttributeStore::new());
        let router = router(store.clone());
        let codes: BTreeSet<u16> = [410].into_iter().collect();
        let origin = PollTarget::Attribute(attr("power"));

        let outcome = router.route_poll(
            &origin,
            MessageDecoding::Text,
            &codes,
            HttpResponse::synthetic(410),
            Utc::now(),
        );
        assert_eq!(outcome, RouteOutcome::PermanentFailure { status: 410, first: true });
        assert_eq!(router.status().current(), ConnectionStatus::Disabled);

        let again = router.route_write(&attr("power"), &codes, 410);
        assert_eq!(again, RouteOutcome::PermanentFailure { status: 410, first: false });

        router.route_poll(&origin, MessageDecoding::Text, &codes, ok(b"1"), Utc::now());
        assert_eq!(router.status().current(), ConnectionStatus::Disabled);
    }
}
