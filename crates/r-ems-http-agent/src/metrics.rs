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

use anyhow::Result;
use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use crate::config::GrantKind;
use crate::status::ConnectionStatus;

/// Registry shared between agents and the exporter.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Which kind of request a metric sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Poll,
    Heartbeat,
    Write,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Poll => "poll",
            RequestKind::Heartbeat => "heartbeat",
            RequestKind::Write => "write",
        }
    }
}

/// Metrics published by HTTP agents.
#[derive(Clone)]
pub struct HttpAgentMetrics {
    registry: SharedRegistry,
    requests_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    status_transitions_total: IntCounterVec,
    token_requests_total: IntCounterVec,
    permanent_failures_total: IntCounterVec,
}

impl HttpAgentMetrics {
    /// Register the HTTP agent metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new(
                "r_ems_http_requests_total",
                "Upstream requests issued by HTTP agents",
            ),
            &["agent", "kind", "outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "r_ems_http_request_duration_seconds",
            "Time from send to fully read response body",
        )
        .buckets(prometheus::exponential_buckets(0.001, 2.0, 16)?);
        let request_duration_seconds = HistogramVec::new(histogram_opts, &["agent", "kind"])?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let status_transitions_total = IntCounterVec::new(
            Opts::new(
                "r_ems_http_status_transitions_total",
                "Connection status changes per agent",
            ),
            &["agent", "status"],
        )?;
        registry.register(Box::new(status_transitions_total.clone()))?;

        let token_requests_total = IntCounterVec::new(
            Opts::new(
                "r_ems_http_token_requests_total",
                "OAuth token endpoint calls",
            ),
            &["agent", "grant", "outcome"],
        )?;
        registry.register(Box::new(token_requests_total.clone()))?;

        let permanent_failures_total = IntCounterVec::new(
            Opts::new(
                "r_ems_http_permanent_failures_total",
                "Agents disabled after a configured failure code",
            ),
            &["agent"],
        )?;
        registry.register(Box::new(permanent_failures_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            status_transitions_total,
            token_requests_total,
            permanent_failures_total,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Count one request; `status` is `None` when the transport failed.
    pub fn observe_request(
        &self,
        agent: &str,
        kind: RequestKind,
        status: Option<u16>,
        elapsed: Duration,
    ) {
        let outcome = match status {
            Some(code) if (200..300).contains(&code) => "success",
            Some(_) => "http_error",
            None => "transport_error",
        };
        self.requests_total
            .with_label_values(&[agent, kind.as_str(), outcome])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[agent, kind.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_status(&self, agent: &str, status: ConnectionStatus) {
        self.status_transitions_total
            .with_label_values(&[agent, status.as_str()])
            .inc();
    }

    pub fn record_token_request(&self, agent: &str, grant: GrantKind, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.token_requests_total
            .with_label_values(&[agent, grant.as_str(), outcome])
            .inc();
    }

    pub fn record_permanent_failure(&self, agent: &str) {
        self.permanent_failures_total
            .with_label_values(&[agent])
            .inc();
    }
}

impl std::fmt::Debug for HttpAgentMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAgentMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_all_families() {
        let registry = new_registry();
        let metrics = HttpAgentMetrics::new(registry.clone()).unwrap();
        metrics.observe_request("agent-a", RequestKind::Poll, Some(200), Duration::from_millis(3));
        metrics.observe_request("agent-a", RequestKind::Write, None, Duration::from_millis(1));
        metrics.record_status("agent-a", ConnectionStatus::Connected);
        metrics.record_token_request("agent-a", GrantKind::Password, true);
        metrics.record_permanent_failure("agent-a");

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_owned())
            .collect();
        for expected in [
            "r_ems_http_requests_total",
            "r_ems_http_request_duration_seconds",
            "r_ems_http_status_transitions_total",
            "r_ems_http_token_requests_total",
            "r_ems_http_permanent_failures_total",
        ] {
            assert!(names.iter().any(|name| name == expected), "missing {expected}");
        }
    }

    #[test]
    fn double_registration_fails() {
        let registry = new_registry();
        HttpAgentMetrics::new(registry.clone()).unwrap();
        assert!(HttpAgentMetrics::new(registry).is_err());
    }
}
