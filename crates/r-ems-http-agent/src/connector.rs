//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP agent connector linking attributes to upstream endpoints."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! One connector per agent: owns the connection, templates, polling tasks and status.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use r_ems_logging::{
    ems_debug, ems_info, ems_warn, log_system_event, LogContext, SystemEventOutcome,
};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::attribute::{AttributeRef, AttributeStore};
use crate::auth::{build_auth_provider, AuthProvider};
use crate::config::{AgentConfig, AttributeLinkConfig};
use crate::connection::{Connection, HttpResponse, HttpTransport};
use crate::error::{ConfigError, HttpAgentError};
use crate::metrics::{HttpAgentMetrics, RequestKind};
use crate::pagination::PaginationWalker;
use crate::router::{ResponseRouter, RouteOutcome};
use crate::scheduler::{PollTarget, PollingScheduler, TickControl};
use crate::status::{ConnectionStatus, HttpStatusMapper, StatusMapper};
use crate::template::RequestTemplate;

/// Optional capabilities supplied at agent start.
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    pub metrics: Option<HttpAgentMetrics>,
    pub status_mapper: Arc<dyn StatusMapper>,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            metrics: None,
            status_mapper: Arc::new(HttpStatusMapper),
        }
    }
}

impl ConnectorOptions {
    pub fn with_metrics(mut self, metrics: HttpAgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

struct LinkState {
    config: AttributeLinkConfig,
    template: Arc<RequestTemplate>,
}

struct Heartbeat {
    template: Arc<RequestTemplate>,
    interval: Duration,
}

struct AgentShared {
    agent_id: String,
    config: AgentConfig,
    connection: Connection,
    auth: Option<Arc<dyn AuthProvider>>,
    pagination: PaginationWalker,
    store: Arc<dyn AttributeStore>,
    router: ResponseRouter,
    scheduler: PollingScheduler,
    links: RwLock<HashMap<AttributeRef, LinkState>>,
    heartbeat: Option<Heartbeat>,
    metrics: Option<HttpAgentMetrics>,
    stopped: AtomicBool,
}

/// Links attributes of one agent to its upstream HTTP endpoint.
pub struct HttpConnector {
    shared: Arc<AgentShared>,
}

impl HttpConnector {
    /// Validate `config`, connect and start the heartbeat if one is configured.
    ///
    /// Configuration problems are the only errors that prevent an agent from starting.
    /// Must be called from within a tokio runtime.
    pub fn start(
        agent_id: impl Into<String>,
        config: AgentConfig,
        transport: &HttpTransport,
        store: Arc<dyn AttributeStore>,
        options: ConnectorOptions,
    ) -> Result<Self, ConfigError> {
        let agent_id = agent_id.into();
        if let Err(err) = config.validate() {
            log_system_event(
                Some(&LogContext::new().with_agent(&agent_id)),
                "agent.start",
                &err.to_string(),
                SystemEventOutcome::Fault,
            );
            return Err(err);
        }

        let connection = Connection::new(transport, &config)?;
        let auth = build_auth_provider(
            &agent_id,
            &config.auth,
            connection.client().clone(),
            config.request_timeout,
            options.metrics.clone(),
        )?;
        let heartbeat = match &config.heartbeat {
            Some(heartbeat) => Some(Heartbeat {
                template: Arc::new(RequestTemplate::build(&config, &heartbeat.as_link())?),
                interval: heartbeat.interval,
            }),
            None => None,
        };

        let mut router = ResponseRouter::new(
            agent_id.clone(),
            store.clone(),
            options.status_mapper,
            config.follow_redirects,
        );
        if let Some(metrics) = options.metrics.clone() {
            router = router.with_metrics(metrics);
        }
        if heartbeat.is_some() {
            router.authority().assign_heartbeat();
        }
        router.update_status(ConnectionStatus::Connected);

        let shared = Arc::new(AgentShared {
            pagination: PaginationWalker::new(config.max_pages),
            scheduler: PollingScheduler::new(config.min_polling_interval),
            agent_id,
            config,
            connection,
            auth,
            store,
            router,
            links: RwLock::new(HashMap::new()),
            heartbeat,
            metrics: options.metrics,
            stopped: AtomicBool::new(false),
        });
        shared.schedule_heartbeat();

        log_system_event(
            Some(&LogContext::new().with_agent(&shared.agent_id)),
            "agent.start",
            &format!("agent connected to {}", shared.connection.base_url()),
            SystemEventOutcome::Success,
        );
        Ok(Self { shared })
    }

    pub fn agent_id(&self) -> &str {
        &self.shared.agent_id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.shared.config
    }

    /// Link `attribute`, replacing any previous link for it.
    ///
    /// Links with a polling interval get their own task; links naming a polling source
    /// receive that source's responses instead of issuing requests.
    pub fn link(
        &self,
        attribute: AttributeRef,
        link: AttributeLinkConfig,
    ) -> Result<(), HttpAgentError> {
        let shared = &self.shared;
        shared.ensure_running()?;
        link.validate(&attribute)?;
        let template = Arc::new(RequestTemplate::build(&shared.config, &link)?);

        shared.detach(&attribute, false);
        let source = link.polling_source(&attribute);
        let interval = link.polling_interval;
        shared.links.write().insert(
            attribute.clone(),
            LinkState {
                config: link,
                template,
            },
        );

        if let Some(source) = source {
            ems_info!(
                context = LogContext::new()
                    .with_agent(&shared.agent_id)
                    .with_entity(&attribute.entity_id)
                    .with_attribute(&attribute.name),
                "sharing responses polled by {}",
                source.name
            );
            shared.router.sources().register(source, attribute);
        } else if let Some(interval) = interval {
            if !shared.router.status().is_disabled() {
                shared.schedule_attribute(attribute, interval);
            }
        }
        Ok(())
    }

    /// Unlink `attribute`; returns whether it was linked.
    pub fn unlink(&self, attribute: &AttributeRef) -> bool {
        let removed = self.shared.links.write().remove(attribute).is_some();
        self.shared.detach(attribute, true);
        if removed {
            ems_debug!(
                context = LogContext::new()
                    .with_agent(&self.shared.agent_id)
                    .with_entity(&attribute.entity_id)
                    .with_attribute(&attribute.name),
                "attribute unlinked"
            );
        }
        removed
    }

    pub fn is_linked(&self, attribute: &AttributeRef) -> bool {
        self.shared.links.read().contains_key(attribute)
    }

    pub fn linked_attributes(&self) -> Vec<AttributeRef> {
        let mut attributes: Vec<_> = self.shared.links.read().keys().cloned().collect();
        attributes.sort();
        attributes
    }

    /// Effective polling interval of a linked attribute, if it owns a task.
    pub fn polling_interval(&self, attribute: &AttributeRef) -> Option<Duration> {
        self.shared
            .scheduler
            .interval_of(&PollTarget::Attribute(attribute.clone()))
    }

    /// Whether the heartbeat or attribute currently has a live polling task.
    pub fn is_polling(&self, target: &PollTarget) -> bool {
        self.shared.scheduler.is_scheduled(target)
    }

    /// Send `value` through the attribute's template and return the upstream status code.
    pub async fn write_attribute(
        &self,
        attribute: &AttributeRef,
        value: Value,
    ) -> Result<u16, HttpAgentError> {
        let shared = &self.shared;
        shared.ensure_running()?;
        if shared.router.status().is_disabled() {
            return Err(HttpAgentError::Disabled(shared.agent_id.clone()));
        }
        let template = shared
            .links
            .read()
            .get(attribute)
            .map(|link| link.template.clone())
            .ok_or_else(|| HttpAgentError::NotLinked(attribute.clone()))?;

        let started = Instant::now();
        let result = template
            .invoke(
                &shared.connection,
                shared.auth.as_deref(),
                Some(&value),
                Utc::now(),
            )
            .await;
        let status = result.as_ref().map(|response| response.status).ok();
        shared.observe(RequestKind::Write, status, started);

        let outcome =
            shared
                .router
                .route_write(attribute, template.failure_codes(), status.unwrap_or(500));
        if let RouteOutcome::PermanentFailure { first: true, .. } = outcome {
            shared.on_disabled();
        }
        match result {
            Ok(response) => Ok(response.status),
            Err(err) => {
                ems_warn!(
                    context = LogContext::new()
                        .with_agent(&shared.agent_id)
                        .with_entity(&attribute.entity_id)
                        .with_attribute(&attribute.name),
                    "write failed: {}",
                    err
                );
                Err(err.into())
            }
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.router.status().current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.router.status().subscribe()
    }

    /// Operator action clearing DISABLED. Reschedules the heartbeat and every polling link.
    pub fn re_enable(&self) -> bool {
        let shared = &self.shared;
        if shared.stopped.load(Ordering::SeqCst) || !shared.router.status().re_enable() {
            return false;
        }
        if let Some(metrics) = &shared.metrics {
            metrics.record_status(&shared.agent_id, ConnectionStatus::Connected);
        }
        shared.schedule_heartbeat();
        let polled: Vec<(AttributeRef, Duration)> = shared
            .links
            .read()
            .iter()
            .filter(|(attribute, link)| link.config.polling_source(attribute).is_none())
            .filter_map(|(attribute, link)| {
                link.config
                    .polling_interval
                    .map(|interval| (attribute.clone(), interval))
            })
            .collect();
        for (attribute, interval) in polled {
            shared.schedule_attribute(attribute, interval);
        }
        log_system_event(
            Some(&LogContext::new().with_agent(&shared.agent_id)),
            "agent.re_enable",
            "agent re-enabled by operator",
            SystemEventOutcome::Success,
        );
        true
    }

    /// Cancel every task and clear all per-agent state.
    pub fn stop(&self) {
        let shared = &self.shared;
        if shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancelled = shared.scheduler.cancel_all();
        shared.links.write().clear();
        shared.router.sources().clear();
        shared.router.authority().clear();
        shared.connection.close();
        log_system_event(
            Some(&LogContext::new().with_agent(&shared.agent_id)),
            "agent.stop",
            &format!("agent stopped; {cancelled} polling task(s) cancelled"),
            SystemEventOutcome::Success,
        );
    }
}

impl Drop for HttpConnector {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for HttpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnector")
            .field("agent_id", &self.shared.agent_id)
            .field("status", &self.status())
            .field("links", &self.shared.links.read().len())
            .finish_non_exhaustive()
    }
}

impl AgentShared {
    fn ensure_running(&self) -> Result<(), HttpAgentError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(HttpAgentError::Stopped(self.agent_id.clone()));
        }
        Ok(())
    }

    /// Cancel the attribute's task, stop it receiving other sources' responses and release
    /// its status authority.
    ///
    /// Attributes sharing its response are dropped only when `unlinking`; a re-link keeps
    /// them registered.
    fn detach(&self, attribute: &AttributeRef, unlinking: bool) {
        let target = PollTarget::Attribute(attribute.clone());
        self.scheduler.cancel(&target);
        if unlinking {
            self.router.sources().remove_attribute(attribute);
        } else {
            self.router.sources().remove_target(attribute);
        }
        self.router.authority().release(&target);
    }

    fn schedule_heartbeat(self: &Arc<Self>) {
        if let Some(heartbeat) = &self.heartbeat {
            self.schedule(PollTarget::Heartbeat, heartbeat.interval);
        }
    }

    fn schedule_attribute(self: &Arc<Self>, attribute: AttributeRef, interval: Duration) {
        let effective = self.schedule(PollTarget::Attribute(attribute.clone()), interval);
        ems_info!(
            context = LogContext::new()
                .with_agent(&self.agent_id)
                .with_entity(&attribute.entity_id)
                .with_attribute(&attribute.name),
            "polling every {} ms",
            effective.as_millis()
        );
    }

    fn schedule(self: &Arc<Self>, target: PollTarget, interval: Duration) -> Duration {
        let weak: Weak<Self> = Arc::downgrade(self);
        let tick_target = target.clone();
        self.scheduler.schedule(target, interval, move |sequence| {
            let weak = weak.clone();
            let target = tick_target.clone();
            async move {
                match weak.upgrade() {
                    Some(shared) => shared.run_tick(&target, sequence).await,
                    None => TickControl::Stop,
                }
            }
        })
    }

    async fn run_tick(&self, target: &PollTarget, sequence: u64) -> TickControl {
        if self.stopped.load(Ordering::SeqCst) || self.router.status().is_disabled() {
            return TickControl::Stop;
        }
        let (template, value, kind) = match target {
            PollTarget::Heartbeat => match &self.heartbeat {
                Some(heartbeat) => (heartbeat.template.clone(), None, RequestKind::Heartbeat),
                None => return TickControl::Stop,
            },
            PollTarget::Attribute(attribute) => {
                let template = self
                    .links
                    .read()
                    .get(attribute)
                    .map(|link| link.template.clone());
                match template {
                    Some(template) => (
                        template,
                        self.store.read_command_value(attribute),
                        RequestKind::Poll,
                    ),
                    None => return TickControl::Stop,
                }
            }
        };

        let started = Instant::now();
        let response = self.fetch(target, sequence, &template, value.as_ref()).await;
        self.observe(
            kind,
            response.url.as_ref().map(|_| response.status),
            started,
        );

        let outcome = self.router.route_poll(
            target,
            template.decoding(),
            template.failure_codes(),
            response,
            Utc::now(),
        );
        match outcome {
            RouteOutcome::PermanentFailure { first, .. } => {
                if first {
                    self.on_disabled();
                }
                TickControl::Stop
            }
            _ => TickControl::Continue,
        }
    }

    /// Invoke and paginate; any transport failure becomes a synthetic 500.
    async fn fetch(
        &self,
        target: &PollTarget,
        sequence: u64,
        template: &RequestTemplate,
        value: Option<&Value>,
    ) -> HttpResponse {
        let auth = self.auth.as_deref();
        let result = match template
            .invoke(&self.connection, auth, value, Utc::now())
            .await
        {
            Ok(response) if template.paging_enabled() && response.is_success() => {
                self.pagination.walk(&self.connection, auth, response).await
            }
            other => other,
        };
        result.unwrap_or_else(|err| {
            let context = match target {
                PollTarget::Attribute(attribute) => LogContext::new()
                    .with_agent(&self.agent_id)
                    .with_entity(&attribute.entity_id)
                    .with_attribute(&attribute.name)
                    .with_tick(sequence),
                PollTarget::Heartbeat => LogContext::new()
                    .with_agent(&self.agent_id)
                    .with_tick(sequence),
            };
            ems_warn!(context = context, "request to {} failed: {}", target, err);
            HttpResponse::synthetic(500)
        })
    }

    fn observe(&self, kind: RequestKind, status: Option<u16>, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_request(&self.agent_id, kind, status, started.elapsed());
        }
    }

    fn on_disabled(&self) {
        let cancelled = self.scheduler.cancel_all();
        log_system_event(
            Some(&LogContext::new().with_agent(&self.agent_id)),
            "agent.disable",
            &format!(
                "agent disabled after permanent failure; {cancelled} polling task(s) cancelled"
            ),
            SystemEventOutcome::Fault,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::InMemoryAttributeStore;
    use crate::config::HttpMethod;

    fn start(config: AgentConfig) -> Result<HttpConnector, ConfigError> {
        let transport = HttpTransport::new()?;
        HttpConnector::start(
            "agent-a",
            config,
            &transport,
            Arc::new(InMemoryAttributeStore::new()),
            ConnectorOptions::default(),
        )
    }

    #[tokio::test]
    async fn start_rejects_invalid_configuration() {
        assert!(matches!(
            start(AgentConfig::default()),
            Err(ConfigError::MissingBaseUri)
        ));
    }

    #[tokio::test]
    async fn start_reports_connected() {
        let connector = start(AgentConfig::new("http://127.0.0.1:9")).unwrap();
        assert_eq!(connector.status(), ConnectionStatus::Connected);
        assert!(!connector.is_polling(&PollTarget::Heartbeat));
    }

    #[tokio::test]
    async fn link_validation_errors_surface() {
        let connector = start(AgentConfig::new("http://127.0.0.1:9")).unwrap();
        let attribute = AttributeRef::new("meter-1", "power");
        let err = connector
            .link(attribute.clone(), AttributeLinkConfig::shared("power"))
            .unwrap_err();
        assert!(matches!(
            err,
            HttpAgentError::Config(ConfigError::InvalidLink { .. })
        ));
        assert!(!connector.is_linked(&attribute));
    }

    #[tokio::test]
    async fn write_requires_a_link_and_a_running_agent() {
        let connector = start(AgentConfig::new("http://127.0.0.1:9")).unwrap();
        let attribute = AttributeRef::new("meter-1", "setpoint");
        assert!(matches!(
            connector.write_attribute(&attribute, Value::from(1)).await,
            Err(HttpAgentError::NotLinked(_))
        ));

        connector
            .link(
                attribute.clone(),
                AttributeLinkConfig::command(HttpMethod::Put, "setpoint"),
            )
            .unwrap();
        assert_eq!(connector.linked_attributes(), vec![attribute.clone()]);
        assert_eq!(connector.polling_interval(&attribute), None);

        connector.stop();
        assert!(!connector.is_linked(&attribute));
        assert!(matches!(
            connector.write_attribute(&attribute, Value::from(1)).await,
            Err(HttpAgentError::Stopped(_))
        ));
        assert!(matches!(
            connector.link(attribute, AttributeLinkConfig::default()),
            Err(HttpAgentError::Stopped(_))
        ));
    }

    #[tokio::test]
    async fn unlink_of_unknown_attribute_is_a_no_op() {
        let connector = start(AgentConfig::new("http://127.0.0.1:9")).unwrap();
        assert!(!connector.unlink(&AttributeRef::new("meter-1", "ghost")));
        assert!(!connector.re_enable());
    }
}
