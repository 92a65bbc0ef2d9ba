//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Structured logging adapters and sinks."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for development.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Initialize a JSON subscriber honouring `filter` (falls back to `info`).
pub fn init_json(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = Registry::default()
        .with(filter)
        .with(subscriber_fmt::layer().json())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Agent identifier associated with the log event.
    pub agent: Option<&'a str>,
    /// Entity (asset or device) identifier.
    pub entity: Option<&'a str>,
    /// Attribute name on the entity.
    pub attribute: Option<&'a str>,
    /// Polling tick sequence number.
    pub tick: Option<u64>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an agent identifier.
    pub fn with_agent(mut self, agent: &'a str) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Attach an entity identifier.
    pub fn with_entity(mut self, entity: &'a str) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Attach an attribute name.
    pub fn with_attribute(mut self, attribute: &'a str) -> Self {
        self.attribute = Some(attribute);
        self
    }

    /// Attach a tick value.
    pub fn with_tick(mut self, tick: u64) -> Self {
        self.tick = Some(tick);
        self
    }
}

/// High-level outcome used when emitting lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventOutcome {
    /// The operation completed successfully.
    Success,
    /// The operation failed or was aborted.
    Fault,
}

impl SystemEventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            SystemEventOutcome::Success => "success",
            SystemEventOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized system event with a success/fault outcome.
pub fn log_system_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: SystemEventOutcome,
) {
    let ctx = context.cloned().unwrap_or_default();
    match outcome {
        SystemEventOutcome::Success => tracing::event!(
            Level::INFO,
            event,
            outcome = outcome.as_str(),
            agent = ctx.agent.unwrap_or(""),
            entity = ctx.entity.unwrap_or(""),
            attribute = ctx.attribute.unwrap_or(""),
            tick = ctx.tick.unwrap_or_default(),
            message = %message
        ),
        SystemEventOutcome::Fault => tracing::event!(
            Level::ERROR,
            event,
            outcome = outcome.as_str(),
            agent = ctx.agent.unwrap_or(""),
            entity = ctx.entity.unwrap_or(""),
            attribute = ctx.attribute.unwrap_or(""),
            tick = ctx.tick.unwrap_or_default(),
            message = %message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_emit_without_panic() {
        init();
        let ctx = LogContext::new()
            .with_agent("agent-a")
            .with_entity("meter-1")
            .with_attribute("power");
        ems_info!(context = ctx.clone(), "attribute linked");
        ems_warn!(context = ctx.clone().with_tick(3), "poll failed with status {}", 503);
        ems_debug!("debug message");
        ems_error!(context = ctx, "error code: {}", 42);
    }

    #[test]
    fn init_does_not_panic() {
        init();
        init_json("debug");
        init_json("not a [valid filter");
    }

    #[test]
    fn system_event_helper_emits() {
        init();
        let ctx = LogContext::new().with_agent("agent-a");
        log_system_event(
            Some(&ctx),
            "agent.start",
            "agent started",
            SystemEventOutcome::Success,
        );
        log_system_event(
            None,
            "agent.disable",
            "agent disabled",
            SystemEventOutcome::Fault,
        );
    }
}
