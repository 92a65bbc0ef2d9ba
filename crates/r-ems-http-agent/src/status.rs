//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP agent connector linking attributes to upstream endpoints."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Connection status derivation and the sticky disable transition.

use std::collections::BTreeSet;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::scheduler::PollTarget;

/// Health of one agent as seen by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Connected,
    Error,
    ErrorAuthentication,
    ErrorConfiguration,
    Disabled,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Unknown => "unknown",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::ErrorAuthentication => "error_authentication",
            ConnectionStatus::ErrorConfiguration => "error_configuration",
            ConnectionStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a response code to a status. `None` and codes outside 100..=599 are not
/// recognised HTTP statuses and map to UNKNOWN.
pub fn map_status(code: Option<u16>, follow_redirects: bool) -> ConnectionStatus {
    match code {
        None => ConnectionStatus::Unknown,
        Some(100..=199) => ConnectionStatus::Error,
        Some(200..=299) => ConnectionStatus::Connected,
        Some(300..=399) if follow_redirects => ConnectionStatus::Connected,
        Some(300..=399) => ConnectionStatus::Error,
        Some(401..=403) => ConnectionStatus::ErrorAuthentication,
        Some(400..=499) => ConnectionStatus::ErrorConfiguration,
        Some(500..=599) => ConnectionStatus::Error,
        Some(_) => ConnectionStatus::Unknown,
    }
}

/// True when `code` is on the permanent-failure deny-list.
pub fn is_permanent_failure(code: u16, failure_codes: &BTreeSet<u16>) -> bool {
    failure_codes.contains(&code)
}

/// Capability mapping response codes to statuses; swapped per agent when needed.
pub trait StatusMapper: Send + Sync + fmt::Debug {
    fn map(&self, code: Option<u16>, follow_redirects: bool) -> ConnectionStatus;
}

/// Standard HTTP status mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpStatusMapper;

impl StatusMapper for HttpStatusMapper {
    fn map(&self, code: Option<u16>, follow_redirects: bool) -> ConnectionStatus {
        map_status(code, follow_redirects)
    }
}

/// Current status of one agent, published on a watch channel.
#[derive(Debug)]
pub struct ConnectionStatusTracker {
    tx: watch::Sender<ConnectionStatus>,
}

impl Default for ConnectionStatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStatusTracker {
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(ConnectionStatus::Unknown),
        }
    }

    pub fn current(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }

    pub fn is_disabled(&self) -> bool {
        self.current() == ConnectionStatus::Disabled
    }

    /// Overwrite the status. Ignored while disabled; returns whether the value changed.
    pub fn update(&self, status: ConnectionStatus) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == ConnectionStatus::Disabled || *current == status {
                return false;
            }
            *current = status;
            true
        })
    }

    /// Enter DISABLED. Returns true only for the call that performed the transition.
    pub fn disable(&self) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == ConnectionStatus::Disabled {
                return false;
            }
            *current = ConnectionStatus::Disabled;
            true
        })
    }

    /// Leave DISABLED and report CONNECTED again.
    pub fn re_enable(&self) -> bool {
        self.tx.send_if_modified(|current| {
            if *current != ConnectionStatus::Disabled {
                return false;
            }
            *current = ConnectionStatus::Connected;
            true
        })
    }
}

/// Decides which request may update the connection status.
///
/// A configured heartbeat holds authority for the agent's lifetime. Without one the
/// first attribute to ask claims it and keeps it until it is released on unlink.
#[derive(Debug, Default)]
pub struct StatusAuthority {
    holder: Mutex<Option<PollTarget>>,
}

impl StatusAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand authority to the heartbeat permanently.
    pub fn assign_heartbeat(&self) {
        *self.holder.lock() = Some(PollTarget::Heartbeat);
    }

    /// Whether `target` is authoritative, claiming a free slot for attributes.
    pub fn claim(&self, target: &PollTarget) -> bool {
        let mut holder = self.holder.lock();
        match (&*holder, target) {
            (Some(current), _) => current == target,
            (None, PollTarget::Attribute(_)) => {
                *holder = Some(target.clone());
                true
            }
            (None, PollTarget::Heartbeat) => false,
        }
    }

    /// Release authority held by `target`; the heartbeat is never released.
    pub fn release(&self, target: &PollTarget) {
        let mut holder = self.holder.lock();
        if matches!(target, PollTarget::Attribute(_)) && holder.as_ref() == Some(target) {
            *holder = None;
        }
    }

    pub fn holder(&self) -> Option<PollTarget> {
        self.holder.lock().clone()
    }

    pub fn clear(&self) {
        *self.holder.lock() = None;
    }
}
