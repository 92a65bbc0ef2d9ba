//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP agent connector linking attributes to upstream endpoints."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifies one attribute slot on an entity (asset or device).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeRef {
    /// Owning entity identifier.
    pub entity_id: String,
    /// Attribute name on that entity.
    pub name: String,
}

impl AttributeRef {
    /// Build a reference from an entity id and attribute name.
    pub fn new(entity_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            name: name.into(),
        }
    }

    /// Reference to another attribute on the same entity.
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self::new(self.entity_id.clone(), name)
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_id, self.name)
    }
}

/// Narrow view of the attribute store owned by the wider platform.
///
/// The connector never inspects attribute metadata; values are opaque JSON once decoded.
pub trait AttributeStore: Send + Sync + 'static {
    /// Latest value that should be sent outbound for the attribute, if any.
    fn read_command_value(&self, attribute: &AttributeRef) -> Option<Value>;

    /// Apply a decoded inbound value.
    fn write_attribute_value(
        &self,
        attribute: &AttributeRef,
        value: Value,
        timestamp: DateTime<Utc>,
    );
}

/// Value recorded by [`InMemoryAttributeStore`] together with its timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    /// Decoded value.
    pub value: Value,
    /// Timestamp supplied by the connector.
    pub timestamp: DateTime<Utc>,
}

/// In-memory attribute store used by simulations and tests.
#[derive(Debug, Default)]
pub struct InMemoryAttributeStore {
    commands: Mutex<HashMap<AttributeRef, Value>>,
    values: Mutex<HashMap<AttributeRef, StoredValue>>,
    history: Mutex<Vec<(AttributeRef, StoredValue)>>,
}

impl InMemoryAttributeStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the command value returned for the attribute.
    pub fn set_command_value(&self, attribute: &AttributeRef, value: Value) {
        self.commands.lock().insert(attribute.clone(), value);
    }

    /// Most recent inbound value written for the attribute.
    pub fn value(&self, attribute: &AttributeRef) -> Option<StoredValue> {
        self.values.lock().get(attribute).cloned()
    }

    /// Every write in arrival order.
    pub fn history(&self) -> Vec<(AttributeRef, StoredValue)> {
        self.history.lock().clone()
    }

    /// Number of writes received for one attribute.
    pub fn write_count(&self, attribute: &AttributeRef) -> usize {
        self.history
            .lock()
            .iter()
            .filter(|(target, _)| target == attribute)
            .count()
    }
}

impl AttributeStore for InMemoryAttributeStore {
    fn read_command_value(&self, attribute: &AttributeRef) -> Option<Value> {
        self.commands.lock().get(attribute).cloned()
    }

    fn write_attribute_value(
        &self,
        attribute: &AttributeRef,
        value: Value,
        timestamp: DateTime<Utc>,
    ) {
        let stored = StoredValue { value, timestamp };
        self.values.lock().insert(attribute.clone(), stored.clone());
        self.history.lock().push((attribute.clone(), stored));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn refs_compare_by_entity_and_name() {
        let a = AttributeRef::new("meter-1", "power");
        let b = AttributeRef::new("meter-1", "power");
        let c = AttributeRef::new("meter-2", "power");
        let set: HashSet<_> = [a.clone(), b, c.clone()].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(a.sibling("energy"), AttributeRef::new("meter-1", "energy"));
        assert_eq!(c.to_string(), "meter-2:power");
    }

    #[test]
    fn in_memory_store_records_history() {
        let store = InMemoryAttributeStore::new();
        let attr = AttributeRef::new("meter-1", "power");
        assert!(store.read_command_value(&attr).is_none());
        store.set_command_value(&attr, json!(42));
        assert_eq!(store.read_command_value(&attr), Some(json!(42)));

        let now = Utc::now();
        store.write_attribute_value(&attr, json!("1.5"), now);
        store.write_attribute_value(&attr, json!("1.6"), now);
        assert_eq!(store.write_count(&attr), 2);
        assert_eq!(store.value(&attr).unwrap().value, json!("1.6"));
    }
}
