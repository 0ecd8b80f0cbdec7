//! Carry-over fields
//!
//! Some values describe the visitor rather than a single event (membership
//! tier, experiment bucket). Once any push sets one of the configured
//! fields it is merged into every later event until a push clears it with
//! `null` or `""`.

use std::borrow::Cow;

use crate::config::PersistenceConfig;
use crate::types::{EventValue, Fields};

/// Tracks the last non-empty value of each configured field.
#[derive(Debug, Clone, Default)]
pub struct PersistentFieldStore {
    fields: Vec<String>,
    state: Fields,
}

impl PersistentFieldStore {
    pub fn new(config: &PersistenceConfig) -> Self {
        Self {
            fields: config.fields.clone(),
            state: Fields::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.fields.is_empty()
    }

    /// Current carried values.
    pub fn state(&self) -> &Fields {
        &self.state
    }

    /// Record or clear configured fields present on `record`.
    pub fn observe(&mut self, record: &Fields) {
        for field in &self.fields {
            let Some(value) = record.get(field) else {
                continue;
            };

            if !value.is_empty_value() {
                tracing::debug!(field = %field, value = ?value, "Persistent field updated");
                self.state.insert(field.clone(), value.clone());
            } else if self.state.remove(field).is_some() {
                tracing::debug!(field = %field, "Persistent field cleared");
            }
        }
    }

    /// Carried values overlaid by the record's own keys.
    ///
    /// Borrows the record unchanged when there is nothing to carry.
    pub fn merge_into<'a>(&self, record: &'a Fields) -> Cow<'a, Fields> {
        if !self.is_enabled() || self.state.is_empty() {
            return Cow::Borrowed(record);
        }

        let mut merged: Fields = self
            .state
            .iter()
            .filter(|(_, v)| !v.is_empty_value())
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();

        for (key, value) in record.iter() {
            merged.insert(key, value.clone());
        }

        Cow::Owned(merged)
    }

    /// Snapshot of the carried values as a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        crate::shape::to_json(&EventValue::object(self.state.clone()))
            .unwrap_or(serde_json::Value::Null)
    }
}
