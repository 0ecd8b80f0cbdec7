//! The per-record pipeline behind every push.

use crate::config::Config;
use crate::filter::FilterEngine;
use crate::persist::PersistentFieldStore;
use crate::shape::{coerce_to_string, ParameterShaper};
use crate::types::{EventValue, Fields, OutboundParams, ParamValue, EVENT_KEY};

/// Key the routing identifier is attached under.
pub const ROUTING_KEY: &str = "send_to";

/// What became of one pushed entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Not an object, or not readable
    Ignored,
    /// An object without an event name; only persistence saw it
    DataOnly,
    Blocked { name: String },
    Forward { name: String, params: OutboundParams },
}

/// Filter, persistence and shaping for observed records.
#[derive(Debug, Clone)]
pub struct Interceptor {
    filter: FilterEngine,
    shaper: ParameterShaper,
    persistence: PersistentFieldStore,
    routing_id: String,
    processed: u64,
    blocked: u64,
}

impl Interceptor {
    pub fn new(config: &Config) -> Self {
        Self {
            filter: FilterEngine::new(&config.filter),
            shaper: ParameterShaper::new(&config.params),
            persistence: PersistentFieldStore::new(&config.persistence),
            routing_id: config.relay.measurement_id.clone(),
            processed: 0,
            blocked: 0,
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn blocked(&self) -> u64 {
        self.blocked
    }

    pub fn persistence(&self) -> &PersistentFieldStore {
        &self.persistence
    }

    /// Run one entry through persistence, filtering and shaping.
    pub fn process(&mut self, entry: &EventValue) -> Outcome {
        let EventValue::Object(obj) = entry else {
            tracing::trace!(value_type = entry.type_name(), "Ignoring non-object entry");
            return Outcome::Ignored;
        };
        let Ok(record) = obj.try_borrow() else {
            tracing::debug!("Ignoring entry that is being modified");
            return Outcome::Ignored;
        };

        self.persistence.observe(&record);

        let Some(raw_name) = record.get(EVENT_KEY) else {
            return Outcome::DataOnly;
        };
        self.processed += 1;

        let name = event_name(raw_name);
        if self.filter.is_event_blocked(&name) {
            self.blocked += 1;
            tracing::debug!(event = %name, blocked = self.blocked, "Event blocked");
            return Outcome::Blocked { name };
        }

        let params = self.shape(&record);
        Outcome::Forward { name, params }
    }

    fn shape(&self, record: &Fields) -> OutboundParams {
        let merged = self.persistence.merge_into(record);
        let mut params = self.shaper.shape(&merged, &self.filter);
        params.insert(ROUTING_KEY, ParamValue::from(self.routing_id.as_str()));
        params
    }
}

/// The event name as a page script would read it.
///
/// Falsy values (`null`, `false`, `0`, `""`) give an empty name; anything
/// else is coerced to text and trimmed.
pub fn event_name(value: &EventValue) -> String {
    let falsy = match value {
        EventValue::Null => true,
        EventValue::Bool(b) => !b,
        EventValue::Number(n) => n.as_f64().map_or(false, |f| f == 0.0),
        EventValue::String(s) => s.is_empty(),
        EventValue::Array(_) | EventValue::Object(_) => false,
    };
    if falsy {
        return String::new();
    }
    coerce_to_string(value).trim().to_string()
}
