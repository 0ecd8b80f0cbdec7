//! Parameter shaping
//!
//! Turns a merged record into the parameter set sent with an event:
//!
//! ```text
//! { event, page_title, gtm.start, label, custom }      (merged record)
//!         │
//!         ├─ event, gtm.*        → dropped
//!         ├─ page_title          → top level, scalar
//!         └─ label, custom       → one serialized bundle
//!         ▼
//! { page_title, datalayer: "{\"label\":..,\"custom\":..}" }
//! ```

mod serialize;

pub use serialize::{coerce_to_string, number_to_string, safe_stringify, to_json, CIRCULAR_MARKER};

use std::collections::HashSet;

use crate::config::ParamsConfig;
use crate::filter::FilterEngine;
use crate::types::{EventValue, Fields, OutboundParams, ParamValue, EVENT_KEY};

/// Splits records into well-known top-level parameters and a bundle.
#[derive(Debug, Clone)]
pub struct ParameterShaper {
    well_known: HashSet<String>,
    bundle_key: String,
}

impl ParameterShaper {
    pub fn new(config: &ParamsConfig) -> Self {
        Self {
            well_known: config.well_known.iter().cloned().collect(),
            bundle_key: config.bundle_param_name.clone(),
        }
    }

    /// Key the bundle is attached under.
    pub fn bundle_key(&self) -> &str {
        &self.bundle_key
    }

    pub fn is_well_known(&self, key: &str) -> bool {
        self.well_known.contains(key)
    }

    /// Build the outbound parameter set for a merged record.
    ///
    /// The event-name key and denied keys never reach the output. Well-known
    /// keys keep their position at the top level; everything else lands in
    /// the bundle, which is attached last and only when non-empty.
    pub fn shape(&self, merged: &Fields, filter: &FilterEngine) -> OutboundParams {
        let mut params = OutboundParams::new();
        let mut bundle = Fields::new();

        for (key, value) in merged.iter() {
            if key == EVENT_KEY || filter.is_param_denied(key) {
                continue;
            }

            if self.is_well_known(key) {
                params.insert(key, normalize_value(value));
            } else {
                bundle.insert(key, value.clone());
            }
        }

        if !bundle.is_empty() {
            let serialized = safe_stringify(&EventValue::object(bundle));
            params.insert(self.bundle_key.clone(), ParamValue::String(serialized));
        }

        params
    }
}

/// Scalars pass through; objects and arrays become their JSON text.
pub fn normalize_value(value: &EventValue) -> ParamValue {
    match value {
        EventValue::Null => ParamValue::Null,
        EventValue::Bool(b) => ParamValue::Bool(*b),
        EventValue::Number(n) => ParamValue::Number(n.clone()),
        EventValue::String(s) => ParamValue::String(s.clone()),
        EventValue::Array(_) | EventValue::Object(_) => ParamValue::String(safe_stringify(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterConfig, ParamsConfig};
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        match value {
            serde_json::Value::Object(map) => Fields::from(map),
            _ => panic!("expected object"),
        }
    }

    fn shaper() -> (ParameterShaper, FilterEngine) {
        (
            ParameterShaper::new(&ParamsConfig::default()),
            FilterEngine::new(&FilterConfig::default()),
        )
    }

    #[test]
    fn test_well_known_stay_top_level() {
        let (shaper, filter) = shaper();
        let merged = fields(json!({"event": "purchase", "value": 10, "currency": "EUR"}));

        let params = shaper.shape(&merged, &filter);
        assert_eq!(params.get("value"), Some(&ParamValue::Number(10.into())));
        assert_eq!(params.get("currency"), Some(&ParamValue::from("EUR")));
        assert!(!params.contains_key("event"));
        assert!(!params.contains_key("datalayer"));
    }

    #[test]
    fn test_unknown_keys_are_bundled() {
        let (shaper, filter) = shaper();
        let merged = fields(json!({
            "event": "click",
            "label": "x",
            "custom_a": 1,
            "custom_b": {"n": 2}
        }));

        let params = shaper.shape(&merged, &filter);
        assert_eq!(params.keys().collect::<Vec<_>>(), vec!["datalayer"]);

        let bundle: serde_json::Value =
            serde_json::from_str(params.get("datalayer").unwrap().as_str().unwrap()).unwrap();
        assert_eq!(bundle, json!({"label": "x", "custom_a": 1, "custom_b": {"n": 2}}));
    }

    #[test]
    fn test_denied_keys_never_appear() {
        let (shaper, filter) = shaper();
        let merged = fields(json!({
            "event": "view",
            "gtm.start": 123,
            "gtm.uniqueEventId": 7,
            "gtmCustom": "x",
            "send_to": "G-OTHER",
            "eventCallback": "fn",
            "page_title": "Home"
        }));

        let params = shaper.shape(&merged, &filter);
        assert_eq!(params.keys().collect::<Vec<_>>(), vec!["page_title"]);
    }

    #[test]
    fn test_well_known_objects_are_serialized() {
        let (shaper, filter) = shaper();
        let merged = fields(json!({"items": [{"item_id": "sku-1"}], "debug_mode": null}));

        let params = shaper.shape(&merged, &filter);
        assert_eq!(
            params.get("items"),
            Some(&ParamValue::from(r#"[{"item_id":"sku-1"}]"#))
        );
        assert_eq!(params.get("debug_mode"), Some(&ParamValue::Null));
    }

    #[test]
    fn test_shaping_is_idempotent() {
        let (shaper, filter) = shaper();
        let merged = fields(json!({"event": "e", "value": 1.5, "z": [1, {"a": null}], "a": "b"}));

        let first = shaper.shape(&merged, &filter);
        let second = shaper.shape(&merged, &filter);
        assert_eq!(first, second);
        assert_eq!(first.to_json_string(), second.to_json_string());
    }

    #[test]
    fn test_custom_bundle_key() {
        let config = ParamsConfig {
            bundle_param_name: "extra".to_string(),
            ..Default::default()
        };
        let shaper = ParameterShaper::new(&config);
        let filter = FilterEngine::new(&FilterConfig::default());

        let params = shaper.shape(&fields(json!({"foo": "bar"})), &filter);
        assert_eq!(params.get("extra"), Some(&ParamValue::from(r#"{"foo":"bar"}"#)));
    }
}
