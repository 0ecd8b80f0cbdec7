//! Cycle-safe serialization and string coercion for event values.
//!
//! Serialization never fails from the caller's point of view: a node that
//! points back at one of its ancestors is written as [`CIRCULAR_MARKER`],
//! and a node that cannot be read at all makes the whole value fall back to
//! [`coerce_to_string`].

use serde_json::{Map, Number, Value};

use crate::types::EventValue;

/// Written in place of a reference back to an enclosing object or array.
pub const CIRCULAR_MARKER: &str = "[Circular]";

/// A node was mutably borrowed while we tried to read it.
struct Unreadable;

/// Convert to a JSON value, replacing back-references with the marker.
///
/// Returns `None` when some node is currently borrowed for writing.
pub fn to_json(value: &EventValue) -> Option<Value> {
    let mut ancestors = Vec::new();
    to_json_inner(value, &mut ancestors).ok()
}

fn to_json_inner(value: &EventValue, ancestors: &mut Vec<*const ()>) -> Result<Value, Unreadable> {
    match value {
        EventValue::Null => Ok(Value::Null),
        EventValue::Bool(b) => Ok(Value::Bool(*b)),
        EventValue::Number(n) => Ok(Value::Number(n.clone())),
        EventValue::String(s) => Ok(Value::String(s.clone())),
        EventValue::Array(items) => {
            let ptr = items.as_ptr() as *const ();
            if ancestors.contains(&ptr) {
                return Ok(Value::String(CIRCULAR_MARKER.to_string()));
            }
            let items = items.try_borrow().map_err(|_| Unreadable)?;
            ancestors.push(ptr);
            let out = items
                .iter()
                .map(|item| to_json_inner(item, ancestors))
                .collect::<Result<Vec<_>, _>>();
            ancestors.pop();
            out.map(Value::Array)
        }
        EventValue::Object(fields) => {
            let ptr = fields.as_ptr() as *const ();
            if ancestors.contains(&ptr) {
                return Ok(Value::String(CIRCULAR_MARKER.to_string()));
            }
            let fields = fields.try_borrow().map_err(|_| Unreadable)?;
            ancestors.push(ptr);
            let mut map = Map::new();
            let mut result = Ok(());
            for (key, item) in fields.iter() {
                match to_json_inner(item, ancestors) {
                    Ok(v) => {
                        map.insert(key.to_string(), v);
                    }
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            ancestors.pop();
            result.map(|_| Value::Object(map))
        }
    }
}

/// Serialize to a compact JSON string without ever failing.
pub fn safe_stringify(value: &EventValue) -> String {
    match to_json(value) {
        Some(json) => serde_json::to_string(&json).unwrap_or_else(|_| coerce_to_string(value)),
        None => {
            tracing::debug!(
                value_type = value.type_name(),
                "Value not readable for serialization, coercing to string"
            );
            coerce_to_string(value)
        }
    }
}

/// Plain string form, the way page scripts turn values into text.
///
/// Objects print as `[object Object]`; arrays join their elements with
/// commas, printing `null` elements and back-references as nothing.
pub fn coerce_to_string(value: &EventValue) -> String {
    let mut ancestors = Vec::new();
    coerce_inner(value, &mut ancestors)
}

fn coerce_inner(value: &EventValue, ancestors: &mut Vec<*const ()>) -> String {
    match value {
        EventValue::Null => "null".to_string(),
        EventValue::Bool(b) => b.to_string(),
        EventValue::Number(n) => number_to_string(n),
        EventValue::String(s) => s.clone(),
        EventValue::Object(_) => "[object Object]".to_string(),
        EventValue::Array(items) => {
            let ptr = items.as_ptr() as *const ();
            if ancestors.contains(&ptr) {
                return String::new();
            }
            let Ok(items) = items.try_borrow() else {
                return String::new();
            };
            ancestors.push(ptr);
            let parts: Vec<String> = items
                .iter()
                .map(|item| match item {
                    EventValue::Null => String::new(),
                    other => coerce_inner(other, ancestors),
                })
                .collect();
            ancestors.pop();
            parts.join(",")
        }
    }
}

/// Shortest round-trip form, as page script would print the number.
///
/// Magnitudes below `1e-6` or from `1e21` up switch to exponent notation
/// with an explicit sign (`1e-7`, `1e+21`). Negative zero prints as `0`.
pub fn number_to_string(n: &Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    let Some(f) = n.as_f64() else {
        return n.to_string();
    };
    if f == 0.0 {
        return "0".to_string();
    }
    if f.abs() < 1e-6 || f.abs() >= 1e21 {
        let formatted = format!("{:e}", f);
        return match formatted.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{}e+{}", mantissa, exp),
            _ => formatted,
        };
    }
    f.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Fields;
    use serde_json::json;

    #[test]
    fn test_stringify_plain_values() {
        let value = EventValue::from(json!({"n": 2, "list": ["a", null], "ok": true}));
        assert_eq!(safe_stringify(&value), r#"{"n":2,"list":["a",null],"ok":true}"#);
    }

    #[test]
    fn test_number_formatting() {
        let float = |f: f64| number_to_string(&Number::from_f64(f).unwrap());

        assert_eq!(number_to_string(&Number::from(42)), "42");
        assert_eq!(float(10.0), "10");
        assert_eq!(float(-0.0), "0");
        assert_eq!(float(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(float(0.000001), "0.000001");
        assert_eq!(float(1e-7), "1e-7");
        assert_eq!(float(-1.5e-7), "-1.5e-7");
        assert_eq!(float(1e20), "100000000000000000000");
        assert_eq!(float(1e21), "1e+21");
        assert_eq!(float(2.5e300), "2.5e+300");
    }

    #[test]
    fn test_stringify_self_reference() {
        let value = EventValue::object(Fields::new());
        let obj = value.as_object().unwrap().clone();
        obj.borrow_mut().insert("name", EventValue::from("loop"));
        obj.borrow_mut().insert("me", value.clone());

        let out = safe_stringify(&value);
        assert_eq!(out, r#"{"name":"loop","me":"[Circular]"}"#);
    }

    #[test]
    fn test_shared_non_cyclic_node_is_written_twice() {
        let shared = EventValue::from(json!({"x": 1}));
        let mut fields = Fields::new();
        fields.insert("a", shared.clone());
        fields.insert("b", shared);

        assert_eq!(
            safe_stringify(&EventValue::object(fields)),
            r#"{"a":{"x":1},"b":{"x":1}}"#
        );
    }

    #[test]
    fn test_array_cycle() {
        let value = EventValue::array(vec![EventValue::from(1)]);
        if let EventValue::Array(items) = &value {
            items.borrow_mut().push(value.clone());
        }
        assert_eq!(safe_stringify(&value), r#"[1,"[Circular]"]"#);
        assert_eq!(coerce_to_string(&value), "1,");
    }

    #[test]
    fn test_unreadable_node_falls_back_to_coercion() {
        let value = EventValue::from(json!({"a": 1}));
        let obj = value.as_object().unwrap().clone();
        let _guard = obj.borrow_mut();

        assert_eq!(safe_stringify(&value), "[object Object]");
    }

    #[test]
    fn test_coerce_to_string() {
        assert_eq!(coerce_to_string(&EventValue::Null), "null");
        assert_eq!(coerce_to_string(&EventValue::from(true)), "true");
        assert_eq!(coerce_to_string(&EventValue::from(json!(2.0))), "2");
        assert_eq!(coerce_to_string(&EventValue::from(json!(2.5))), "2.5");
        assert_eq!(coerce_to_string(&EventValue::from(json!([1, [2, 3], null]))), "1,2,3,");
        assert_eq!(coerce_to_string(&EventValue::from(json!({"a": 1}))), "[object Object]");
    }
}
