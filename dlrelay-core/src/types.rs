//! Core domain types for dlrelay
//!
//! These types model what page code pushes onto the observed queue and what
//! the relay hands to the transport.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Event Record** | A key/value object pushed by application code |
//! | **Event name** | The value under the reserved `event` key |
//! | **Outbound parameters** | The reshaped, scalar-only parameter set sent with an event |
//! | **Bundle** | One serialized string holding every parameter that is not well-known |
//!
//! ## Shared nodes
//!
//! Objects and arrays are reference-counted, interior-mutable nodes. Page
//! code can hold on to a pushed object and keep mutating it, or make it
//! point at itself; the relay never assumes a tree. Anything that walks a
//! value (serialization, coercion, `Debug`) tracks the nodes it is inside.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Number;

use crate::shape::safe_stringify;

/// Reserved key naming the event on a pushed record.
pub const EVENT_KEY: &str = "event";

/// Shared handle to an object node.
pub type ObjectRef = Rc<RefCell<Fields>>;

/// Shared handle to an array node.
pub type ArrayRef = Rc<RefCell<Vec<EventValue>>>;

// ============================================
// Event values
// ============================================

/// A value as page code can push it.
#[derive(Clone)]
pub enum EventValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(ArrayRef),
    Object(ObjectRef),
}

impl EventValue {
    /// Wrap fields into a fresh object node.
    pub fn object(fields: Fields) -> Self {
        EventValue::Object(Rc::new(RefCell::new(fields)))
    }

    /// Wrap items into a fresh array node.
    pub fn array(items: Vec<EventValue>) -> Self {
        EventValue::Array(Rc::new(RefCell::new(items)))
    }

    /// `null` and `""` count as empty; everything else, including `0`
    /// and `false`, is a value worth keeping.
    pub fn is_empty_value(&self) -> bool {
        match self {
            EventValue::Null => true,
            EventValue::String(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            EventValue::Null => "null",
            EventValue::Bool(_) => "boolean",
            EventValue::Number(_) => "number",
            EventValue::String(_) => "string",
            EventValue::Array(_) => "array",
            EventValue::Object(_) => "object",
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            EventValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            EventValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for EventValue {
    fn eq(&self, other: &Self) -> bool {
        values_eq(self, other, &mut Vec::new())
    }
}

/// Node pairs currently being compared.
type Comparing = Vec<(*const (), *const ())>;

/// Structural equality. A pair of nodes already under comparison counts as
/// equal, so self-referencing values terminate.
fn values_eq(a: &EventValue, b: &EventValue, comparing: &mut Comparing) -> bool {
    match (a, b) {
        (EventValue::Null, EventValue::Null) => true,
        (EventValue::Bool(a), EventValue::Bool(b)) => a == b,
        (EventValue::Number(a), EventValue::Number(b)) => a == b,
        (EventValue::String(a), EventValue::String(b)) => a == b,
        (EventValue::Array(a), EventValue::Array(b)) => nodes_eq(a, b, comparing, |a, b, comparing| {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| values_eq(a, b, comparing))
        }),
        (EventValue::Object(a), EventValue::Object(b)) => nodes_eq(a, b, comparing, fields_eq),
        _ => false,
    }
}

fn nodes_eq<T>(
    a: &Rc<RefCell<T>>,
    b: &Rc<RefCell<T>>,
    comparing: &mut Comparing,
    compare: impl FnOnce(&T, &T, &mut Comparing) -> bool,
) -> bool {
    if Rc::ptr_eq(a, b) {
        return true;
    }
    let pair = (Rc::as_ptr(a) as *const (), Rc::as_ptr(b) as *const ());
    if comparing.contains(&pair) {
        return true;
    }
    // A node mutably borrowed elsewhere cannot be inspected.
    let (Ok(left), Ok(right)) = (a.try_borrow(), b.try_borrow()) else {
        return false;
    };
    comparing.push(pair);
    let equal = compare(&left, &right, comparing);
    comparing.pop();
    equal
}

fn fields_eq(a: &Fields, b: &Fields, comparing: &mut Comparing) -> bool {
    a.len() == b.len()
        && a
            .entries
            .iter()
            .zip(&b.entries)
            .all(|((ka, va), (kb, vb))| ka == kb && values_eq(va, vb, comparing))
}

impl fmt::Debug for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&safe_stringify(self))
    }
}

impl From<serde_json::Value> for EventValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => EventValue::Null,
            serde_json::Value::Bool(b) => EventValue::Bool(b),
            serde_json::Value::Number(n) => EventValue::Number(n),
            serde_json::Value::String(s) => EventValue::String(s),
            serde_json::Value::Array(items) => {
                EventValue::array(items.into_iter().map(EventValue::from).collect())
            }
            serde_json::Value::Object(map) => EventValue::object(Fields::from(map)),
        }
    }
}

impl From<&str> for EventValue {
    fn from(value: &str) -> Self {
        EventValue::String(value.to_string())
    }
}

impl From<String> for EventValue {
    fn from(value: String) -> Self {
        EventValue::String(value)
    }
}

impl From<bool> for EventValue {
    fn from(value: bool) -> Self {
        EventValue::Bool(value)
    }
}

impl From<i64> for EventValue {
    fn from(value: i64) -> Self {
        EventValue::Number(value.into())
    }
}

impl From<i32> for EventValue {
    fn from(value: i32) -> Self {
        EventValue::Number(value.into())
    }
}

// ============================================
// Fields
// ============================================

/// Insertion-ordered string-keyed map.
#[derive(Clone, Default)]
pub struct Fields {
    entries: Vec<(String, EventValue)>,
}

impl PartialEq for Fields {
    fn eq(&self, other: &Self) -> bool {
        fields_eq(self, other, &mut Vec::new())
    }
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&EventValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Insert or replace. A replaced key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: EventValue) -> Option<EventValue> {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<EventValue> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EventValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl fmt::Debug for Fields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl FromIterator<(String, EventValue)> for Fields {
    fn from_iter<I: IntoIterator<Item = (String, EventValue)>>(iter: I) -> Self {
        let mut fields = Fields::new();
        for (k, v) in iter {
            fields.insert(k, v);
        }
        fields
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for Fields {
    fn from(map: serde_json::Map<String, serde_json::Value>) -> Self {
        map.into_iter()
            .map(|(k, v)| (k, EventValue::from(v)))
            .collect()
    }
}

// ============================================
// Outbound parameters
// ============================================

/// Scalar value allowed at the top level of an outbound parameter set.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Null => f.write_str("null"),
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Number(n) => write!(f, "{}", n),
            ParamValue::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

/// Ordered parameter set handed to the transport with an event or config call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundParams {
    entries: Vec<(String, ParamValue)>,
}

impl OutboundParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Insert or replace. A replaced key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: ParamValue) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Compact JSON object form, keys in insertion order.
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Serialize for OutboundParams {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fields_preserve_insertion_order() {
        let mut fields = Fields::new();
        fields.insert("b", EventValue::from(1));
        fields.insert("a", EventValue::from(2));
        fields.insert("b", EventValue::from(3));

        let keys: Vec<&str> = fields.keys().collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(fields.get("b"), Some(&EventValue::from(3)));

        fields.remove("b");
        assert_eq!(fields.keys().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn test_from_json_value() {
        let value = EventValue::from(json!({"event": "purchase", "items": [1, 2], "meta": null}));
        let obj = value.as_object().unwrap().borrow();

        assert_eq!(obj.get("event").and_then(EventValue::as_str), Some("purchase"));
        assert_eq!(obj.get("meta"), Some(&EventValue::Null));
        assert!(matches!(obj.get("items"), Some(EventValue::Array(_))));
    }

    #[test]
    fn test_self_referencing_values_compare() {
        let loop_named = |name: &str| {
            let value = EventValue::object(Fields::new());
            let obj = value.as_object().unwrap().clone();
            obj.borrow_mut().insert("name", EventValue::from(name));
            obj.borrow_mut().insert("me", value.clone());
            (value, obj)
        };
        let (a, a_obj) = loop_named("loop");
        let (b, b_obj) = loop_named("loop");
        let (c, c_obj) = loop_named("other");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, a.clone());

        for obj in [a_obj, b_obj, c_obj] {
            obj.borrow_mut().remove("me");
        }
    }

    #[test]
    fn test_empty_values() {
        assert!(EventValue::Null.is_empty_value());
        assert!(EventValue::from("").is_empty_value());
        assert!(!EventValue::from(0).is_empty_value());
        assert!(!EventValue::from(false).is_empty_value());
        assert!(!EventValue::from(" ").is_empty_value());
    }

    #[test]
    fn test_outbound_params_serialize_in_order() {
        let mut params = OutboundParams::new();
        params.insert("value", ParamValue::Number(10.into()));
        params.insert("currency", ParamValue::from("EUR"));
        params.insert("debug_mode", ParamValue::Null);

        assert_eq!(
            params.to_json_string(),
            r#"{"value":10,"currency":"EUR","debug_mode":null}"#
        );
    }
}
