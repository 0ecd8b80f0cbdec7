//! Event-name and parameter-key filtering.

use std::collections::HashSet;

use crate::config::FilterConfig;

/// Pure predicates deciding what is eligible for forwarding.
#[derive(Debug, Clone)]
pub struct FilterEngine {
    blocked_event_prefixes: Vec<String>,
    param_denylist: HashSet<String>,
    param_deny_prefixes: Vec<String>,
}

impl FilterEngine {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            blocked_event_prefixes: non_empty(&config.blocked_event_prefixes, "blocked_event_prefixes"),
            param_denylist: config.param_denylist.iter().cloned().collect(),
            param_deny_prefixes: non_empty(&config.param_deny_prefixes, "param_deny_prefixes"),
        }
    }

    /// True when the trimmed name is empty or starts with a blocked prefix.
    pub fn is_event_blocked(&self, name: &str) -> bool {
        let name = name.trim();
        name.is_empty() || starts_with_any(name, &self.blocked_event_prefixes)
    }

    /// True when the key is denylisted exactly or starts with a denied prefix.
    pub fn is_param_denied(&self, key: &str) -> bool {
        self.param_denylist.contains(key) || starts_with_any(key, &self.param_deny_prefixes)
    }
}

fn starts_with_any(value: &str, prefixes: &[String]) -> bool {
    !value.is_empty() && prefixes.iter().any(|p| value.starts_with(p.as_str()))
}

/// An empty prefix would match everything; drop it.
fn non_empty(prefixes: &[String], setting: &str) -> Vec<String> {
    prefixes
        .iter()
        .filter(|p| {
            if p.is_empty() {
                tracing::warn!(setting, "Ignoring empty prefix");
                false
            } else {
                true
            }
        })
        .cloned()
        .collect()
}
