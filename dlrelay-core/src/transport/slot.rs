//! The single slot holding the transport handle.
//!
//! Two owners contend for this slot: the relay, and whatever the loaded
//! transport script (or any other code on the page) decides to install.
//! A guarded slot still accepts every write, so integrations keep working,
//! but each write is classified and appended to an audit log.

use std::fmt;
use std::panic::Location;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::GuardConfig;

use super::{TransportCommand, TransportHandle};

/// Source marker the relay stamps on its own writes.
pub const RELAY_SOURCE: &str = "dlrelay://relay";

/// Where a write to the slot came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    trace: String,
}

impl CallSite {
    pub fn new(trace: impl Into<String>) -> Self {
        Self {
            trace: trace.into(),
        }
    }

    /// A write made by code loaded from `url`.
    pub fn script(url: &str) -> Self {
        Self::new(format!("at {}", url))
    }

    /// The Rust source location of the caller.
    #[track_caller]
    pub fn here() -> Self {
        let loc = Location::caller();
        Self::new(format!("at {}:{}:{}", loc.file(), loc.line(), loc.column()))
    }

    pub(crate) fn relay() -> Self {
        Self::new(format!("at {}", RELAY_SOURCE))
    }

    pub fn trace(&self) -> &str {
        &self.trace
    }
}

/// Classification of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriteOrigin {
    /// The relay itself or a script it loaded
    #[serde(rename = "self")]
    Internal,
    #[serde(rename = "external")]
    External,
}

impl WriteOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOrigin::Internal => "self",
            WriteOrigin::External => "external",
        }
    }
}

/// One recorded write attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub value_type: String,
    /// Handle description, truncated
    pub preview: String,
    pub trace: String,
    pub origin: WriteOrigin,
}

#[derive(Debug)]
struct Guard {
    known_sources: Vec<String>,
    preview_chars: usize,
    audit: Vec<AuditEntry>,
}

/// Owner of the current transport handle.
pub struct HandleSlot {
    handle: Option<Box<dyn TransportHandle>>,
    guard: Option<Guard>,
}

impl HandleSlot {
    pub fn unguarded() -> Self {
        Self {
            handle: None,
            guard: None,
        }
    }

    pub fn guarded(preview_chars: usize) -> Self {
        Self {
            handle: None,
            guard: Some(Guard {
                known_sources: vec![RELAY_SOURCE.to_string()],
                preview_chars,
                audit: Vec::new(),
            }),
        }
    }

    pub fn from_config(config: &GuardConfig) -> Self {
        if config.enabled {
            Self::guarded(config.preview_chars)
        } else {
            Self::unguarded()
        }
    }

    pub fn is_guarded(&self) -> bool {
        self.guard.is_some()
    }

    /// Treat writes whose trace mentions `source` as the relay's own.
    pub fn trust(&mut self, source: impl Into<String>) {
        if let Some(guard) = &mut self.guard {
            let source = source.into();
            if !guard.known_sources.contains(&source) {
                guard.known_sources.push(source);
            }
        }
    }

    /// The tracked handle.
    pub fn get(&self) -> Option<&dyn TransportHandle> {
        self.handle.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.handle.is_none()
    }

    pub fn holds_placeholder(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| h.is_placeholder())
    }

    /// Classify a write without performing it.
    pub fn classify(&self, site: &CallSite) -> WriteOrigin {
        let known = self
            .guard
            .as_ref()
            .map(|g| g.known_sources.as_slice())
            .unwrap_or(&[]);
        if known.iter().any(|source| site.trace.contains(source.as_str())) {
            WriteOrigin::Internal
        } else {
            WriteOrigin::External
        }
    }

    /// Install a new handle, returning the previous one.
    ///
    /// Every write is accepted. On a guarded slot the attempt is recorded
    /// first, with its origin. Replacing the placeholder with a real handle
    /// replays the placeholder's backlog into the new handle.
    pub fn set(
        &mut self,
        mut handle: Box<dyn TransportHandle>,
        site: &CallSite,
    ) -> Option<Box<dyn TransportHandle>> {
        if self.guard.is_some() {
            let origin = self.classify(site);
            if let Some(guard) = &mut self.guard {
                let entry = AuditEntry {
                    at: Utc::now(),
                    value_type: handle.kind().to_string(),
                    preview: truncate(&handle.describe(), guard.preview_chars),
                    trace: site.trace.clone(),
                    origin,
                };
                match origin {
                    WriteOrigin::Internal => tracing::debug!(
                        value_type = %entry.value_type,
                        trace = %entry.trace,
                        "Transport handle replaced"
                    ),
                    WriteOrigin::External => tracing::warn!(
                        value_type = %entry.value_type,
                        trace = %entry.trace,
                        "Transport handle overwritten by external code"
                    ),
                }
                guard.audit.push(entry);
            }
        }

        if !handle.is_placeholder() {
            if let Some(previous) = self.handle.as_mut().filter(|h| h.is_placeholder()) {
                let backlog = previous.take_backlog();
                if !backlog.is_empty() {
                    tracing::debug!(count = backlog.len(), "Replaying placeholder backlog");
                }
                for command in backlog {
                    handle.call(command);
                }
            }
        }

        self.handle.replace(handle)
    }

    /// Invoke the tracked handle. Returns false when the slot is empty.
    pub fn call(&mut self, command: TransportCommand) -> bool {
        match &mut self.handle {
            Some(handle) => {
                handle.call(command);
                true
            }
            None => false,
        }
    }

    /// Append-only record of write attempts (empty when unguarded).
    pub fn audit_log(&self) -> &[AuditEntry] {
        self.guard
            .as_ref()
            .map(|g| g.audit.as_slice())
            .unwrap_or(&[])
    }
}

impl fmt::Debug for HandleSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleSlot")
            .field("handle", &self.handle.as_ref().map(|h| h.describe()))
            .field("guard", &self.guard)
            .finish()
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
