//! Transport handle, gate and delivery
//!
//! The relay never talks to the analytics backend directly. Every outbound
//! call goes through one [`TransportHandle`] held in a [`HandleSlot`], with
//! the fixed positional shape `(command, target, payload)`:
//!
//! ```text
//! ("js",     <timestamp>,      -)
//! ("config", <measurement id>, { send_page_view, transport_url? })
//! ("event",  <event name>,     { ...shaped params, send_to })
//! ```
//!
//! The [`TransportGate`] decides whether an event is queued (transport not
//! ready yet) or sent straight through, and drains the queue exactly once
//! when the transport script settles.

mod gate;
mod http;
mod slot;

pub use gate::{GateState, Initialization, ScriptRequest, TransportGate};
pub use http::{CollectClient, DeliveryStats, DeliveryWorker, HttpScriptLoader, HttpTransport};
pub use slot::{AuditEntry, CallSite, HandleSlot, WriteOrigin, RELAY_SOURCE};

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::types::OutboundParams;

/// One call on the transport handle.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    /// Library initialization, stamped with the time it was issued
    Js { at: DateTime<Utc> },
    /// Property configuration
    Config {
        measurement_id: String,
        settings: OutboundParams,
    },
    /// A forwarded event
    Event { name: String, params: OutboundParams },
}

impl TransportCommand {
    /// First positional argument.
    pub fn command(&self) -> &'static str {
        match self {
            TransportCommand::Js { .. } => "js",
            TransportCommand::Config { .. } => "config",
            TransportCommand::Event { .. } => "event",
        }
    }

    /// Second positional argument: timestamp, measurement id or event name.
    pub fn target(&self) -> String {
        match self {
            TransportCommand::Js { at } => at.to_rfc3339_opts(SecondsFormat::Millis, true),
            TransportCommand::Config { measurement_id, .. } => measurement_id.clone(),
            TransportCommand::Event { name, .. } => name.clone(),
        }
    }

    /// Third positional argument, when there is one.
    pub fn payload(&self) -> Option<&OutboundParams> {
        match self {
            TransportCommand::Js { .. } => None,
            TransportCommand::Config { settings, .. } => Some(settings),
            TransportCommand::Event { params, .. } => Some(params),
        }
    }
}

impl fmt::Display for TransportCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gtag({:?}, {:?}", self.command(), self.target())?;
        if let Some(payload) = self.payload() {
            write!(f, ", {}", payload.to_json_string())?;
        }
        f.write_str(")")
    }
}

/// The callable that actually emits commands to the analytics system.
pub trait TransportHandle {
    /// Deliver one command. Must not fail; delivery problems are the
    /// handle's own business.
    fn call(&mut self, command: TransportCommand);

    /// Short type name, recorded when the handle is written to a guarded slot.
    fn kind(&self) -> &'static str;

    /// Human-readable description, truncated in audit entries.
    fn describe(&self) -> String {
        self.kind().to_string()
    }

    /// Placeholders only buffer commands until a real transport arrives.
    fn is_placeholder(&self) -> bool {
        false
    }

    /// Commands buffered so far; a replacing transport replays them.
    fn take_backlog(&mut self) -> Vec<TransportCommand> {
        Vec::new()
    }
}

/// Stand-in installed before the transport script has loaded.
#[derive(Debug, Default)]
pub struct PlaceholderHandle {
    backlog: Vec<TransportCommand>,
}

impl PlaceholderHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backlog(&self) -> &[TransportCommand] {
        &self.backlog
    }
}

impl TransportHandle for PlaceholderHandle {
    fn call(&mut self, command: TransportCommand) {
        self.backlog.push(command);
    }

    fn kind(&self) -> &'static str {
        "placeholder"
    }

    fn describe(&self) -> String {
        format!("placeholder queueing {} command(s)", self.backlog.len())
    }

    fn is_placeholder(&self) -> bool {
        true
    }

    fn take_backlog(&mut self) -> Vec<TransportCommand> {
        std::mem::take(&mut self.backlog)
    }
}

/// Shared record of every command a [`MemoryTransport`] received.
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    commands: Rc<RefCell<Vec<TransportCommand>>>,
}

impl CommandLog {
    pub fn commands(&self) -> Vec<TransportCommand> {
        self.commands.borrow().clone()
    }

    /// `(name, params)` of every event command, in delivery order.
    pub fn events(&self) -> Vec<(String, OutboundParams)> {
        self.commands
            .borrow()
            .iter()
            .filter_map(|c| match c {
                TransportCommand::Event { name, params } => Some((name.clone(), params.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events().into_iter().map(|(name, _)| name).collect()
    }

    pub fn len(&self) -> usize {
        self.commands.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.borrow().is_empty()
    }
}

/// In-process transport that records commands instead of sending them.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    log: CommandLog,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle onto the recorded commands; stays valid after the transport
    /// is boxed into a slot.
    pub fn log(&self) -> CommandLog {
        self.log.clone()
    }
}

impl TransportHandle for MemoryTransport {
    fn call(&mut self, command: TransportCommand) {
        self.log.commands.borrow_mut().push(command);
    }

    fn kind(&self) -> &'static str {
        "memory"
    }

    fn describe(&self) -> String {
        format!("memory transport ({} recorded)", self.log.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParamValue;

    #[test]
    fn test_command_positional_shape() {
        let mut params = OutboundParams::new();
        params.insert("value", ParamValue::Number(10.into()));
        let command = TransportCommand::Event {
            name: "purchase".to_string(),
            params,
        };

        assert_eq!(command.command(), "event");
        assert_eq!(command.target(), "purchase");
        assert_eq!(command.to_string(), r#"gtag("event", "purchase", {"value":10})"#);
    }

    #[test]
    fn test_placeholder_backlog() {
        let mut placeholder = PlaceholderHandle::new();
        placeholder.call(TransportCommand::Js { at: Utc::now() });
        assert!(placeholder.is_placeholder());
        assert_eq!(placeholder.describe(), "placeholder queueing 1 command(s)");

        let backlog = placeholder.take_backlog();
        assert_eq!(backlog.len(), 1);
        assert!(placeholder.backlog().is_empty());
    }

    #[test]
    fn test_memory_transport_log_survives_boxing() {
        let transport = MemoryTransport::new();
        let log = transport.log();
        let mut boxed: Box<dyn TransportHandle> = Box::new(transport);

        boxed.call(TransportCommand::Event {
            name: "click".to_string(),
            params: OutboundParams::new(),
        });
        assert_eq!(log.event_names(), vec!["click"]);
    }
}
