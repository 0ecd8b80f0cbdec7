//! Readiness gate in front of the transport handle.
//!
//! ```text
//! Uninitialized ──initialize()──► Initializing ──script_settled()──► Ready
//!                      │                                              ▲
//!                      └──── transport already present ───────────────┘
//! ```
//!
//! Events offered before `Ready` wait in a FIFO queue. The transition to
//! `Ready` drains that queue completely, inside the same call, before any
//! later event can be offered, so delivery order always equals offer order.

use std::collections::VecDeque;

use chrono::Utc;

use crate::config::Config;
use crate::error::Result;
use crate::types::{OutboundParams, ParamValue};

use super::slot::{CallSite, HandleSlot};
use super::{PlaceholderHandle, TransportCommand, TransportHandle};

/// Lifecycle of the gate. `Ready` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Uninitialized,
    Initializing,
    Ready,
}

impl GateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::Uninitialized => "uninitialized",
            GateState::Initializing => "initializing",
            GateState::Ready => "ready",
        }
    }
}

/// Remote script the host must load before the transport is usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRequest {
    pub url: String,
}

/// What [`TransportGate::initialize`] asks of the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Initialization {
    /// Load this script, then report back through `script_settled`
    LoadScript(ScriptRequest),
    /// A real transport was already installed; the gate is ready
    Ready,
    /// `initialize` had already run
    AlreadyStarted,
}

/// Owns readiness, the pending queue and the handle slot.
#[derive(Debug)]
pub struct TransportGate {
    state: GateState,
    pending: VecDeque<(String, OutboundParams)>,
    slot: HandleSlot,
    measurement_id: String,
    settings: OutboundParams,
    script_url: String,
    /// `js` and `config` as issued by `initialize`
    init_commands: Vec<TransportCommand>,
    queued: u64,
    sent: u64,
}

impl TransportGate {
    pub fn new(config: &Config) -> Self {
        let script_url = config.relay.script_url();

        let mut settings = OutboundParams::new();
        settings.insert("send_page_view", ParamValue::Bool(false));
        if let Some(endpoint) = config.relay.endpoint() {
            settings.insert("transport_url", ParamValue::from(endpoint));
        }

        let mut slot = HandleSlot::from_config(&config.guard);
        slot.trust(script_url.clone());

        Self {
            state: GateState::Uninitialized,
            pending: VecDeque::new(),
            slot,
            measurement_id: config.relay.measurement_id.clone(),
            settings,
            script_url,
            init_commands: Vec::new(),
            queued: 0,
            sent: 0,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == GateState::Ready
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Events that had to wait for readiness.
    pub fn queued(&self) -> u64 {
        self.queued
    }

    /// Events handed to the transport handle.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn script_url(&self) -> &str {
        &self.script_url
    }

    pub fn slot(&self) -> &HandleSlot {
        &self.slot
    }

    /// Write access for code that installs its own transport.
    pub fn slot_mut(&mut self) -> &mut HandleSlot {
        &mut self.slot
    }

    /// Queue the event until ready, or send it now.
    pub fn enqueue_or_send(&mut self, name: String, params: OutboundParams) {
        if self.state != GateState::Ready {
            tracing::debug!(
                event = %name,
                pending = self.pending.len() + 1,
                "Event queued until transport is ready"
            );
            self.pending.push_back((name, params));
            self.queued += 1;
            return;
        }

        self.deliver(name, params);
    }

    /// Prepare the transport: make sure a handle exists, issue the
    /// initialization and configuration calls, and tell the host what to load.
    pub fn initialize(&mut self) -> Initialization {
        if self.state != GateState::Uninitialized {
            tracing::debug!(state = self.state.as_str(), "Transport already initialized");
            return Initialization::AlreadyStarted;
        }
        self.state = GateState::Initializing;

        let transport_present = !self.slot.is_empty() && !self.slot.holds_placeholder();
        if self.slot.is_empty() {
            self.slot
                .set(Box::new(PlaceholderHandle::new()), &CallSite::relay());
        }

        self.init_commands = vec![
            TransportCommand::Js { at: Utc::now() },
            TransportCommand::Config {
                measurement_id: self.measurement_id.clone(),
                settings: self.settings.clone(),
            },
        ];
        for command in self.init_commands.clone() {
            self.slot.call(command);
        }

        if transport_present {
            tracing::info!("Transport already present, skipping script load");
            self.mark_ready();
            return Initialization::Ready;
        }

        tracing::info!(url = %self.script_url, "Loading transport script");
        Initialization::LoadScript(ScriptRequest {
            url: self.script_url.clone(),
        })
    }

    /// The transport script finished loading, successfully or not.
    ///
    /// A loaded transport replaces the current handle. If that handle was
    /// the placeholder, the slot replays its backlog; otherwise the loaded
    /// transport gets the initialization and configuration calls again. A
    /// failed load is logged and the gate becomes ready anyway, draining
    /// against whatever handle is installed.
    ///
    /// Only meaningful while `Initializing`; any other state ignores it.
    pub fn script_settled(&mut self, outcome: Result<Box<dyn TransportHandle>>) {
        if self.state != GateState::Initializing {
            tracing::debug!(
                state = self.state.as_str(),
                "Transport not initializing, ignoring script result"
            );
            return;
        }

        match outcome {
            Ok(handle) => {
                let site = CallSite::script(&self.script_url);
                let previous = self.slot.set(handle, &site);
                if !previous.map_or(false, |p| p.is_placeholder()) {
                    tracing::debug!("Replaced handle was not the placeholder, reconfiguring");
                    for command in self.init_commands.clone() {
                        self.slot.call(command);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    url = %self.script_url,
                    error = %e,
                    "Transport script failed to load, flushing to current handle"
                );
            }
        }

        self.mark_ready();
    }

    fn mark_ready(&mut self) {
        self.state = GateState::Ready;

        if self.pending.is_empty() {
            tracing::debug!("No events in queue");
            return;
        }

        tracing::info!(count = self.pending.len(), "Flushing queued events");
        while let Some((name, params)) = self.pending.pop_front() {
            self.deliver(name, params);
        }
        tracing::info!(sent = self.sent, queued = self.queued, "Flush complete");
    }

    fn deliver(&mut self, name: String, params: OutboundParams) {
        let command = TransportCommand::Event {
            name: name.clone(),
            params,
        };
        if self.slot.call(command) {
            self.sent += 1;
            tracing::debug!(event = %name, sent = self.sent, "Event forwarded");
        } else {
            tracing::warn!(event = %name, "No transport handle installed, event dropped");
        }
    }
}
