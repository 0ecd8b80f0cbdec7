//! The relay engine
//!
//! Sits between page code and the transport:
//!
//! ```text
//! push ──► ObservedQueue::push (the queue's own push)
//!   │
//!   └──► Scheduler ──► Interceptor ──► TransportGate ──► TransportHandle
//!         (policy)     (persist, filter, shape)  (queue or send)
//! ```
//!
//! One engine exists per page lifetime. It owns the observed queue and the
//! gate; nothing is global. All methods run on the host's single thread and
//! none of them fail: problems are logged and the push carries on.

mod intercept;
mod queue;
mod schedule;
mod stats;

pub use intercept::{event_name, Interceptor, Outcome, ROUTING_KEY};
pub use queue::{DataLayer, ObservedQueue};
pub use schedule::{DispatchPolicy, Scheduler};
pub use stats::{RelayReport, RelayStats};

use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::config::Config;
use crate::error::Result;
use crate::transport::{
    AuditEntry, HandleSlot, Initialization, TransportGate, TransportHandle,
};
use crate::types::{EventValue, Fields};

/// Interceptor, scheduler and gate installed over one observed queue.
#[derive(Debug)]
pub struct RelayEngine<Q = DataLayer> {
    queue: Q,
    interceptor: Interceptor,
    scheduler: Scheduler<EventValue>,
    gate: TransportGate,
    started_at: DateTime<Utc>,
}

impl<Q: ObservedQueue> RelayEngine<Q> {
    /// Install the relay over `queue` and replay what is already in it.
    pub fn install(config: &Config, queue: Q) -> Self {
        Self::install_at(config, queue, Instant::now())
    }

    /// Like [`install`](Self::install), with an explicit clock reading for
    /// scheduling the replayed entries.
    pub fn install_at(config: &Config, queue: Q, now: Instant) -> Self {
        let policy = DispatchPolicy::from_config(&config.dispatch);
        let mut engine = Self {
            queue,
            interceptor: Interceptor::new(config),
            scheduler: Scheduler::new(policy),
            gate: TransportGate::new(config),
            started_at: Utc::now(),
        };

        match engine.queue.snapshot() {
            Ok(existing) => {
                if !existing.is_empty() {
                    tracing::debug!(count = existing.len(), "Replaying existing queue entries");
                }
                for entry in existing {
                    engine.dispatch(entry, now);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Could not read existing queue entries"),
        }

        tracing::info!(
            version = %engine.version(),
            policy = %policy,
            "Relay installed"
        );
        engine
    }

    /// The wrapped push: the queue's own push first, then the pipeline.
    ///
    /// Returns what the queue's own push returned.
    pub fn push(&mut self, entries: Vec<EventValue>) -> usize {
        self.push_at(entries, Instant::now())
    }

    pub fn push_at(&mut self, entries: Vec<EventValue>, now: Instant) -> usize {
        let len = self.queue.push(&entries);
        for entry in entries {
            self.dispatch(entry, now);
        }
        len
    }

    fn dispatch(&mut self, entry: EventValue, now: Instant) {
        if self.scheduler.policy().is_immediate() {
            self.process(&entry);
        } else {
            self.scheduler.schedule(entry, now);
        }
    }

    fn process(&mut self, entry: &EventValue) {
        if let Outcome::Forward { name, params } = self.interceptor.process(entry) {
            self.gate.enqueue_or_send(name, params);
        }
    }

    /// Process staggered records due at or before `now`.
    pub fn run_due(&mut self, now: Instant) -> usize {
        let due = self.scheduler.take_due(now);
        let count = due.len();
        for entry in &due {
            self.process(entry);
        }
        count
    }

    /// Process up to `max` waiting records, oldest first.
    pub fn run_idle(&mut self, max: usize) -> usize {
        let batch = self.scheduler.take_front(max);
        let count = batch.len();
        for entry in &batch {
            self.process(entry);
        }
        count
    }

    /// Process everything still waiting, ignoring due times.
    pub fn flush_scheduled(&mut self) -> usize {
        let rest = self.scheduler.take_all();
        let count = rest.len();
        if count > 0 {
            tracing::debug!(count, "Flushing scheduled records");
        }
        for entry in &rest {
            self.process(entry);
        }
        count
    }

    /// When the host should next call [`run_due`](Self::run_due).
    pub fn next_due(&self) -> Option<Instant> {
        self.scheduler.next_due()
    }

    pub fn scheduled_len(&self) -> usize {
        self.scheduler.len()
    }

    pub fn initialize(&mut self) -> Initialization {
        self.gate.initialize()
    }

    pub fn script_settled(&mut self, outcome: Result<Box<dyn TransportHandle>>) {
        self.gate.script_settled(outcome);
    }

    pub fn is_ready(&self) -> bool {
        self.gate.is_ready()
    }

    pub fn gate(&self) -> &TransportGate {
        &self.gate
    }

    /// Write access to the handle slot, for code installing its own transport.
    pub fn slot_mut(&mut self) -> &mut HandleSlot {
        self.gate.slot_mut()
    }

    pub fn audit_log(&self) -> &[AuditEntry] {
        self.gate.slot().audit_log()
    }

    pub fn persistent_state(&self) -> &Fields {
        self.interceptor.persistence().state()
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.scheduler.policy()
    }

    /// `v{version}-{install time}`
    pub fn version(&self) -> String {
        format!(
            "v{}-{}",
            env!("CARGO_PKG_VERSION"),
            self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            processed: self.interceptor.processed(),
            blocked: self.interceptor.blocked(),
            queued: self.gate.queued(),
            sent: self.gate.sent(),
        }
    }

    pub fn report(&self) -> RelayReport {
        RelayReport {
            version: self.version(),
            policy: self.policy().to_string(),
            stats: self.stats(),
            pending: self.gate.pending_len(),
            state: self.gate.state().as_str().to_string(),
            ready: self.gate.is_ready(),
            scheduled: self.scheduler.len(),
            persistent_state: self.interceptor.persistence().to_json(),
            audit_entries: self.audit_log().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::transport::MemoryTransport;
    use serde_json::json;

    fn entry(value: serde_json::Value) -> EventValue {
        EventValue::from(value)
    }

    struct BrokenQueue;

    impl ObservedQueue for BrokenQueue {
        fn push(&mut self, _entries: &[EventValue]) -> usize {
            0
        }

        fn snapshot(&self) -> Result<Vec<EventValue>> {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "detached",
            )))
        }

        fn len(&self) -> usize {
            0
        }
    }

    #[test]
    fn test_queue_push_runs_first() {
        let mut engine = RelayEngine::install(&Config::default(), DataLayer::new());
        let len = engine.push(vec![entry(json!({"event": "click"})), EventValue::Null]);

        assert_eq!(len, 2);
        assert_eq!(engine.queue().entries().len(), 2);
        assert_eq!(engine.stats().processed, 1);
        assert_eq!(engine.gate().pending_len(), 1);
    }

    #[test]
    fn test_replay_failure_is_swallowed() {
        let mut engine = RelayEngine::install(&Config::default(), BrokenQueue);
        assert_eq!(engine.stats(), RelayStats::default());

        engine.push(vec![entry(json!({"event": "after"}))]);
        assert_eq!(engine.stats().processed, 1);
    }

    #[test]
    fn test_report() {
        let mut config = Config::default();
        config.persistence.fields = vec!["user_type".to_string()];
        let mut engine = RelayEngine::install(&config, DataLayer::new());
        engine.push(vec![entry(json!({"user_type": "member"}))]);
        engine.push(vec![entry(json!({"event": "gtm.load"}))]);

        let report = engine.report();
        assert!(report.version.starts_with(concat!("v", env!("CARGO_PKG_VERSION"), "-")));
        assert_eq!(report.policy, "immediate");
        assert_eq!(report.stats.blocked, 1);
        assert_eq!(report.state, "uninitialized");
        assert_eq!(report.persistent_state, json!({"user_type": "member"}));
    }

    #[test]
    fn test_flush_scheduled() {
        let mut config = Config::default();
        config.dispatch.idle_scheduling = true;
        let mut engine = RelayEngine::install(&config, DataLayer::new());
        engine.initialize();
        let transport = MemoryTransport::new();
        let log = transport.log();
        engine.script_settled(Ok(Box::new(transport)));

        engine.push(vec![entry(json!({"event": "a"})), entry(json!({"event": "b"}))]);
        assert_eq!(engine.scheduled_len(), 2);
        assert!(log.event_names().is_empty());

        assert_eq!(engine.flush_scheduled(), 2);
        assert_eq!(log.event_names(), vec!["a", "b"]);
    }
}
