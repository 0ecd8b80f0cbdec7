//! Per-record dispatch timing.
//!
//! Whatever the policy, records leave the scheduler in the order they
//! entered it. Staggered due times never decrease, and idle processing
//! always takes from the front.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::config::DispatchConfig;

/// When observed records run through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// Inside the push call
    Immediate,
    /// Spaced `step` apart, driven by the host's timer
    Staggered { step: Duration },
    /// Whenever the host reports idle time
    Idle,
}

impl DispatchPolicy {
    /// Idle scheduling wins over a processing delay.
    pub fn from_config(config: &DispatchConfig) -> Self {
        if config.idle_scheduling {
            DispatchPolicy::Idle
        } else if config.processing_delay_ms > 0 {
            DispatchPolicy::Staggered {
                step: config.processing_delay(),
            }
        } else {
            DispatchPolicy::Immediate
        }
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, DispatchPolicy::Immediate)
    }
}

impl fmt::Display for DispatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchPolicy::Immediate => f.write_str("immediate"),
            DispatchPolicy::Staggered { step } => write!(f, "staggered ({}ms)", step.as_millis()),
            DispatchPolicy::Idle => f.write_str("idle"),
        }
    }
}

#[derive(Debug)]
struct Scheduled<T> {
    due: Option<Instant>,
    item: T,
}

/// FIFO of records waiting for their turn.
#[derive(Debug)]
pub struct Scheduler<T> {
    policy: DispatchPolicy,
    waiting: VecDeque<Scheduled<T>>,
    last_due: Option<Instant>,
}

impl<T> Scheduler<T> {
    pub fn new(policy: DispatchPolicy) -> Self {
        Self {
            policy,
            waiting: VecDeque::new(),
            last_due: None,
        }
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Add a record observed at `now`.
    ///
    /// Staggered records are due at `max(now, previous due + step)`; the
    /// first one is due at `now`.
    pub fn schedule(&mut self, item: T, now: Instant) {
        let due = match self.policy {
            DispatchPolicy::Staggered { step } => {
                let due = match self.last_due {
                    Some(last) => std::cmp::max(now, last + step),
                    None => now,
                };
                self.last_due = Some(due);
                Some(due)
            }
            DispatchPolicy::Immediate | DispatchPolicy::Idle => None,
        };
        self.waiting.push_back(Scheduled { due, item });
    }

    /// Due time of the front record, if it has one.
    pub fn next_due(&self) -> Option<Instant> {
        self.waiting.front().and_then(|s| s.due)
    }

    /// Remove every record due at or before `now`, oldest first.
    ///
    /// Records without a due time are never returned here.
    pub fn take_due(&mut self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        while let Some(front) = self.waiting.front() {
            match front.due {
                Some(at) if at <= now => {
                    if let Some(s) = self.waiting.pop_front() {
                        due.push(s.item);
                    }
                }
                _ => break,
            }
        }
        due
    }

    /// Remove up to `max` records from the front regardless of due time.
    pub fn take_front(&mut self, max: usize) -> Vec<T> {
        let n = max.min(self.waiting.len());
        self.waiting.drain(..n).map(|s| s.item).collect()
    }

    /// Remove everything still waiting.
    pub fn take_all(&mut self) -> Vec<T> {
        self.waiting.drain(..).map(|s| s.item).collect()
    }
}
