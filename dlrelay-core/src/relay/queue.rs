//! The observed queue page code pushes into.

use crate::error::Result;
use crate::types::EventValue;

/// Array-like queue the relay is installed over.
///
/// `push` is the queue's own behavior, without the relay. The engine calls
/// it first so other consumers of the queue see every entry unchanged.
pub trait ObservedQueue {
    /// Append entries and return the new length.
    fn push(&mut self, entries: &[EventValue]) -> usize;

    /// Entries present right now, for replay at install time.
    fn snapshot(&self) -> Result<Vec<EventValue>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Plain in-memory queue.
#[derive(Debug, Default, Clone)]
pub struct DataLayer {
    entries: Vec<EventValue>,
}

impl DataLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue that already holds entries pushed before the relay loaded.
    pub fn with_entries(entries: Vec<EventValue>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[EventValue] {
        &self.entries
    }
}

impl ObservedQueue for DataLayer {
    fn push(&mut self, entries: &[EventValue]) -> usize {
        self.entries.extend_from_slice(entries);
        self.entries.len()
    }

    fn snapshot(&self) -> Result<Vec<EventValue>> {
        Ok(self.entries.clone())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_returns_length() {
        let mut queue = DataLayer::with_entries(vec![EventValue::from("pre")]);
        assert_eq!(queue.push(&[EventValue::Null, EventValue::from(1)]), 3);
        assert_eq!(queue.snapshot().unwrap().len(), 3);
        assert!(!queue.is_empty());
    }
}
