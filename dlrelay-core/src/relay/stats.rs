//! Diagnostic counters and the report built from them.

use std::fmt;

use serde::Serialize;

/// Running counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Records carrying an event name
    pub processed: u64,
    /// Records whose name was empty or blocked
    pub blocked: u64,
    /// Events that waited for the transport
    pub queued: u64,
    /// Events handed to the transport handle
    pub sent: u64,
}

/// Read-only snapshot of the relay.
#[derive(Debug, Clone, Serialize)]
pub struct RelayReport {
    pub version: String,
    pub policy: String,
    #[serde(flatten)]
    pub stats: RelayStats,
    pub pending: usize,
    pub state: String,
    pub ready: bool,
    pub scheduled: usize,
    pub persistent_state: serde_json::Value,
    pub audit_entries: usize,
}

impl fmt::Display for RelayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "dlrelay {}", self.version)?;
        writeln!(f, "  policy:      {}", self.policy)?;
        writeln!(f, "  transport:   {}", self.state)?;
        writeln!(f, "  processed:   {}", self.stats.processed)?;
        writeln!(f, "  blocked:     {}", self.stats.blocked)?;
        writeln!(f, "  queued:      {}", self.stats.queued)?;
        writeln!(f, "  sent:        {}", self.stats.sent)?;
        writeln!(f, "  pending:     {}", self.pending)?;
        writeln!(f, "  scheduled:   {}", self.scheduled)?;
        writeln!(f, "  persistent:  {}", self.persistent_state)?;
        write!(f, "  audit log:   {} write(s)", self.audit_entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_serializes_flat() {
        let report = RelayReport {
            version: "v0.1.0-2026-01-01T00:00:00Z".to_string(),
            policy: "immediate".to_string(),
            stats: RelayStats {
                processed: 3,
                blocked: 1,
                queued: 2,
                sent: 2,
            },
            pending: 0,
            state: "ready".to_string(),
            ready: true,
            scheduled: 0,
            persistent_state: serde_json::json!({}),
            audit_entries: 0,
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["processed"], 3);
        assert_eq!(json["blocked"], 1);
        assert!(report.to_string().contains("sent:        2"));
    }
}
