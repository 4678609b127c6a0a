use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use super::ErrorSeverity;

/// Classification of a recorded failure or rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    DataGap,
    ValidationFailure,
    TransientDependencyFailure,
    DependencyFailure,
    DependencyUnavailable,
    CriticalFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub operation: String,
    pub severity: ErrorSeverity,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(
        component: impl Into<String>,
        operation: impl Into<String>,
        severity: ErrorSeverity,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            component: component.into(),
            operation: operation.into(),
            severity,
            kind,
            message: message.into(),
        }
    }
}

/// Append-only ring of the most recent error records
#[derive(Debug)]
pub struct AuditTrail {
    capacity: usize,
    records: VecDeque<ErrorRecord>,
    total_appended: u64,
}

impl AuditTrail {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
            total_appended: 0,
        }
    }

    pub fn append(&mut self, record: ErrorRecord) {
        self.records.push_back(record);
        self.total_appended += 1;
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records ever appended, including trimmed ones
    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }

    pub fn records(&self) -> Vec<ErrorRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn find(&self, id: Uuid) -> Option<&ErrorRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn count_kind(&self, kind: ErrorKind) -> usize {
        self.records.iter().filter(|r| r.kind == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(message: &str) -> ErrorRecord {
        ErrorRecord::new(
            "risk-sizer",
            "size",
            ErrorSeverity::Low,
            ErrorKind::ValidationFailure,
            message,
        )
    }

    #[test]
    fn test_ring_trims_oldest() {
        let mut trail = AuditTrail::new(3);
        for i in 0..5 {
            trail.append(record(&format!("rejection {}", i)));
        }

        let records = trail.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].message, "rejection 2");
        assert_eq!(records[2].message, "rejection 4");
        assert_eq!(trail.total_appended(), 5);
    }

    #[test]
    fn test_find_and_count() {
        let mut trail = AuditTrail::new(10);
        let r = record("too quiet");
        let id = r.id;
        trail.append(r);
        trail.append(ErrorRecord::new(
            "execution-gateway",
            "submit_order",
            ErrorSeverity::Critical,
            ErrorKind::CriticalFailure,
            "authentication failed",
        ));

        assert_eq!(trail.find(id).unwrap().message, "too quiet");
        assert_eq!(trail.count_kind(ErrorKind::CriticalFailure), 1);
        assert_eq!(trail.count_kind(ErrorKind::DataGap), 0);
    }
}
