use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{IncidentStatus, Severity};

/// Structured record handed to the append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(default)]
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub event: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl AuditEntry {
    /// Build an entry stamped with the current time.
    pub fn now(component: &str, event: &str, detail: serde_json::Value) -> Self {
        Self {
            id: None,
            timestamp: Utc::now(),
            component: component.to_string(),
            event: event.to_string(),
            detail,
        }
    }
}

/// Escalation submitted to the incident tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentReport {
    pub severity: Severity,
    pub title: String,
    pub error_message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A stored incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub severity: Severity,
    pub title: String,
    pub error_message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub status: IncidentStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_entry_now_has_no_id() {
        let entry = AuditEntry::now("breaker", "opened", serde_json::json!({"failures": 5}));
        assert!(entry.id.is_none());
        assert_eq!(entry.component, "breaker");
        assert_eq!(entry.detail["failures"], 5);
    }

    #[test]
    fn incident_defaults() {
        let json = r#"{
            "id": 7,
            "severity": "high",
            "title": "Retry exhausted",
            "error_message": "boom",
            "created_at": "2025-01-01T00:00:00Z"
        }"#;
        let incident: Incident = serde_json::from_str(json).unwrap();
        assert_eq!(incident.status, IncidentStatus::Open);
        assert_eq!(incident.severity, Severity::High);
        assert!(incident.metadata.is_null());
        assert!(incident.resolved_at.is_none());
    }
}
