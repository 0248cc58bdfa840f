use chrono::{DateTime, Utc};

use cg_types::{AuditEntry, CallGuardError, Result};

use crate::connection::Database;

/// Append-only store for resilience-layer events.
pub struct AuditRepository<'a> {
    db: &'a Database,
}

impl<'a> AuditRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Append an entry. Returns the row ID.
    pub async fn append(&self, entry: &AuditEntry) -> Result<i64> {
        let detail = serde_json::to_string(&entry.detail)?;
        let result = sqlx::query(
            "INSERT INTO audit_log (timestamp, component, event, detail)
             VALUES (?, ?, ?, ?)",
        )
        .bind(entry.timestamp.to_rfc3339())
        .bind(&entry.component)
        .bind(&entry.event)
        .bind(&detail)
        .execute(self.db.pool())
        .await
        .map_err(|e| CallGuardError::Database(format!("Append audit entry: {e}")))?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent entries, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT id, timestamp, component, event, detail
             FROM audit_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| CallGuardError::Database(format!("Get recent audit entries: {e}")))?;

        rows.into_iter().map(row_to_entry).collect()
    }

    /// Most recent entries for one component, newest first.
    pub async fn recent_for(&self, component: &str, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT id, timestamp, component, event, detail
             FROM audit_log WHERE component = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(component)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| CallGuardError::Database(format!("Get audit entries for component: {e}")))?;

        rows.into_iter().map(row_to_entry).collect()
    }

    /// Number of entries per event for a component.
    pub async fn count_by_event(&self, component: &str) -> Result<Vec<EventCount>> {
        let rows: Vec<EventCount> = sqlx::query_as(
            "SELECT event, COUNT(*) as count
             FROM audit_log WHERE component = ?
             GROUP BY event ORDER BY event ASC",
        )
        .bind(component)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| CallGuardError::Database(format!("Count audit events: {e}")))?;

        Ok(rows)
    }
}

/// Event tally for a component.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct EventCount {
    pub event: String,
    pub count: i64,
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: i64,
    timestamp: String,
    component: String,
    event: String,
    detail: String,
}

fn row_to_entry(row: AuditRow) -> Result<AuditEntry> {
    Ok(AuditEntry {
        id: Some(row.id),
        timestamp: parse_timestamp(&row.timestamp)?,
        component: row.component,
        event: row.event,
        detail: serde_json::from_str(&row.detail)?,
    })
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CallGuardError::Database(format!("Bad timestamp {raw:?}: {e}")))
}
