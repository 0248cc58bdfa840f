use chrono::Utc;

use cg_types::{CallGuardError, Incident, IncidentReport, IncidentStatus, Result, Severity};

use crate::audit::parse_timestamp;
use crate::connection::Database;

/// Repository for escalated failures awaiting human follow-up.
pub struct IncidentRepository<'a> {
    db: &'a Database,
}

impl<'a> IncidentRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Open a new incident. Returns its ID.
    pub async fn create(&self, report: &IncidentReport) -> Result<i64> {
        let metadata = serde_json::to_string(&report.metadata)?;
        let result = sqlx::query(
            "INSERT INTO incidents (severity, title, error_message, metadata, status, created_at)
             VALUES (?, ?, ?, ?, 'open', ?)",
        )
        .bind(report.severity.as_str())
        .bind(&report.title)
        .bind(&report.error_message)
        .bind(&metadata)
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.pool())
        .await
        .map_err(|e| CallGuardError::Database(format!("Create incident: {e}")))?;

        Ok(result.last_insert_rowid())
    }

    /// Get an incident by ID.
    pub async fn get(&self, id: i64) -> Result<Option<Incident>> {
        let row: Option<IncidentRow> = sqlx::query_as(
            "SELECT id, severity, title, error_message, metadata, status, created_at, resolved_at
             FROM incidents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| CallGuardError::Database(format!("Get incident: {e}")))?;

        row.map(row_to_incident).transpose()
    }

    /// List incidents, newest first. `None` lists every status.
    pub async fn list(&self, status: Option<IncidentStatus>) -> Result<Vec<Incident>> {
        let rows: Vec<IncidentRow> = match status {
            Some(status) => {
                sqlx::query_as(
                    "SELECT id, severity, title, error_message, metadata, status, created_at, resolved_at
                     FROM incidents WHERE status = ? ORDER BY id DESC",
                )
                .bind(status.as_str())
                .fetch_all(self.db.pool())
                .await
            }
            None => {
                sqlx::query_as(
                    "SELECT id, severity, title, error_message, metadata, status, created_at, resolved_at
                     FROM incidents ORDER BY id DESC",
                )
                .fetch_all(self.db.pool())
                .await
            }
        }
        .map_err(|e| CallGuardError::Database(format!("List incidents: {e}")))?;

        rows.into_iter().map(row_to_incident).collect()
    }

    /// Mark an open incident resolved. Returns false if it was missing or already resolved.
    pub async fn resolve(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE incidents SET status = 'resolved', resolved_at = ?
             WHERE id = ? AND status = 'open'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(self.db.pool())
        .await
        .map_err(|e| CallGuardError::Database(format!("Resolve incident: {e}")))?;

        Ok(result.rows_affected() > 0)
    }
}

#[derive(sqlx::FromRow)]
struct IncidentRow {
    id: i64,
    severity: String,
    title: String,
    error_message: String,
    metadata: String,
    status: String,
    created_at: String,
    resolved_at: Option<String>,
}

fn row_to_incident(row: IncidentRow) -> Result<Incident> {
    let severity: Severity = row.severity.parse().map_err(CallGuardError::Database)?;
    let status = match row.status.as_str() {
        "resolved" => IncidentStatus::Resolved,
        _ => IncidentStatus::Open,
    };

    Ok(Incident {
        id: row.id,
        severity,
        title: row.title,
        error_message: row.error_message,
        metadata: serde_json::from_str(&row.metadata)?,
        status,
        created_at: parse_timestamp(&row.created_at)?,
        resolved_at: row.resolved_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup() -> Database {
        let db = Database::in_memory().await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    fn report(title: &str) -> IncidentReport {
        IncidentReport {
            severity: Severity::High,
            title: title.to_string(),
            error_message: "Operation failed: Provider returned status 500: boom".to_string(),
            metadata: json!({"attempts": 3}),
        }
    }

    #[tokio::test]
    async fn create_and_get() {
        let db = setup().await;
        let repo = IncidentRepository::new(&db);

        let id = repo.create(&report("Retry exhausted")).await.unwrap();
        let incident = repo.get(id).await.unwrap().unwrap();
        assert_eq!(incident.title, "Retry exhausted");
        assert_eq!(incident.severity, Severity::High);
        assert_eq!(incident.status, IncidentStatus::Open);
        assert_eq!(incident.metadata["attempts"], 3);
        assert!(incident.resolved_at.is_none());
    }

    #[tokio::test]
    async fn get_missing() {
        let db = setup().await;
        let repo = IncidentRepository::new(&db);
        assert!(repo.get(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolve_lifecycle() {
        let db = setup().await;
        let repo = IncidentRepository::new(&db);

        let first = repo.create(&report("first")).await.unwrap();
        let second = repo.create(&report("second")).await.unwrap();

        assert!(repo.resolve(first).await.unwrap());
        // Already resolved
        assert!(!repo.resolve(first).await.unwrap());
        assert!(!repo.resolve(12345).await.unwrap());

        let open = repo.list(Some(IncidentStatus::Open)).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, second);

        let resolved = repo.get(first).await.unwrap().unwrap();
        assert_eq!(resolved.status, IncidentStatus::Resolved);
        assert!(resolved.resolved_at.is_some());

        let all = repo.list(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second);
    }
}
