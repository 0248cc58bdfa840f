use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use cg_db::{AuditRepository, Database, IncidentRepository};
use cg_types::{AuditEntry, CallGuardError, IncidentReport, Result};

/// Boxed future returned by collaborator sinks.
pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Append-only log of resilience events.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry) -> SinkFuture<'_, ()>;
}

/// Incident tracker for escalated failures. Returns the tracker's id, if it assigns one.
pub trait IncidentSink: Send + Sync {
    fn report(&self, report: IncidentReport) -> SinkFuture<'_, Option<i64>>;
}

/// Emits audit entries as tracing events.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) -> SinkFuture<'_, ()> {
        Box::pin(async move {
            info!(
                target: "callguard::audit",
                component = %entry.component,
                event = %entry.event,
                detail = %entry.detail,
                "audit"
            );
            Ok(())
        })
    }
}

/// Emits incident reports as tracing errors.
#[derive(Debug, Default)]
pub struct TracingIncidentSink;

impl IncidentSink for TracingIncidentSink {
    fn report(&self, report: IncidentReport) -> SinkFuture<'_, Option<i64>> {
        Box::pin(async move {
            tracing::error!(
                target: "callguard::incident",
                severity = report.severity.as_str(),
                title = %report.title,
                error = %report.error_message,
                metadata = %report.metadata,
                "incident"
            );
            Ok(None)
        })
    }
}

/// Audit sink backed by the SQLite audit log.
pub struct DbAuditSink {
    db: Arc<Database>,
}

impl DbAuditSink {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl AuditSink for DbAuditSink {
    fn record(&self, entry: AuditEntry) -> SinkFuture<'_, ()> {
        Box::pin(async move {
            AuditRepository::new(&self.db).append(&entry).await?;
            Ok::<_, CallGuardError>(())
        })
    }
}

/// Incident sink backed by the SQLite incident table.
pub struct DbIncidentSink {
    db: Arc<Database>,
}

impl DbIncidentSink {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl IncidentSink for DbIncidentSink {
    fn report(&self, report: IncidentReport) -> SinkFuture<'_, Option<i64>> {
        Box::pin(async move {
            let id = IncidentRepository::new(&self.db).create(&report).await?;
            Ok::<_, CallGuardError>(Some(id))
        })
    }
}

/// The outbound collaborators shared by every component of an endpoint.
///
/// Sink failures are logged and swallowed: an unreachable audit store must
/// never fail the call it is describing.
#[derive(Clone)]
pub struct Observers {
    pub audit: Arc<dyn AuditSink>,
    pub incidents: Arc<dyn IncidentSink>,
}

impl Observers {
    pub fn new(audit: Arc<dyn AuditSink>, incidents: Arc<dyn IncidentSink>) -> Self {
        Self { audit, incidents }
    }

    /// Route both collaborators to the database.
    pub fn database(db: Arc<Database>) -> Self {
        Self {
            audit: Arc::new(DbAuditSink::new(Arc::clone(&db))),
            incidents: Arc::new(DbIncidentSink::new(db)),
        }
    }

    pub async fn emit(&self, component: &str, event: &str, detail: Value) {
        let entry = AuditEntry::now(component, event, detail);
        if let Err(e) = self.audit.record(entry).await {
            warn!(component, event, error = %e, "Audit sink rejected entry");
        }
    }

    pub async fn escalate(&self, report: IncidentReport) -> Option<i64> {
        let title = report.title.clone();
        match self.incidents.report(report).await {
            Ok(id) => id,
            Err(e) => {
                warn!(title = %title, error = %e, "Incident sink rejected report");
                None
            }
        }
    }
}

impl Default for Observers {
    fn default() -> Self {
        Self {
            audit: Arc::new(TracingAuditSink),
            incidents: Arc::new(TracingIncidentSink),
        }
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers").finish_non_exhaustive()
    }
}

/// In-memory sinks for asserting on emitted events.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct Recorder {
        pub entries: Mutex<Vec<AuditEntry>>,
        pub incidents: Mutex<Vec<IncidentReport>>,
        pub fail: bool,
    }

    impl Recorder {
        pub fn observers(self: &Arc<Self>) -> Observers {
            Observers::new(self.clone(), self.clone())
        }

        pub fn events(&self, component: &str) -> Vec<String> {
            self.entries
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.component == component)
                .map(|e| e.event.clone())
                .collect()
        }

        pub fn incident_titles(&self) -> Vec<String> {
            self.incidents
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.title.clone())
                .collect()
        }
    }

    impl AuditSink for Recorder {
        fn record(&self, entry: AuditEntry) -> SinkFuture<'_, ()> {
            Box::pin(async move {
                if self.fail {
                    return Err(CallGuardError::Database("audit store down".into()));
                }
                self.entries.lock().unwrap().push(entry);
                Ok(())
            })
        }
    }

    impl IncidentSink for Recorder {
        fn report(&self, report: IncidentReport) -> SinkFuture<'_, Option<i64>> {
            Box::pin(async move {
                if self.fail {
                    return Err(CallGuardError::Database("incident store down".into()));
                }
                let mut incidents = self.incidents.lock().unwrap();
                incidents.push(report);
                Ok(Some(incidents.len() as i64))
            })
        }
    }
}
