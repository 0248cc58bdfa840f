use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::debug;

use cg_types::{CallGuardError, InFlightEntry, RequestId, Result};

type Table = Arc<Mutex<HashMap<RequestId, InFlightEntry>>>;

fn lock(table: &Table) -> MutexGuard<'_, HashMap<RequestId, InFlightEntry>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

/// Bounded table of retried operations currently in progress.
///
/// Every entry is owned by an [`InFlightGuard`] and disappears when the
/// guard drops, whether the operation succeeded, failed for good, or its
/// caller was cancelled.
#[derive(Debug, Clone)]
pub struct InFlightRetries {
    capacity: usize,
    entries: Table,
}

impl InFlightRetries {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register `request_id`. Fails if the id is already in flight or the table is full.
    pub fn begin(&self, request_id: RequestId) -> Result<InFlightGuard> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(&request_id) {
            return Err(CallGuardError::InFlight(format!(
                "Request {request_id} is already in flight"
            )));
        }
        if entries.len() >= self.capacity {
            return Err(CallGuardError::InFlight(format!(
                "Table full ({} entries)",
                self.capacity
            )));
        }

        entries.insert(
            request_id.clone(),
            InFlightEntry {
                request_id: request_id.clone(),
                attempts: 0,
                started_at: Utc::now(),
            },
        );
        debug!(request_id = %request_id, in_flight = entries.len(), "Retry registered");

        Ok(InFlightGuard {
            entries: Arc::clone(&self.entries),
            request_id,
        })
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        lock(&self.entries).contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current entries, oldest first.
    pub fn snapshot(&self) -> Vec<InFlightEntry> {
        let mut entries: Vec<InFlightEntry> = lock(&self.entries).values().cloned().collect();
        entries.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        entries
    }
}

/// Keeps one request registered until dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    entries: Table,
    request_id: RequestId,
}

impl InFlightGuard {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn set_attempts(&self, attempts: u32) {
        if let Some(entry) = lock(&self.entries).get_mut(&self.request_id) {
            entry.attempts = attempts;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.entries).remove(&self.request_id);
    }
}
