//! In-flight task table.
//!
//! Tracks the tasks the dispatch loop has fanned out but the collector has
//! not yet finalised. The table is purely a deadline accelerator for the
//! sweeper: it owns no data the store does not already hold and can be
//! rebuilt from the partial-result hashes after a restart. Entries are
//! inserted by the dispatch loop, removed by the collector on finalisation,
//! and removed by the sweeper on timeout.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// One in-flight task: where it came from and when it started.
#[derive(Debug, Clone)]
pub struct InFlightEntry {
    pub response_id: String,
    pub batch_id: String,
    pub started_at: Instant,
}

impl InFlightEntry {
    /// Creates an entry starting now.
    pub fn new(response_id: impl Into<String>, batch_id: impl Into<String>) -> Self {
        Self {
            response_id: response_id.into(),
            batch_id: batch_id.into(),
            started_at: Instant::now(),
        }
    }

    /// How long this task has been in flight.
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Thread-safe map from task id to in-flight entry.
#[derive(Default)]
pub struct InFlightTable {
    entries: Mutex<HashMap<String, InFlightEntry>>,
}

impl InFlightTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, InFlightEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a task. Overwrites any stale entry with the same id.
    pub fn insert(&self, task_id: impl Into<String>, entry: InFlightEntry) {
        self.lock().insert(task_id.into(), entry);
    }

    /// Removes and returns a task's entry.
    pub fn remove(&self, task_id: &str) -> Option<InFlightEntry> {
        self.lock().remove(task_id)
    }

    /// Returns a copy of a task's entry.
    pub fn get(&self, task_id: &str) -> Option<InFlightEntry> {
        self.lock().get(task_id).cloned()
    }

    /// Number of tasks currently in flight.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no task is in flight.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns the tasks older than `timeout`, for the sweeper.
    pub fn expired(&self, timeout: Duration) -> Vec<(String, InFlightEntry)> {
        self.lock()
            .iter()
            .filter(|(_, entry)| entry.age() > timeout)
            .map(|(task_id, entry)| (task_id.clone(), entry.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let table = InFlightTable::new();
        assert!(table.is_empty());

        table.insert("t-1", InFlightEntry::new("r-1", "b-1"));
        assert_eq!(table.len(), 1);

        let entry = table.get("t-1").expect("entry present");
        assert_eq!(entry.response_id, "r-1");
        assert_eq!(entry.batch_id, "b-1");

        let removed = table.remove("t-1").expect("entry present");
        assert_eq!(removed.response_id, "r-1");
        assert!(table.is_empty());
        assert!(table.remove("t-1").is_none());
    }

    #[test]
    fn test_expired_filters_by_age() {
        let table = InFlightTable::new();

        let old = InFlightEntry {
            response_id: "r-old".to_string(),
            batch_id: "b-1".to_string(),
            started_at: Instant::now() - Duration::from_secs(600),
        };
        table.insert("t-old", old);
        table.insert("t-new", InFlightEntry::new("r-new", "b-1"));

        let expired = table.expired(Duration::from_secs(300));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "t-old");

        // Entries are not removed by the query itself.
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_insert_overwrites_same_task_id() {
        let table = InFlightTable::new();
        table.insert("t-1", InFlightEntry::new("r-1", "b-1"));
        table.insert("t-1", InFlightEntry::new("r-2", "b-2"));

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("t-1").expect("entry").response_id, "r-2");
    }
}
