//! Process-wide registry of execution traces, keyed by task id.
//!
//! Traces are inserted once when a task starts, written only by the driver
//! run that owns them, and read by status pollers at any time. Finished
//! traces are dropped by [`TraceRegistry::evict_expired`].

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use super::error::RegistryError;
use super::execution::{ExecutionTrace, TraceRecord};

/// A trace shared between its owning driver run and the registry.
pub type SharedTrace = Arc<RwLock<ExecutionTrace>>;

/// Wraps a trace for sharing.
pub fn share(trace: ExecutionTrace) -> SharedTrace {
    Arc::new(RwLock::new(trace))
}

/// Takes a consistent snapshot of a shared trace.
pub fn snapshot(trace: &SharedTrace) -> TraceRecord {
    trace
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .to_record()
}

struct Entry {
    trace: SharedTrace,
    inserted_at: Instant,
}

/// Concurrent task-id to trace map with insert-once semantics.
#[derive(Default)]
pub struct TraceRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl TraceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps and registers a new trace, returning the shared handle.
    pub fn register(&self, trace: ExecutionTrace) -> Result<SharedTrace, RegistryError> {
        let shared = share(trace);
        self.insert(Arc::clone(&shared))?;
        Ok(shared)
    }

    /// Registers an already shared trace under its task id.
    pub fn insert(&self, trace: SharedTrace) -> Result<(), RegistryError> {
        let task_id = trace
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .task_id()
            .to_string();

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&task_id) {
            return Err(RegistryError::AlreadyRegistered(task_id));
        }
        tracing::debug!(task_id = %task_id, "Registered trace");
        entries.insert(
            task_id,
            Entry {
                trace,
                inserted_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Snapshot of the trace for `task_id`.
    pub fn get(&self, task_id: &str) -> Result<TraceRecord, RegistryError> {
        self.get_shared(task_id)
            .map(|trace| snapshot(&trace))
            .ok_or_else(|| RegistryError::NotFound(task_id.to_string()))
    }

    /// Shared handle to the trace for `task_id`.
    pub fn get_shared(&self, task_id: &str) -> Option<SharedTrace> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .map(|entry| Arc::clone(&entry.trace))
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(task_id)
    }

    /// Removes a trace and returns its final snapshot.
    pub fn remove(&self, task_id: &str) -> Option<TraceRecord> {
        let entry = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id)?;
        Some(snapshot(&entry.trace))
    }

    /// Drops finished traces registered longer than `ttl` ago. Running
    /// traces are kept regardless of age. Returns the number evicted.
    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| {
            let finished = entry
                .trace
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .is_finished();
            !(finished && entry.inserted_at.elapsed() >= ttl)
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = entries.len(), "Evicted expired traces");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered task ids, sorted.
    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{StepKind, TraceStatus};

    #[test]
    fn test_register_and_get() {
        let registry = TraceRegistry::new();
        let shared = registry
            .register(ExecutionTrace::new("t1", "db", "q"))
            .unwrap();

        shared
            .write()
            .unwrap()
            .start_step("analysis", StepKind::Agent, "q")
            .unwrap();

        let record = registry.get("t1").unwrap();
        assert_eq!(record.task_id, "t1");
        assert_eq!(record.steps.len(), 1);
        assert_eq!(record.overall_status, TraceStatus::Running);
        assert!(registry.contains("t1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_insert_once() {
        let registry = TraceRegistry::new();
        registry.register(ExecutionTrace::new("t1", "db", "q")).unwrap();
        let err = registry
            .register(ExecutionTrace::new("t1", "other", "q2"))
            .unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered("t1".to_string()));
        assert_eq!(registry.get("t1").unwrap().subject_id, "db");
    }

    #[test]
    fn test_unknown_task_is_not_found() {
        let registry = TraceRegistry::new();
        assert_eq!(
            registry.get("missing").unwrap_err(),
            RegistryError::NotFound("missing".to_string())
        );
        assert!(registry.remove("missing").is_none());
    }

    #[test]
    fn test_remove() {
        let registry = TraceRegistry::new();
        registry.register(ExecutionTrace::new("t1", "db", "q")).unwrap();
        let record = registry.remove("t1").unwrap();
        assert_eq!(record.task_id, "t1");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_evict_expired_keeps_running_traces() {
        let registry = TraceRegistry::new();
        let done = registry.register(ExecutionTrace::new("done", "db", "q")).unwrap();
        let running = registry
            .register(ExecutionTrace::new("running", "db", "q"))
            .unwrap();

        done.write().unwrap().complete("ok").unwrap();
        running
            .write()
            .unwrap()
            .start_step("analysis", StepKind::Agent, "q")
            .unwrap();

        assert_eq!(registry.evict_expired(Duration::from_secs(3600)), 0);
        assert_eq!(registry.evict_expired(Duration::ZERO), 1);
        assert_eq!(registry.task_ids(), vec!["running".to_string()]);
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(TraceRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let id = format!("task-{}", i);
                    registry
                        .register(ExecutionTrace::new(id.clone(), "db", "q"))
                        .unwrap();
                    registry.get(&id).unwrap().task_id
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), format!("task-{}", i));
        }
        assert_eq!(registry.len(), 16);
    }
}
