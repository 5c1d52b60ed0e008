//! Mass queue: process-wide registry of in-flight mass runs, addressable by
//! queue id, that external workers report results into.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use validator_core::{Event, Subscription};
use validator_types::RunResult;

use crate::manager::MassManager;

/// Wire shape of an external result update.
///
/// `schema` is a job schema as produced by [`MassJob::to_schema`]: its
/// `uuid` names the job and `result` (or `validation_passed` / `finished`)
/// carries the outcome.
///
/// [`MassJob::to_schema`]: crate::manager::MassJob::to_schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSchemaRequest {
    pub queue_id: String,
    pub schema: Value,
}

impl UpdateSchemaRequest {
    pub fn new(queue_id: impl Into<String>, job_id: &str, result: &RunResult) -> Self {
        Self {
            queue_id: queue_id.into(),
            schema: serde_json::json!({
                "uuid": job_id,
                "validation_passed": result.passed,
                "finished": true,
                "result": result,
            }),
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        self.schema.get("uuid").and_then(Value::as_str)
    }

    /// Typed result carried by the schema. `None` when the job is not
    /// finished or the schema carries no outcome.
    pub fn result(&self) -> Option<RunResult> {
        if self.schema.get("finished").and_then(Value::as_bool) == Some(false) {
            return None;
        }
        if let Some(result) = self.schema.get("result").filter(|r| !r.is_null()) {
            return serde_json::from_value(result.clone()).ok();
        }
        let passed = self.schema.get("validation_passed")?.as_bool()?;
        let message = self
            .schema
            .get("message")
            .and_then(Value::as_str)
            .map(String::from);
        Some(if passed {
            RunResult {
                passed: true,
                message: message.unwrap_or_else(|| "Ok".to_string()),
                per_check: Vec::new(),
            }
        } else {
            RunResult::failed(message.unwrap_or_else(|| "Validation failed".to_string()))
        })
    }
}

#[derive(Default)]
struct QueueEntry {
    managers: Vec<Arc<MassManager>>,
}

/// Addressable collection of mass runs.
///
/// Updates to one queue id are serialized by that entry's lock, so a
/// manager's own bookkeeping and external updates never interleave.
#[derive(Default)]
pub struct MassQueue {
    entries: RwLock<HashMap<String, Arc<Mutex<QueueEntry>>>>,
    on_update_item: Event<(Value, String)>,
}

static GLOBAL: OnceLock<Arc<MassQueue>> = OnceLock::new();

impl MassQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide queue.
    pub fn global() -> Arc<MassQueue> {
        GLOBAL.get_or_init(|| Arc::new(MassQueue::new())).clone()
    }

    fn entry(&self, queue_id: &str) -> Option<Arc<Mutex<QueueEntry>>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue_id)
            .cloned()
    }

    pub fn enqueue(&self, queue_id: &str, manager: Arc<MassManager>) {
        let entry = self
            .entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(queue_id.to_string())
            .or_default()
            .clone();
        tracing::debug!(queue = %queue_id, manager = %manager.id(), jobs = manager.len(), "Enqueued mass run");
        entry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .managers
            .push(manager);
    }

    /// Overwrite the result of job `job_id` in queue `queue_id`.
    ///
    /// Unknown queue or job ids are logged and ignored; returns whether a
    /// job was updated. Subscribers are notified only on success.
    pub fn update_schema(&self, queue_id: &str, job_id: &str, result: RunResult) -> bool {
        let Some(entry) = self.entry(queue_id) else {
            tracing::warn!(queue = %queue_id, job = %job_id, "Update for unknown queue ignored");
            return false;
        };
        let updated = {
            let guard = entry.lock().unwrap_or_else(|e| e.into_inner());
            guard
                .managers
                .iter()
                .find_map(|m| m.apply_external_result(job_id, result.clone()))
        };
        match updated {
            Some(schema) => {
                tracing::info!(queue = %queue_id, job = %job_id, passed = result.passed, "Job updated externally");
                self.on_update_item.notify(&(schema, queue_id.to_string()));
                true
            }
            None => {
                tracing::warn!(queue = %queue_id, job = %job_id, "Update for unknown job ignored");
                false
            }
        }
    }

    /// Apply an update received on the wire.
    pub fn update_from_wire(&self, request: &UpdateSchemaRequest) -> bool {
        let Some(job_id) = request.job_id() else {
            tracing::warn!(queue = %request.queue_id, "Update without a job uuid ignored");
            return false;
        };
        let Some(result) = request.result() else {
            tracing::warn!(queue = %request.queue_id, job = %job_id, "Update without a result ignored");
            return false;
        };
        self.update_schema(&request.queue_id, job_id, result)
    }

    /// Called with `(updated job schema, queue id)` after every successful update.
    pub fn subscribe_on_update_item(
        &self,
        callback: impl Fn(&(Value, String)) + Send + Sync + 'static,
    ) -> Subscription {
        self.on_update_item.subscribe(callback)
    }

    pub fn managers(&self, queue_id: &str) -> Vec<Arc<MassManager>> {
        self.entry(queue_id)
            .map(|e| e.lock().unwrap_or_else(|e| e.into_inner()).managers.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, queue_id: &str) -> bool {
        self.entry(queue_id).is_some()
    }

    /// Drop a queue entry with every manager in it.
    pub fn clear(&self, queue_id: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(queue_id)
            .is_some()
    }

    /// Remove one manager; the entry goes away with its last manager.
    pub fn remove_manager(&self, queue_id: &str, manager_id: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = entries.get(queue_id).cloned() else {
            return false;
        };
        let mut guard = entry.lock().unwrap_or_else(|e| e.into_inner());
        let before = guard.managers.len();
        guard.managers.retain(|m| m.id() != manager_id);
        let removed = guard.managers.len() != before;
        if guard.managers.is_empty() {
            entries.remove(queue_id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::MassOptions;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use validator_core::{default_registry, resolve_pipeline};
    use validator_types::ExecutorKind;

    fn manager() -> Arc<MassManager> {
        let model = resolve_pipeline(
            &default_registry(),
            &json!({
                "name": "queued",
                "uuid": "job-1",
                "context_plugin": {"name": "Empty"},
                "check_plugins": [{"name": "PrintPrims"}]
            }),
        )
        .unwrap();
        Arc::new(MassManager::new(
            vec![model],
            ExecutorKind::InProcess,
            MassOptions::default(),
        ))
    }

    fn counter(queue: &MassQueue) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let sub = queue.subscribe_on_update_item(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, sub)
    }

    #[test]
    fn unknown_queue_or_job_is_a_silent_no_op() {
        let queue = MassQueue::new();
        let (count, _sub) = counter(&queue);

        assert!(!queue.update_schema("nope", "job-1", RunResult::failed("x")));
        queue.enqueue("q", manager());
        assert!(!queue.update_schema("q", "missing-job", RunResult::failed("x")));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn update_overwrites_result_and_notifies() {
        let queue = MassQueue::new();
        let mgr = manager();
        queue.enqueue("q", mgr.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = queue.subscribe_on_update_item(move |(schema, queue_id)| {
            sink.lock().unwrap().push((schema.clone(), queue_id.clone()));
        });

        assert!(queue.update_schema("q", "job-1", RunResult::failed("remote failure")));
        let jobs = mgr.jobs();
        assert_eq!(jobs[0].result, Some(RunResult::failed("remote failure")));
        assert_eq!(jobs[0].state, validator_types::JobState::Failed);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, "q");
        assert_eq!(seen[0].0["uuid"], json!("job-1"));
        assert_eq!(seen[0].0["validation_passed"], json!(false));
    }

    #[test]
    fn wire_update_resolves_a_typed_result() {
        let queue = MassQueue::new();
        let mgr = manager();
        queue.enqueue("q", mgr.clone());

        let request: UpdateSchemaRequest = serde_json::from_value(json!({
            "queue_id": "q",
            "schema": {"uuid": "job-1", "validation_passed": true, "finished": true}
        }))
        .unwrap();
        assert!(queue.update_from_wire(&request));
        assert!(mgr.jobs()[0].result.as_ref().unwrap().passed);

        let unfinished = UpdateSchemaRequest {
            queue_id: "q".into(),
            schema: json!({"uuid": "job-1", "validation_passed": true, "finished": false}),
        };
        assert!(!queue.update_from_wire(&unfinished));
    }

    #[test]
    fn request_round_trips_its_result() {
        let result = RunResult::failed("1 of 2 checks failed");
        let request = UpdateSchemaRequest::new("q", "job-9", &result);
        assert_eq!(request.job_id(), Some("job-9"));
        assert_eq!(request.result(), Some(result));
    }

    #[test]
    fn remove_last_manager_drops_the_entry() {
        let queue = MassQueue::new();
        let a = manager();
        let b = manager();
        queue.enqueue("q", a.clone());
        queue.enqueue("q", b.clone());
        assert_eq!(queue.managers("q").len(), 2);

        assert!(queue.remove_manager("q", a.id()));
        assert!(queue.contains("q"));
        assert!(queue.remove_manager("q", b.id()));
        assert!(!queue.contains("q"));
        assert!(!queue.remove_manager("q", b.id()));
    }

    #[test]
    fn clear_destroys_the_entry() {
        let queue = MassQueue::new();
        queue.enqueue("q", manager());
        assert!(queue.clear("q"));
        assert!(!queue.clear("q"));
        assert!(!queue.update_schema("q", "job-1", RunResult::failed("late")));
    }

    #[test]
    fn global_is_shared() {
        assert!(Arc::ptr_eq(&MassQueue::global(), &MassQueue::global()));
    }
}
