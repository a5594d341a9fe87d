//! In-memory store backend.
//!
//! Single-process map guarded by one mutex, giving the same atomicity the
//! Postgres backend gets from single-statement claims. Used by the test
//! suites and by dev mode when `PG_URL` is unset. No await point ever holds
//! the lock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use phoenix_core::{
    ActivePipeline, AgentRecord, Error, EventRecord, Experiment, KpiResult, MetricRow, NewEvent,
    Phase, Result, Task, TaskStatus,
};

use crate::{ExpiredSweep, Store, TaskFilter, TaskStatusUpdate};

#[derive(Default)]
struct State {
    experiments: HashMap<Uuid, Experiment>,
    tasks: HashMap<Uuid, Task>,
    agents: HashMap<String, AgentRecord>,
    pipelines: HashMap<Uuid, ActivePipeline>,
    events: Vec<EventRecord>,
    metrics: Vec<MetricRow>,
    kpis: Vec<KpiResult>,
    event_seq: i64,
}

#[derive(Default)]
pub struct MemStore {
    state: Mutex<State>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn matches_host(task: &Task, host_id: &str) -> bool {
    task.host_id == host_id || task.host_id == "*"
}

/// Claim scan order: highest priority first, oldest first within a priority.
fn claim_order(a: &Task, b: &Task) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
}

#[async_trait]
impl Store for MemStore {
    // ── Experiments ──────────────────────────────────────────────

    async fn create_experiment(&self, exp: &Experiment) -> Result<Experiment> {
        let mut state = self.lock();
        if state.experiments.values().any(|e| e.name == exp.name) {
            return Err(Error::Conflict(format!(
                "experiment name '{}' already exists",
                exp.name
            )));
        }
        state.experiments.insert(exp.id, exp.clone());
        Ok(exp.clone())
    }

    async fn get_experiment(&self, id: Uuid) -> Result<Experiment> {
        self.lock()
            .experiments
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("experiment {id}")))
    }

    async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>> {
        Ok(self
            .lock()
            .experiments
            .values()
            .find(|e| e.name == name)
            .cloned())
    }

    async fn list_experiments(&self, phase: Option<Phase>) -> Result<Vec<Experiment>> {
        let state = self.lock();
        let mut exps: Vec<Experiment> = state
            .experiments
            .values()
            .filter(|e| phase.is_none_or(|p| e.phase == p))
            .cloned()
            .collect();
        exps.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(exps)
    }

    async fn update_experiment(&self, exp: &Experiment) -> Result<Experiment> {
        let mut state = self.lock();
        let stored = state
            .experiments
            .get_mut(&exp.id)
            .ok_or_else(|| Error::NotFound(format!("experiment {}", exp.id)))?;
        if stored.version != exp.version {
            return Err(Error::Conflict(format!(
                "experiment {} version {} != stored {}",
                exp.id, exp.version, stored.version
            )));
        }
        let mut updated = exp.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    // ── Tasks ────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<Task> {
        self.lock().tasks.insert(task.id, task.clone());
        Ok(task.clone())
    }

    async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.lock()
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let state = self.lock();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter.experiment_id.is_none_or(|id| t.experiment_id == Some(id)))
            .filter(|t| filter.host_id.as_deref().is_none_or(|h| t.host_id == h))
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(claim_order);
        Ok(tasks)
    }

    async fn claim_one_task(&self, host_id: &str) -> Result<Option<Task>> {
        let mut state = self.lock();
        let candidate = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && matches_host(t, host_id))
            .min_by(|a, b| claim_order(a, b))
            .map(|t| t.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        // Still under the same lock: no other caller can observe the row
        // between selection and assignment.
        let task = state.tasks.get_mut(&id).ok_or_else(|| {
            Error::Fatal(format!("task {id} vanished during claim"))
        })?;
        task.status = TaskStatus::Assigned;
        task.assigned_at = Some(Utc::now());
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn update_task_status(&self, id: Uuid, update: &TaskStatusUpdate) -> Result<Task> {
        let mut state = self.lock();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        crate::apply_task_update(task, update)?;
        Ok(task.clone())
    }

    async fn requeue_expired_claims(
        &self,
        lease: Duration,
        max_retries: i32,
    ) -> Result<ExpiredSweep> {
        let cutoff = Utc::now()
            - chrono::TimeDelta::from_std(lease)
                .map_err(|e| Error::Validation(format!("lease out of range: {e}")))?;
        let mut sweep = ExpiredSweep::default();
        let now = Utc::now();

        let mut state = self.lock();
        for task in state.tasks.values_mut() {
            let expired = matches!(task.status, TaskStatus::Assigned | TaskStatus::Running)
                && task.assigned_at.is_some_and(|at| at < cutoff);
            if !expired {
                continue;
            }
            if task.retry_count >= max_retries {
                task.status = TaskStatus::Failed;
                task.error_message = Some("claim lease expired; retries exhausted".into());
                task.completed_at = Some(now);
                task.updated_at = now;
                sweep.failed.push(task.clone());
            } else {
                task.status = TaskStatus::Pending;
                task.retry_count += 1;
                task.assigned_at = None;
                task.error_message = Some("claim lease expired".into());
                task.updated_at = now;
                sweep.requeued.push(task.clone());
            }
        }
        Ok(sweep)
    }

    async fn expire_pending_tasks(&self, experiment_id: Uuid) -> Result<Vec<Task>> {
        let now = Utc::now();
        let mut expired = Vec::new();
        let mut state = self.lock();
        for task in state.tasks.values_mut() {
            if task.experiment_id == Some(experiment_id) && task.status == TaskStatus::Pending {
                task.status = TaskStatus::Expired;
                task.completed_at = Some(now);
                task.error_message = Some("experiment cancelled".into());
                task.updated_at = now;
                expired.push(task.clone());
            }
        }
        Ok(expired)
    }

    // ── Agents ───────────────────────────────────────────────────

    async fn upsert_agent(&self, record: &AgentRecord) -> Result<AgentRecord> {
        let mut state = self.lock();
        let merged = match state.agents.get(&record.host_id) {
            Some(existing) => {
                let mut merged = record.clone();
                merged.first_seen = existing.first_seen;
                merged
            }
            None => record.clone(),
        };
        state.agents.insert(merged.host_id.clone(), merged.clone());
        Ok(merged)
    }

    async fn get_agent(&self, host_id: &str) -> Result<Option<AgentRecord>> {
        Ok(self.lock().agents.get(host_id).cloned())
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        let mut agents: Vec<AgentRecord> = self.lock().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        Ok(agents)
    }

    // ── Active pipelines ─────────────────────────────────────────

    async fn insert_active_pipeline(&self, pipeline: &ActivePipeline) -> Result<ActivePipeline> {
        self.lock().pipelines.insert(pipeline.id, pipeline.clone());
        Ok(pipeline.clone())
    }

    async fn get_active_pipeline(&self, id: Uuid) -> Result<ActivePipeline> {
        self.lock()
            .pipelines
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("pipeline deployment {id}")))
    }

    async fn stop_active_pipeline(&self, id: Uuid) -> Result<ActivePipeline> {
        let mut state = self.lock();
        let pipeline = state
            .pipelines
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("pipeline deployment {id}")))?;
        if pipeline.stopped_at.is_none() {
            pipeline.stopped_at = Some(Utc::now());
        }
        Ok(pipeline.clone())
    }

    async fn list_active_pipelines(&self, host_id: Option<&str>) -> Result<Vec<ActivePipeline>> {
        let state = self.lock();
        let mut pipelines: Vec<ActivePipeline> = state
            .pipelines
            .values()
            .filter(|p| p.is_live())
            .filter(|p| host_id.is_none_or(|h| p.host_id == h))
            .cloned()
            .collect();
        pipelines.sort_by(|a, b| b.deployed_at.cmp(&a.deployed_at));
        Ok(pipelines)
    }

    async fn list_pipeline_history(&self, host_id: &str) -> Result<Vec<ActivePipeline>> {
        let state = self.lock();
        let mut pipelines: Vec<ActivePipeline> = state
            .pipelines
            .values()
            .filter(|p| p.host_id == host_id)
            .cloned()
            .collect();
        pipelines.sort_by(|a, b| b.deployed_at.cmp(&a.deployed_at));
        Ok(pipelines)
    }

    // ── Experiment events ────────────────────────────────────────

    async fn append_event(&self, event: NewEvent) -> Result<EventRecord> {
        let mut state = self.lock();
        state.event_seq += 1;
        let record = EventRecord {
            seq: state.event_seq,
            experiment_id: event.experiment_id,
            event_type: event.event_type,
            phase: event.phase,
            message: event.message,
            metadata: event.metadata,
            created_at: Utc::now(),
        };
        state.events.push(record.clone());
        Ok(record)
    }

    async fn list_events(&self, experiment_id: Uuid, limit: i64) -> Result<Vec<EventRecord>> {
        let state = self.lock();
        let mut events: Vec<EventRecord> = state
            .events
            .iter()
            .filter(|e| e.experiment_id == experiment_id)
            .cloned()
            .collect();
        // Append order; trim to the most recent `limit` when bounded.
        if limit > 0 && events.len() > limit as usize {
            events.drain(..events.len() - limit as usize);
        }
        Ok(events)
    }

    // ── Metric cache ─────────────────────────────────────────────

    async fn insert_metrics(&self, rows: &[MetricRow]) -> Result<u64> {
        self.lock().metrics.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn list_metrics(&self, experiment_id: Uuid, limit: i64) -> Result<Vec<MetricRow>> {
        let state = self.lock();
        let mut rows: Vec<MetricRow> = state
            .metrics
            .iter()
            .filter(|m| m.experiment_id == experiment_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if limit > 0 {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    async fn prune_metrics(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock();
        let before = state.metrics.len();
        state.metrics.retain(|m| m.timestamp >= older_than);
        Ok((before - state.metrics.len()) as u64)
    }

    // ── KPI results ──────────────────────────────────────────────

    async fn insert_kpi_result(&self, result: &KpiResult) -> Result<()> {
        self.lock().kpis.push(result.clone());
        Ok(())
    }

    async fn latest_kpi_result(&self, experiment_id: Uuid) -> Result<Option<KpiResult>> {
        let state = self.lock();
        Ok(state
            .kpis
            .iter()
            .filter(|k| k.experiment_id == experiment_id)
            .max_by_key(|k| k.calculated_at)
            .cloned())
    }

    async fn list_kpi_results(&self, experiment_id: Uuid, limit: i64) -> Result<Vec<KpiResult>> {
        let state = self.lock();
        let mut results: Vec<KpiResult> = state
            .kpis
            .iter()
            .filter(|k| k.experiment_id == experiment_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| b.calculated_at.cmp(&a.calculated_at));
        if limit > 0 {
            results.truncate(limit as usize);
        }
        Ok(results)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Arc;

    use phoenix_core::{
        DeployPipelinePayload, ExperimentConfig, PipelineRef, SuccessCriteria, Variant,
    };

    fn experiment(name: &str) -> Experiment {
        Experiment::new(
            name,
            ExperimentConfig {
                target_hosts: vec!["h1".into()],
                baseline: PipelineRef {
                    template: "baseline".into(),
                    url: "http://configs/b.yaml".into(),
                    variables: StdHashMap::new(),
                },
                candidate: PipelineRef {
                    template: "adaptive".into(),
                    url: "http://configs/c.yaml".into(),
                    variables: StdHashMap::new(),
                },
                duration_secs: 60,
                warmup_secs: 0,
                load_profile: None,
                criteria: SuccessCriteria::default(),
            },
        )
    }

    fn deploy_task(host: &str, priority: i32) -> Task {
        let mut task = Task::deploy_pipeline(
            host,
            Uuid::new_v4(),
            DeployPipelinePayload {
                pipeline_url: "http://configs/c.yaml".into(),
                variant: Variant::Candidate,
                variables: StdHashMap::new(),
                pushgateway_url: None,
            },
        );
        task.priority = priority;
        task
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_age() {
        let store = MemStore::new();
        let low = deploy_task("h1", 10);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let mut high = deploy_task("h1", 20);
        high.created_at = Utc::now();
        store.insert_task(&low).await.unwrap();
        store.insert_task(&high).await.unwrap();

        let first = store.claim_one_task("h1").await.unwrap().unwrap();
        assert_eq!(first.id, high.id, "higher priority claims first");
        let second = store.claim_one_task("h1").await.unwrap().unwrap();
        assert_eq!(second.id, low.id);
        assert!(store.claim_one_task("h1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_fifo_within_priority() {
        let store = MemStore::new();
        let older = deploy_task("h1", 10);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let newer = deploy_task("h1", 10);
        // Insert newest first to prove ordering is by created_at, not insertion.
        store.insert_task(&newer).await.unwrap();
        store.insert_task(&older).await.unwrap();

        let first = store.claim_one_task("h1").await.unwrap().unwrap();
        assert_eq!(first.id, older.id);
    }

    #[tokio::test]
    async fn test_claim_respects_host_and_wildcard() {
        let store = MemStore::new();
        store.insert_task(&deploy_task("h1", 10)).await.unwrap();
        store.insert_task(&deploy_task("*", 10)).await.unwrap();

        assert!(store.claim_one_task("h2").await.unwrap().is_some(), "wildcard");
        assert!(store.claim_one_task("h2").await.unwrap().is_none(), "h1 task hidden");
        assert!(store.claim_one_task("h1").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_claims_never_share_a_row() {
        let store = Arc::new(MemStore::new());
        for _ in 0..10 {
            store.insert_task(&deploy_task("h1", 10)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..100 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_one_task("h1").await.unwrap()
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(task) = handle.await.unwrap() {
                claimed.push(task.id);
            }
        }
        claimed.sort();
        let total = claimed.len();
        claimed.dedup();
        assert_eq!(total, 10, "exactly the 10 stored rows are claimed");
        assert_eq!(claimed.len(), 10, "no row claimed twice");
    }

    #[tokio::test]
    async fn test_update_status_lifecycle_and_idempotence() {
        let store = MemStore::new();
        let task = deploy_task("h1", 10);
        store.insert_task(&task).await.unwrap();
        store.claim_one_task("h1").await.unwrap().unwrap();

        let running = store
            .update_task_status(task.id, &TaskStatusUpdate::running())
            .await
            .unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at.is_some());

        let done = TaskStatusUpdate::completed(Some(serde_json::json!({"ok": true})));
        let completed = store.update_task_status(task.id, &done).await.unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert!(completed.completed_at.is_some());

        // Identical replay is a no-op success.
        let replay = store.update_task_status(task.id, &done).await.unwrap();
        assert_eq!(replay.status, TaskStatus::Completed);

        // A different terminal transition is rejected.
        let err = store
            .update_task_status(task.id, &TaskStatusUpdate::failed("late"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_phase");
    }

    #[tokio::test]
    async fn test_update_status_requires_claim() {
        let store = MemStore::new();
        let task = deploy_task("h1", 10);
        store.insert_task(&task).await.unwrap();

        let err = store
            .update_task_status(task.id, &TaskStatusUpdate::completed(None))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_phase");
    }

    #[tokio::test]
    async fn test_requeue_expired_increments_retry() {
        let store = MemStore::new();
        let task = deploy_task("h1", 10);
        store.insert_task(&task).await.unwrap();
        store.claim_one_task("h1").await.unwrap().unwrap();

        // Zero lease: the claim is instantly stale.
        let sweep = store
            .requeue_expired_claims(Duration::from_secs(0), 3)
            .await
            .unwrap();
        assert_eq!(sweep.requeued.len(), 1);
        assert!(sweep.failed.is_empty());

        let requeued = store.get_task(task.id).await.unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.retry_count, 1);
        assert!(requeued.assigned_at.is_none());
        assert_eq!(requeued.error_message.as_deref(), Some("claim lease expired"));
    }

    #[tokio::test]
    async fn test_requeue_exhausted_retries_fails_task() {
        let store = MemStore::new();
        let mut task = deploy_task("h1", 10);
        task.retry_count = 3;
        store.insert_task(&task).await.unwrap();
        store.claim_one_task("h1").await.unwrap().unwrap();

        let sweep = store
            .requeue_expired_claims(Duration::from_secs(0), 3)
            .await
            .unwrap();
        assert!(sweep.requeued.is_empty());
        assert_eq!(sweep.failed.len(), 1);
        assert_eq!(sweep.failed[0].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_fresh_claims_survive_the_sweep() {
        let store = MemStore::new();
        let task = deploy_task("h1", 10);
        store.insert_task(&task).await.unwrap();
        store.claim_one_task("h1").await.unwrap().unwrap();

        let sweep = store
            .requeue_expired_claims(Duration::from_secs(300), 3)
            .await
            .unwrap();
        assert!(sweep.is_empty());
        assert_eq!(store.get_task(task.id).await.unwrap().status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn test_expire_pending_tasks_on_cancel() {
        let store = MemStore::new();
        let exp_id = Uuid::new_v4();
        let mut pending = deploy_task("h1", 10);
        pending.experiment_id = Some(exp_id);
        let mut claimed = deploy_task("h2", 10);
        claimed.experiment_id = Some(exp_id);
        store.insert_task(&pending).await.unwrap();
        store.insert_task(&claimed).await.unwrap();
        store.claim_one_task("h2").await.unwrap().unwrap();

        let expired = store.expire_pending_tasks(exp_id).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, pending.id);
        // In-flight claims keep running until their lease expires.
        assert_eq!(store.get_task(claimed.id).await.unwrap().status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn test_experiment_name_conflict() {
        let store = MemStore::new();
        store.create_experiment(&experiment("exp-a")).await.unwrap();
        let err = store
            .create_experiment(&experiment("exp-a"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[tokio::test]
    async fn test_optimistic_version_update() {
        let store = MemStore::new();
        let exp = store.create_experiment(&experiment("exp-a")).await.unwrap();

        let mut fresh = exp.clone();
        fresh.description = Some("first writer".into());
        let updated = store.update_experiment(&fresh).await.unwrap();
        assert_eq!(updated.version, exp.version + 1);

        // Second writer still holds the old version.
        let mut stale = exp;
        stale.description = Some("second writer".into());
        let err = store.update_experiment(&stale).await.unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[tokio::test]
    async fn test_event_append_order() {
        let store = MemStore::new();
        let exp_id = Uuid::new_v4();
        for i in 0..5 {
            store
                .append_event(NewEvent::note(exp_id, "tick", format!("event {i}")))
                .await
                .unwrap();
        }
        let events = store.list_events(exp_id, 0).await.unwrap();
        assert_eq!(events.len(), 5);
        for pair in events.windows(2) {
            assert!(pair[0].seq < pair[1].seq, "seq strictly increases");
            assert!(pair[0].created_at <= pair[1].created_at);
        }

        let tail = store.list_events(exp_id, 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].message, "event 4");
    }

    #[tokio::test]
    async fn test_agent_upsert_preserves_first_seen() {
        let store = MemStore::new();
        let first = AgentRecord::first_seen_now("h1");
        store.upsert_agent(&first).await.unwrap();

        let mut second = AgentRecord::first_seen_now("h1");
        second.agent_version = Some("1.2.0".into());
        let merged = store.upsert_agent(&second).await.unwrap();
        assert_eq!(merged.first_seen, first.first_seen);
        assert_eq!(merged.agent_version.as_deref(), Some("1.2.0"));
    }

    #[tokio::test]
    async fn test_metric_prune() {
        let store = MemStore::new();
        let exp_id = Uuid::new_v4();
        let old = MetricRow {
            experiment_id: exp_id,
            timestamp: Utc::now() - chrono::TimeDelta::days(10),
            metric_name: "series".into(),
            variant: None,
            host_id: "h1".into(),
            value: 1.0,
            labels: StdHashMap::new(),
        };
        let fresh = MetricRow {
            timestamp: Utc::now(),
            ..old.clone()
        };
        store.insert_metrics(&[old, fresh]).await.unwrap();

        let removed = store
            .prune_metrics(Utc::now() - chrono::TimeDelta::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list_metrics(exp_id, 0).await.unwrap().len(), 1);
    }
}
