//! Durable task queue, a thin layer over the store.
//!
//! Single-assignment is enforced entirely by the store's atomic claim; this
//! layer adds the advisory wake on enqueue (so parked long-polls pick up
//! new work immediately), the event fan-out on status changes, and the
//! dispatch gate that withholds work from hosts that are not healthy.
//! Correctness never depends on a wake arriving.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use phoenix_bus::{DomainEvent, EventBus, Topic};
use phoenix_core::{Result, Task};
use phoenix_store::{ExpiredSweep, Store, TaskFilter, TaskStatusUpdate};

/// Gate consulted before handing new work to a host.
///
/// Every claim passes through here; when the gate says no, the host's
/// queued tasks stay deferred in `pending` until it says yes again.
/// Existing claims are untouched and run out their lease as usual.
pub trait DispatchGate: Send + Sync {
    fn may_dispatch(&self, host_id: &str) -> bool;
}

#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn Store>,
    bus: EventBus,
    gate: Option<Arc<dyn DispatchGate>>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            gate: None,
        }
    }

    /// Install the dispatch gate (the agent registry in production).
    pub fn with_gate(mut self, gate: Arc<dyn DispatchGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Persist a task and wake any poller interested in its host.
    pub async fn enqueue(&self, task: Task) -> Result<Task> {
        let task = self.store.insert_task(&task).await?;
        debug!(
            task_id = %task.id,
            host_id = %task.host_id,
            task_type = %task.task_type,
            priority = task.priority,
            "task enqueued"
        );
        self.bus.publish(
            Topic::Tasks,
            DomainEvent::TaskEnqueued {
                task_id: task.id,
                host_id: task.host_id.clone(),
                priority: task.priority,
            },
        );
        Ok(task)
    }

    /// Enqueue a batch; each task gets its own wake event.
    pub async fn enqueue_all(&self, tasks: Vec<Task>) -> Result<Vec<Task>> {
        let mut stored = Vec::with_capacity(tasks.len());
        for task in tasks {
            stored.push(self.enqueue(task).await?);
        }
        Ok(stored)
    }

    /// Atomically claim the best ready task for a host, or nothing.
    ///
    /// A host the dispatch gate rejects receives nothing; its tasks wait
    /// in `pending` until the host is healthy again.
    pub async fn claim_one(&self, host_id: &str) -> Result<Option<Task>> {
        if let Some(gate) = &self.gate {
            if !gate.may_dispatch(host_id) {
                debug!(host_id, "claim withheld: host not healthy");
                return Ok(None);
            }
        }
        let claimed = self.store.claim_one_task(host_id).await?;
        if let Some(task) = &claimed {
            debug!(task_id = %task.id, host_id, "task claimed");
        }
        Ok(claimed)
    }

    /// Apply an agent-reported outcome and broadcast the change.
    pub async fn update_status(&self, id: Uuid, update: &TaskStatusUpdate) -> Result<Task> {
        let task = self.store.update_task_status(id, update).await?;
        self.publish_status(&task);
        Ok(task)
    }

    /// Sweep lease-expired claims: requeued tasks wake pollers again,
    /// exhausted ones are reported failed so the owning experiment reacts.
    pub async fn recover_expired(&self, lease: Duration, max_retries: i32) -> Result<ExpiredSweep> {
        let sweep = self.store.requeue_expired_claims(lease, max_retries).await?;
        if !sweep.is_empty() {
            info!(
                requeued = sweep.requeued.len(),
                failed = sweep.failed.len(),
                "expired claim sweep"
            );
        }
        for task in &sweep.requeued {
            self.bus.publish(
                Topic::Tasks,
                DomainEvent::TaskEnqueued {
                    task_id: task.id,
                    host_id: task.host_id.clone(),
                    priority: task.priority,
                },
            );
        }
        for task in &sweep.failed {
            self.publish_status(task);
        }
        Ok(sweep)
    }

    /// Withdraw still-pending tasks of a cancelled experiment.
    pub async fn cancel_pending(&self, experiment_id: Uuid) -> Result<Vec<Task>> {
        let expired = self.store.expire_pending_tasks(experiment_id).await?;
        for task in &expired {
            self.publish_status(task);
        }
        Ok(expired)
    }

    pub async fn get(&self, id: Uuid) -> Result<Task> {
        self.store.get_task(id).await
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.store.list_tasks(filter).await
    }

    fn publish_status(&self, task: &Task) {
        self.bus.publish(
            Topic::Tasks,
            DomainEvent::TaskStatusChanged {
                task_id: task.id,
                host_id: task.host_id.clone(),
                experiment_id: task.experiment_id,
                status: task.status,
            },
        );
    }
}

/// Background loop driving [`TaskQueue::recover_expired`].
///
/// Runs at a quarter of the lease (at least every second) so a crashed
/// agent's work is back in the queue well inside two lease windows.
pub async fn run_recovery_loop(queue: TaskQueue, lease: Duration, max_retries: i32) {
    let interval = (lease / 4).max(Duration::from_secs(1));
    info!(
        lease_secs = lease.as_secs(),
        interval_secs = interval.as_secs(),
        "task recovery loop started"
    );
    loop {
        tokio::time::sleep(interval).await;
        if let Err(e) = queue.recover_expired(lease, max_retries).await {
            warn!(error = %e, "expired claim sweep failed");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use phoenix_core::{DeployPipelinePayload, TaskStatus, Variant};
    use phoenix_store::MemStore;

    fn queue() -> (TaskQueue, EventBus) {
        let bus = EventBus::new();
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        (TaskQueue::new(store, bus.clone()), bus)
    }

    fn deploy_task(host: &str) -> Task {
        Task::deploy_pipeline(
            host,
            Uuid::new_v4(),
            DeployPipelinePayload {
                pipeline_url: "http://configs/c.yaml".into(),
                variant: Variant::Candidate,
                variables: HashMap::new(),
                pushgateway_url: None,
            },
        )
    }

    #[tokio::test]
    async fn test_enqueue_publishes_wake() {
        let (queue, bus) = queue();
        let mut sub = bus.subscribe(Topic::Tasks);

        let task = queue.enqueue(deploy_task("h1")).await.unwrap();

        match sub.try_recv().unwrap() {
            DomainEvent::TaskEnqueued { task_id, host_id, .. } => {
                assert_eq!(task_id, task.id);
                assert_eq!(host_id, "h1");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_claim_then_update_publishes_status() {
        let (queue, bus) = queue();
        let task = queue.enqueue(deploy_task("h1")).await.unwrap();
        let mut sub = bus.subscribe(Topic::Tasks);

        queue.claim_one("h1").await.unwrap().unwrap();
        queue
            .update_status(task.id, &TaskStatusUpdate::completed(None))
            .await
            .unwrap();

        match sub.try_recv().unwrap() {
            DomainEvent::TaskStatusChanged { task_id, status, .. } => {
                assert_eq!(task_id, task.id);
                assert_eq!(status, TaskStatus::Completed);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recover_expired_wakes_pollers() {
        let (queue, bus) = queue();
        let task = queue.enqueue(deploy_task("h1")).await.unwrap();
        queue.claim_one("h1").await.unwrap().unwrap();
        let mut sub = bus.subscribe(Topic::Tasks);

        let sweep = queue
            .recover_expired(Duration::from_secs(0), 3)
            .await
            .unwrap();
        assert_eq!(sweep.requeued.len(), 1);

        match sub.try_recv().unwrap() {
            DomainEvent::TaskEnqueued { task_id, .. } => assert_eq!(task_id, task.id),
            other => panic!("unexpected event {other:?}"),
        }

        // Task is claimable again.
        let reclaimed = queue.claim_one("h1").await.unwrap().unwrap();
        assert_eq!(reclaimed.id, task.id);
        assert_eq!(reclaimed.retry_count, 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reports_failure() {
        let (queue, bus) = queue();
        let mut task = deploy_task("h1");
        task.retry_count = 3;
        let task = queue.enqueue(task).await.unwrap();
        queue.claim_one("h1").await.unwrap().unwrap();
        let mut sub = bus.subscribe(Topic::Tasks);

        let sweep = queue
            .recover_expired(Duration::from_secs(0), 3)
            .await
            .unwrap();
        assert_eq!(sweep.failed.len(), 1);

        match sub.try_recv().unwrap() {
            DomainEvent::TaskStatusChanged { task_id, status, .. } => {
                assert_eq!(task_id, task.id);
                assert_eq!(status, TaskStatus::Failed);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_pending_expires_and_reports() {
        let (queue, bus) = queue();
        let exp_id = Uuid::new_v4();
        let mut task = deploy_task("h1");
        task.experiment_id = Some(exp_id);
        queue.enqueue(task).await.unwrap();
        let mut sub = bus.subscribe(Topic::Tasks);

        let expired = queue.cancel_pending(exp_id).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, TaskStatus::Expired);

        match sub.try_recv().unwrap() {
            DomainEvent::TaskStatusChanged { status, .. } => {
                assert_eq!(status, TaskStatus::Expired);
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(queue.claim_one("h1").await.unwrap().is_none());
    }

    struct DenyList(Vec<String>);

    impl DispatchGate for DenyList {
        fn may_dispatch(&self, host_id: &str) -> bool {
            !self.0.iter().any(|h| h == host_id)
        }
    }

    #[tokio::test]
    async fn test_gate_withholds_claims_until_host_recovers() {
        let bus = EventBus::new();
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let gated = TaskQueue::new(store.clone(), bus.clone())
            .with_gate(Arc::new(DenyList(vec!["h1".into()])));

        let task = gated.enqueue(deploy_task("h1")).await.unwrap();

        // The gate rejects h1: nothing is handed out, nothing is mutated.
        assert!(gated.claim_one("h1").await.unwrap().is_none());
        assert_eq!(gated.get(task.id).await.unwrap().status, TaskStatus::Pending);

        // Other hosts are unaffected.
        let wildcard = gated
            .enqueue(Task::stop_pipeline("h2", None, None))
            .await
            .unwrap();
        assert_eq!(
            gated.claim_one("h2").await.unwrap().unwrap().id,
            wildcard.id
        );

        // Once the gate clears (host healthy again), the deferred task flows.
        let open = TaskQueue::new(store, bus).with_gate(Arc::new(DenyList(vec![])));
        assert_eq!(open.claim_one("h1").await.unwrap().unwrap().id, task.id);
    }

    #[tokio::test]
    async fn test_stop_tasks_preempt_deploys() {
        let (queue, _bus) = queue();
        queue.enqueue(deploy_task("h1")).await.unwrap();
        let stop = queue
            .enqueue(Task::stop_pipeline("h1", None, None))
            .await
            .unwrap();

        let first = queue.claim_one("h1").await.unwrap().unwrap();
        assert_eq!(first.id, stop.id, "stop task drains ahead of deploys");
    }
}
