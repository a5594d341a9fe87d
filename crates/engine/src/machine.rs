//! The experiment state machine.
//!
//! All experiment mutations flow through here. Writes use the store's
//! optimistic version (re-read and retry up to 3 times on conflict); every
//! phase transition appends a durable event and publishes to the bus in
//! the same order. Reconciliation is idempotent: re-running it against
//! unchanged state performs no writes and emits no events.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use phoenix_bus::{DomainEvent, EventBus, Topic};
use phoenix_core::{
    ActivePipeline, DeployPipelinePayload, Error, Experiment, ExperimentConfig, ExperimentTimeouts,
    NewEvent, Phase, PipelineRef, Result, Task, TaskStatus, TaskType, Variant,
};
use phoenix_queue::TaskQueue;
use phoenix_store::{Store, TaskFilter};

const VERSION_RETRIES: usize = 3;

pub struct StateMachine {
    store: Arc<dyn Store>,
    queue: TaskQueue,
    bus: EventBus,
    timeouts: ExperimentTimeouts,
}

impl StateMachine {
    pub fn new(
        store: Arc<dyn Store>,
        queue: TaskQueue,
        bus: EventBus,
        timeouts: ExperimentTimeouts,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            timeouts,
        }
    }

    // ── API verbs ────────────────────────────────────────────────

    /// Create an experiment. Re-posting an existing name returns the
    /// existing row; creation never duplicates.
    pub async fn create(
        &self,
        name: String,
        description: Option<String>,
        config: ExperimentConfig,
    ) -> Result<Experiment> {
        if let Some(existing) = self.store.get_experiment_by_name(&name).await? {
            return Ok(existing);
        }
        let mut exp = Experiment::new(name, config);
        exp.description = description;
        exp.validate()?;

        let exp = self.store.create_experiment(&exp).await?;
        self.store
            .append_event(NewEvent::note(exp.id, "created", "experiment created"))
            .await?;
        info!(experiment_id = %exp.id, name = %exp.name, "experiment created");
        Ok(exp)
    }

    /// Kick a pending experiment into initialization immediately instead
    /// of waiting for the next reconcile tick.
    pub async fn start(&self, id: Uuid) -> Result<Experiment> {
        let exp = self.store.get_experiment(id).await?;
        match exp.phase {
            Phase::Pending | Phase::Initializing => {
                self.reconcile(id).await?;
                self.store.get_experiment(id).await
            }
            other => Err(Error::Precondition(format!(
                "cannot start experiment in phase {other}"
            ))),
        }
    }

    /// End the measurement window early and move straight to analysis.
    pub async fn stop(&self, id: Uuid) -> Result<Experiment> {
        let exp = self.store.get_experiment(id).await?;
        if exp.phase != Phase::Running {
            return Err(Error::Precondition(format!(
                "cannot stop experiment in phase {}",
                exp.phase
            )));
        }
        self.begin_analysis(&exp, "stopped by operator").await?;
        self.store.get_experiment(id).await
    }

    /// Cancel from any non-terminal phase: withdraw queued work, tear down
    /// deployed pipelines, no criteria check.
    pub async fn cancel(&self, id: Uuid) -> Result<Experiment> {
        let exp = self.store.get_experiment(id).await?;
        if exp.phase == Phase::Cancelled {
            return Ok(exp);
        }
        if exp.phase.is_terminal() {
            return Err(Error::Precondition(format!(
                "cannot cancel experiment in phase {}",
                exp.phase
            )));
        }

        self.queue.cancel_pending(id).await?;
        self.enqueue_stop_tasks(&exp).await?;
        self.transition(id, Phase::Cancelled, "cancelled by operator", |exp| {
            exp.completed_at = Some(Utc::now());
        })
        .await
    }

    /// Promote one variant of a completed experiment to a permanent
    /// deployment across the target hosts. Never preempts other
    /// experiments on overlapping hosts.
    pub async fn promote(&self, id: Uuid, variant: Variant) -> Result<Experiment> {
        let exp = self.store.get_experiment(id).await?;
        if exp.phase != Phase::Completed {
            return Err(Error::Precondition(format!(
                "cannot promote experiment in phase {}",
                exp.phase
            )));
        }
        if exp.promoted_variant == Some(variant) {
            return Ok(exp);
        }
        if exp.promoted_variant.is_some() {
            return Err(Error::Conflict(format!(
                "experiment {id} already promoted {}",
                exp.promoted_variant.map(|v| v.as_str()).unwrap_or("?")
            )));
        }

        let pipeline = pipeline_for(&exp.config, variant);
        for host in &exp.config.target_hosts {
            let task = Task::deploy_pipeline(
                host.clone(),
                exp.id,
                DeployPipelinePayload {
                    pipeline_url: pipeline.url.clone(),
                    variant,
                    variables: pipeline.variables.clone(),
                    pushgateway_url: None,
                },
            );
            self.queue.enqueue(task).await?;
        }

        let updated = self
            .update_with_retries(id, |exp| {
                exp.promoted_variant = Some(variant);
                exp.updated_at = Utc::now();
                true
            })
            .await?;
        self.store
            .append_event(
                NewEvent::note(id, "promoted", format!("{variant} promoted to permanent"))
                    .with_metadata(serde_json::json!({"variant": variant.as_str()})),
            )
            .await?;
        info!(experiment_id = %id, variant = %variant, "variant promoted");
        Ok(updated)
    }

    // ── Reconciliation ───────────────────────────────────────────

    /// One reconcile pass; returns the phase after the pass. Safe to call
    /// at any time, from the ticker or in response to events; repeated
    /// calls against unchanged state are no-ops.
    pub async fn reconcile(&self, id: Uuid) -> Result<Phase> {
        let exp = self.store.get_experiment(id).await?;
        match exp.phase {
            Phase::Pending => self.reconcile_pending(exp).await?,
            Phase::Initializing => self.reconcile_initializing(exp).await?,
            Phase::Running => self.reconcile_running(exp).await?,
            Phase::Analyzing => {
                self.record_completed_stops(&exp).await?;
                self.reconcile_analyzing(exp).await?;
            }
            // Terminal phases only tidy up deployment records as their
            // stop tasks drain.
            Phase::Completed | Phase::Failed | Phase::Cancelled => {
                self.record_completed_stops(&exp).await?;
            }
        }
        Ok(self.store.get_experiment(id).await?.phase)
    }

    /// Ids of every non-terminal experiment (the supervisor's tick set).
    pub async fn live_experiments(&self) -> Result<Vec<Uuid>> {
        Ok(self
            .store
            .list_experiments(None)
            .await?
            .into_iter()
            .filter(|e| !e.phase.is_terminal())
            .map(|e| e.id)
            .collect())
    }

    async fn reconcile_pending(&self, exp: Experiment) -> Result<()> {
        self.transition(exp.id, Phase::Initializing, "reconcile after create", |_| {})
            .await?;
        self.ensure_deploy_tasks(&exp).await?;
        Ok(())
    }

    /// Materialize the (host, variant) deploy-task pairs that do not exist
    /// yet. The existence check keeps at most one deploy task per pair.
    async fn ensure_deploy_tasks(&self, exp: &Experiment) -> Result<()> {
        let existing = self
            .queue
            .list(&TaskFilter {
                experiment_id: Some(exp.id),
                ..Default::default()
            })
            .await?;
        let covered: HashSet<(String, Variant)> = existing
            .iter()
            .filter(|t| t.task_type == TaskType::DeployPipeline)
            .filter_map(|t| Some((t.host_id.clone(), t.variant()?)))
            .collect();

        for host in &exp.config.target_hosts {
            for variant in Variant::ALL {
                if covered.contains(&(host.clone(), variant)) {
                    continue;
                }
                let pipeline = pipeline_for(&exp.config, variant);
                let task = Task::deploy_pipeline(
                    host.clone(),
                    exp.id,
                    DeployPipelinePayload {
                        pipeline_url: pipeline.url.clone(),
                        variant,
                        variables: pipeline.variables.clone(),
                        pushgateway_url: None,
                    },
                );
                self.queue.enqueue(task).await?;
            }
        }
        Ok(())
    }

    async fn reconcile_initializing(&self, exp: Experiment) -> Result<()> {
        // Covers a crash between the phase transition and task creation;
        // a no-op when the pairs already exist.
        self.ensure_deploy_tasks(&exp).await?;

        let tasks = self
            .queue
            .list(&TaskFilter {
                experiment_id: Some(exp.id),
                ..Default::default()
            })
            .await?;
        let deploys: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.task_type == TaskType::DeployPipeline)
            .collect();

        // Record active pipelines for deploys that completed since last
        // pass, before any failure handling: cleanup needs to know which
        // hosts are partially deployed.
        self.record_completed_deploys(&exp, &deploys).await?;

        // A deploy that is terminally failed fails the whole experiment.
        if let Some(failed) = deploys.iter().find(|t| t.status == TaskStatus::Failed) {
            let reason = format!(
                "deploy failed on host {}: {}",
                failed.host_id,
                failed.error_message.as_deref().unwrap_or("unknown error")
            );
            return self.fail_experiment(&exp, &reason).await;
        }

        let expected = exp.config.target_hosts.len() * Variant::ALL.len();
        let completed = deploys
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();

        if completed == expected && expected > 0 {
            let all_done_at = deploys
                .iter()
                .filter_map(|t| t.completed_at)
                .max()
                .unwrap_or_else(Utc::now);
            let warmup = TimeDelta::seconds(exp.config.warmup_secs as i64);
            if Utc::now() - all_done_at >= warmup {
                let hosts = exp.config.target_hosts.len() as u32;
                self.transition(exp.id, Phase::Running, "all deploys completed", move |exp| {
                    exp.started_at = Some(Utc::now());
                    exp.status.active_hosts = hosts;
                })
                .await?;
            }
            return Ok(());
        }

        // Still waiting on deploys; enforce the init timeout.
        let init_started = exp.phase_since().unwrap_or(exp.created_at);
        if Utc::now() - init_started >= to_delta(self.timeouts.init_timeout()) {
            return self
                .fail_experiment(&exp, "initialization timed out")
                .await;
        }
        Ok(())
    }

    async fn reconcile_running(&self, exp: Experiment) -> Result<()> {
        let started = exp.started_at.unwrap_or(exp.updated_at);
        let duration = TimeDelta::seconds(exp.config.duration_secs as i64);
        if Utc::now() - started >= duration {
            self.begin_analysis(&exp, "measurement window elapsed")
                .await?;
        }
        Ok(())
    }

    async fn reconcile_analyzing(&self, exp: Experiment) -> Result<()> {
        let latest = self.store.latest_kpi_result(exp.id).await?;

        if let Some(result) = &latest {
            if result.criteria_met {
                let summary = result.summary();
                self.transition(exp.id, Phase::Completed, "success criteria met", move |exp| {
                    exp.completed_at = Some(Utc::now());
                    exp.status.kpi = Some(summary);
                })
                .await?;
                return Ok(());
            }
        }

        let analyzing_since = exp.phase_since().unwrap_or(exp.updated_at);
        if Utc::now() - analyzing_since >= to_delta(self.timeouts.analysis_timeout()) {
            match latest {
                // A result exists but never met the bar.
                Some(_) => self.fail_experiment(&exp, "criteria not met").await?,
                None => {
                    self.fail_experiment(&exp, "no KPI result within analysis timeout")
                        .await?
                }
            }
        }
        Ok(())
    }

    /// Analyzing-phase escalation used by the KPI evaluator after three
    /// consecutive total evaluation failures.
    pub async fn fail_analysis(&self, id: Uuid, reason: &str) -> Result<()> {
        let exp = self.store.get_experiment(id).await?;
        if exp.phase != Phase::Analyzing {
            return Ok(());
        }
        self.fail_experiment(&exp, reason).await
    }

    // ── Shared transition plumbing ───────────────────────────────

    /// Stop collectors and move to `analyzing`.
    async fn begin_analysis(&self, exp: &Experiment, reason: &str) -> Result<()> {
        self.enqueue_stop_tasks(exp).await?;
        self.transition(exp.id, Phase::Analyzing, reason, |_| {}).await?;
        Ok(())
    }

    /// Cleanup-then-fail: tear down partial deployments, withdraw queued
    /// work, record the error.
    async fn fail_experiment(&self, exp: &Experiment, reason: &str) -> Result<()> {
        warn!(experiment_id = %exp.id, reason, "experiment failed");
        // Withdraw queued work first so the stop tasks enqueued next are
        // not themselves withdrawn.
        self.queue.cancel_pending(exp.id).await?;
        self.enqueue_stop_tasks(exp).await?;
        let reason_owned = reason.to_string();
        self.transition(exp.id, Phase::Failed, reason, move |exp| {
            exp.completed_at = Some(Utc::now());
            exp.status.last_error = Some(reason_owned.clone());
        })
        .await?;
        Ok(())
    }

    /// Enqueue one `stop_pipeline` task per host that has a live deployment
    /// for this experiment, skipping hosts with a stop already in flight.
    async fn enqueue_stop_tasks(&self, exp: &Experiment) -> Result<()> {
        let live = self.store.list_active_pipelines(None).await?;
        let deployed: HashSet<&str> = live
            .iter()
            .filter(|p| p.experiment_id == Some(exp.id))
            .map(|p| p.host_id.as_str())
            .collect();

        let tasks = self
            .queue
            .list(&TaskFilter {
                experiment_id: Some(exp.id),
                ..Default::default()
            })
            .await?;
        let stopping: HashSet<&str> = tasks
            .iter()
            .filter(|t| t.task_type == TaskType::StopPipeline && t.status.is_active())
            .map(|t| t.host_id.as_str())
            .collect();

        for host in deployed.difference(&stopping) {
            let task = Task::stop_pipeline(host.to_string(), Some(exp.id), None);
            self.queue.enqueue(task).await?;
        }
        Ok(())
    }

    /// Soft-record deployments for completed deploy tasks that do not have
    /// an active-pipeline row yet.
    async fn record_completed_deploys(&self, exp: &Experiment, deploys: &[&Task]) -> Result<()> {
        let live = self.store.list_active_pipelines(None).await?;
        let recorded: HashSet<(String, Variant)> = live
            .iter()
            .filter(|p| p.experiment_id == Some(exp.id))
            .map(|p| (p.host_id.clone(), p.variant))
            .collect();

        for task in deploys {
            if task.status != TaskStatus::Completed {
                continue;
            }
            let Ok(phoenix_core::TaskPayload::DeployPipeline(payload)) = task.payload() else {
                continue;
            };
            if recorded.contains(&(task.host_id.clone(), payload.variant)) {
                continue;
            }
            let pipeline = ActivePipeline::new(
                task.host_id.clone(),
                Some(exp.id),
                payload.variant,
                payload.pipeline_url.clone(),
                fingerprint(&task.config),
                payload.variables.clone(),
            );
            self.store.insert_active_pipeline(&pipeline).await?;
        }
        Ok(())
    }

    /// Soft-delete deployment records on hosts whose `stop_pipeline`
    /// tasks completed. Idempotent: only live rows are touched.
    async fn record_completed_stops(&self, exp: &Experiment) -> Result<()> {
        let tasks = self
            .queue
            .list(&TaskFilter {
                experiment_id: Some(exp.id),
                ..Default::default()
            })
            .await?;
        let stopped_hosts: HashSet<&str> = tasks
            .iter()
            .filter(|t| {
                t.task_type == TaskType::StopPipeline && t.status == TaskStatus::Completed
            })
            .map(|t| t.host_id.as_str())
            .collect();
        if stopped_hosts.is_empty() {
            return Ok(());
        }

        let live = self.store.list_active_pipelines(None).await?;
        for pipeline in live {
            if pipeline.experiment_id == Some(exp.id)
                && stopped_hosts.contains(pipeline.host_id.as_str())
            {
                self.store.stop_active_pipeline(pipeline.id).await?;
            }
        }
        Ok(())
    }

    /// Apply a phase transition with optimistic-version retries, then
    /// append the durable event and publish the bus update, in that
    /// order, so WebSocket subscribers see the event-table order.
    async fn transition<F>(
        &self,
        id: Uuid,
        phase: Phase,
        reason: &str,
        mutate: F,
    ) -> Result<Experiment>
    where
        F: Fn(&mut Experiment),
    {
        let mut last_err = None;
        for _ in 0..VERSION_RETRIES {
            let mut exp = self.store.get_experiment(id).await?;
            if exp.phase == phase {
                return Ok(exp);
            }
            exp.transition(phase, reason)?;
            mutate(&mut exp);
            match self.store.update_experiment(&exp).await {
                Ok(updated) => {
                    self.store
                        .append_event(NewEvent::phase_change(id, phase, reason))
                        .await?;
                    self.bus.publish(
                        Topic::Experiment(id),
                        DomainEvent::ExperimentUpdate {
                            experiment_id: id,
                            phase,
                            reason: reason.to_string(),
                        },
                    );
                    info!(experiment_id = %id, phase = %phase, reason, "phase transition");
                    return Ok(updated);
                }
                Err(e) if matches!(e, Error::Conflict(_)) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Conflict("transition retries exhausted".into())))
    }

    /// Non-transition mutation with the same retry discipline. The mutator
    /// returns `false` to skip the write entirely.
    async fn update_with_retries<F>(&self, id: Uuid, mutate: F) -> Result<Experiment>
    where
        F: Fn(&mut Experiment) -> bool,
    {
        let mut last_err = None;
        for _ in 0..VERSION_RETRIES {
            let mut exp = self.store.get_experiment(id).await?;
            if !mutate(&mut exp) {
                return Ok(exp);
            }
            match self.store.update_experiment(&exp).await {
                Ok(updated) => return Ok(updated),
                Err(e) if matches!(e, Error::Conflict(_)) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Conflict("update retries exhausted".into())))
    }
}

fn pipeline_for(config: &ExperimentConfig, variant: Variant) -> &PipelineRef {
    match variant {
        Variant::Baseline => &config.baseline,
        Variant::Candidate => &config.candidate,
    }
}

fn to_delta(duration: std::time::Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Content fingerprint for config-drift detection.
fn fingerprint(config: &serde_json::Value) -> String {
    let canonical = serde_json::to_string(config).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

// ── Tests ────────────────────────────────────────────────────────────
