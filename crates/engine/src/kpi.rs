//! KPI evaluator.
//!
//! On a timer, queries the metrics backend for both variants of every
//! running or analyzing experiment, computes clamped reductions, persists
//! a `KpiResult` and publishes it. Individual query failures are absorbed
//! into the result; only a fully-failed evaluation counts against the
//! experiment, and three consecutive total failures during analysis fail
//! it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use phoenix_bus::{DomainEvent, EventBus, Topic};
use phoenix_core::{
    reduction, DimensionDelta, Error, Experiment, KpiConfig, KpiResult, Phase, Result, Variant,
};
use phoenix_store::Store;

use crate::machine::StateMachine;

/// Consecutive total failures tolerated while analyzing.
const MAX_EVALUATION_FAILURES: u32 = 3;

/// Seconds in the 30-day month the cost model is quoted against.
const MONTH_SECS: f64 = 30.0 * 86_400.0;

pub struct KpiEvaluator {
    store: Arc<dyn Store>,
    bus: EventBus,
    machine: Arc<StateMachine>,
    backend: Arc<dyn crate::MetricsBackend>,
    config: KpiConfig,
    /// Consecutive total-failure streak per experiment.
    failures: Mutex<HashMap<Uuid, u32>>,
}

/// Scalar answers for one variant.
struct VariantSample {
    series: f64,
    bytes_rate: f64,
    cpu: f64,
    memory: f64,
    ingest_rate: f64,
    critical_series: f64,
}

impl KpiEvaluator {
    pub fn new(
        store: Arc<dyn Store>,
        bus: EventBus,
        machine: Arc<StateMachine>,
        backend: Arc<dyn crate::MetricsBackend>,
        config: KpiConfig,
    ) -> Self {
        Self {
            store,
            bus,
            machine,
            backend,
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate one experiment and persist/publish the result.
    ///
    /// Errors only when every query failed (nothing to compute from).
    pub async fn evaluate(&self, exp: &Experiment) -> Result<KpiResult> {
        let mut errors = Vec::new();
        let baseline = self
            .sample_variant(exp.id, Variant::Baseline, &mut errors)
            .await;
        let candidate = self
            .sample_variant(exp.id, Variant::Candidate, &mut errors)
            .await;

        // 6 scalar queries per variant.
        if errors.len() >= 12 {
            return Err(Error::Transient(format!(
                "all KPI queries failed for experiment {}",
                exp.id
            )));
        }

        let baseline_cost = self.monthly_cost(&baseline);
        let candidate_cost = self.monthly_cost(&candidate);

        let accuracy = if baseline.critical_series <= 0.0 {
            1.0
        } else {
            (candidate.critical_series / baseline.critical_series).clamp(0.0, 1.0)
        };

        let mut result = KpiResult {
            experiment_id: exp.id,
            calculated_at: Utc::now(),
            cardinality_reduction: reduction(baseline.series, candidate.series),
            cost_reduction: reduction(baseline_cost, candidate_cost),
            cpu: DimensionDelta::from_pair(baseline.cpu, candidate.cpu),
            memory: DimensionDelta::from_pair(baseline.memory, candidate.memory),
            ingest_rate: DimensionDelta::from_pair(baseline.ingest_rate, candidate.ingest_rate),
            data_accuracy: accuracy,
            criteria_met: false,
            errors,
        };
        result.criteria_met = result.meets(&exp.config.criteria);

        self.store.insert_kpi_result(&result).await?;
        self.record_snapshot(exp.id, &result).await;
        self.bus.publish(
            Topic::Metrics(exp.id),
            DomainEvent::KpiUpdate {
                experiment_id: exp.id,
                result: Box::new(result.clone()),
            },
        );
        debug!(
            experiment_id = %exp.id,
            cardinality_reduction = result.cardinality_reduction,
            cost_reduction = result.cost_reduction,
            criteria_met = result.criteria_met,
            query_errors = result.errors.len(),
            "kpi evaluated"
        );
        Ok(result)
    }

    /// One evaluator pass over every running/analyzing experiment,
    /// tracking total-failure streaks.
    pub async fn evaluate_all(&self) -> Result<()> {
        let mut experiments = self.store.list_experiments(Some(Phase::Running)).await?;
        experiments.extend(self.store.list_experiments(Some(Phase::Analyzing)).await?);

        for exp in experiments {
            match self.evaluate(&exp).await {
                Ok(_) => {
                    self.lock_failures().remove(&exp.id);
                }
                Err(e) => {
                    let streak = {
                        let mut failures = self.lock_failures();
                        let streak = failures.entry(exp.id).or_insert(0);
                        *streak += 1;
                        *streak
                    };
                    warn!(
                        experiment_id = %exp.id,
                        streak,
                        error = %e,
                        "kpi evaluation failed"
                    );
                    if exp.phase == Phase::Analyzing && streak >= MAX_EVALUATION_FAILURES {
                        self.machine
                            .fail_analysis(exp.id, "kpi evaluation failing repeatedly")
                            .await?;
                        self.lock_failures().remove(&exp.id);
                    }
                }
            }
        }
        Ok(())
    }

    async fn sample_variant(
        &self,
        experiment_id: Uuid,
        variant: Variant,
        errors: &mut Vec<String>,
    ) -> VariantSample {
        let selector = format!(r#"experiment_id="{experiment_id}",variant="{variant}""#);

        VariantSample {
            series: self
                .scalar(format!("sum(otelcol_active_series{{{selector}}})"), errors)
                .await,
            bytes_rate: self
                .scalar(
                    format!("sum(rate(otelcol_exporter_sent_bytes_total{{{selector}}}[5m]))"),
                    errors,
                )
                .await,
            cpu: self
                .scalar(
                    format!("avg(otelcol_process_cpu_percent{{{selector}}})"),
                    errors,
                )
                .await,
            memory: self
                .scalar(
                    format!("avg(otelcol_process_memory_percent{{{selector}}})"),
                    errors,
                )
                .await,
            ingest_rate: self
                .scalar(
                    format!(
                        "sum(rate(otelcol_receiver_accepted_metric_points_total{{{selector}}}[5m]))"
                    ),
                    errors,
                )
                .await,
            critical_series: self
                .scalar(
                    format!("sum(otelcol_critical_process_series{{{selector}}})"),
                    errors,
                )
                .await,
        }
    }

    /// One scalar query; a failure is absorbed into `errors` and reads as 0.
    async fn scalar(&self, promql: String, errors: &mut Vec<String>) -> f64 {
        match self.backend.query(&promql).await {
            Ok(value) => value,
            Err(e) => {
                errors.push(format!("{promql}: {e}"));
                0.0
            }
        }
    }

    /// Projected monthly dollar cost from cardinality and ingest volume.
    fn monthly_cost(&self, sample: &VariantSample) -> f64 {
        sample.series * self.config.cost_per_series
            + sample.bytes_rate * MONTH_SECS / 1e9 * self.config.cost_per_gb
    }

    /// Refresh the rolling KPI snapshot on the experiment row; a lost
    /// version race just means a fresher writer won.
    async fn record_snapshot(&self, id: Uuid, result: &KpiResult) {
        for _ in 0..3 {
            let Ok(mut exp) = self.store.get_experiment(id).await else {
                return;
            };
            exp.status.kpi = Some(result.summary());
            exp.updated_at = Utc::now();
            match self.store.update_experiment(&exp).await {
                Ok(_) => return,
                Err(Error::Conflict(_)) => continue,
                Err(e) => {
                    warn!(experiment_id = %id, error = %e, "kpi snapshot write failed");
                    return;
                }
            }
        }
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, u32>> {
        match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Timer loop driving [`KpiEvaluator::evaluate_all`].
pub async fn run_evaluator(evaluator: Arc<KpiEvaluator>) {
    let interval = evaluator.config.evaluation_interval();
    info!(interval_secs = interval.as_secs(), "kpi evaluator started");
    loop {
        tokio::time::sleep(interval).await;
        if let Err(e) = evaluator.evaluate_all().await {
            warn!(error = %e, "kpi evaluator pass failed");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    use phoenix_core::{
        ExperimentConfig, ExperimentTimeouts, PipelineRef, SuccessCriteria,
    };
    use phoenix_queue::TaskQueue;
    use phoenix_store::MemStore;

    use crate::MockBackend;

    fn kpi_config() -> KpiConfig {
        KpiConfig {
            evaluation_interval_secs: 60,
            metrics_url: "http://localhost:9090".into(),
            cost_per_series: 0.0001,
            cost_per_gb: 0.25,
        }
    }

    fn experiment_config() -> ExperimentConfig {
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
            criteria: SuccessCriteria {
                min_cardinality_reduction: 0.3,
                ..SuccessCriteria::default()
            },
        }
    }

    struct Rig {
        store: Arc<dyn Store>,
        machine: Arc<StateMachine>,
        mock: Arc<MockBackend>,
        evaluator: KpiEvaluator,
    }

    fn rig() -> Rig {
        let bus = EventBus::new();
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let queue = TaskQueue::new(store.clone(), bus.clone());
        let machine = Arc::new(StateMachine::new(
            store.clone(),
            queue,
            bus.clone(),
            ExperimentTimeouts {
                init_timeout_secs: 30,
                analysis_timeout_secs: 30,
                reconcile_interval_secs: 1,
            },
        ));
        let mock = Arc::new(MockBackend::new());
        let evaluator = KpiEvaluator::new(
            store.clone(),
            bus,
            machine.clone(),
            mock.clone(),
            kpi_config(),
        );
        Rig {
            store,
            machine,
            mock,
            evaluator,
        }
    }

    async fn stored_experiment(rig: &Rig, phase: Phase) -> Experiment {
        let exp = rig
            .machine
            .create("exp-kpi".into(), None, experiment_config())
            .await
            .unwrap();
        let mut current = rig.store.get_experiment(exp.id).await.unwrap();
        for next in [Phase::Initializing, Phase::Running, Phase::Analyzing] {
            if current.phase == phase {
                break;
            }
            current.transition(next, "test setup").unwrap();
            current = rig.store.update_experiment(&current).await.unwrap();
        }
        current
    }

    #[tokio::test]
    async fn test_evaluate_computes_reductions() {
        let rig = rig();
        let exp = stored_experiment(&rig, Phase::Running).await;

        // Variant-specific answers, matched by label selector substring.
        let b = r#"variant="baseline""#;
        let c = r#"variant="candidate""#;
        for (needle, series, bytes, cpu, mem, ingest, critical) in [
            (b, 100_000.0, 1_000_000.0, 20.0, 30.0, 50_000.0, 500.0),
            (c, 40_000.0, 400_000.0, 21.0, 29.0, 48_000.0, 495.0),
        ] {
            rig.mock
                .answer(format!("otelcol_active_series{{experiment_id=\"{}\",{}", exp.id, needle), series);
            rig.mock
                .answer(format!("otelcol_exporter_sent_bytes_total{{experiment_id=\"{}\",{}", exp.id, needle), bytes);
            rig.mock
                .answer(format!("otelcol_process_cpu_percent{{experiment_id=\"{}\",{}", exp.id, needle), cpu);
            rig.mock
                .answer(format!("otelcol_process_memory_percent{{experiment_id=\"{}\",{}", exp.id, needle), mem);
            rig.mock
                .answer(format!("otelcol_receiver_accepted_metric_points_total{{experiment_id=\"{}\",{}", exp.id, needle), ingest);
            rig.mock
                .answer(format!("otelcol_critical_process_series{{experiment_id=\"{}\",{}", exp.id, needle), critical);
        }

        let result = rig.evaluator.evaluate(&exp).await.unwrap();
        assert!((result.cardinality_reduction - 0.6).abs() < 1e-9);
        assert!(result.cost_reduction > 0.0);
        assert!((result.data_accuracy - 0.99).abs() < 1e-9);
        assert!(result.criteria_met);
        assert!(result.errors.is_empty());

        // Result is durable and snapshotted onto the experiment.
        let stored = rig.store.latest_kpi_result(exp.id).await.unwrap().unwrap();
        assert!(stored.criteria_met);
        let exp = rig.store.get_experiment(exp.id).await.unwrap();
        assert!(exp.status.kpi.unwrap().criteria_met);
    }

    #[tokio::test]
    async fn test_partial_query_failure_is_absorbed() {
        let rig = rig();
        let exp = stored_experiment(&rig, Phase::Running).await;

        rig.mock.fail("otelcol_process_cpu_percent", "scrape timeout");
        rig.mock.answer("otelcol_", 100.0); // everything else answers

        let result = rig.evaluator.evaluate(&exp).await.unwrap();
        assert_eq!(result.errors.len(), 2, "one cpu query per variant failed");
        assert!(result.errors[0].contains("scrape timeout"));
    }

    #[tokio::test]
    async fn test_total_failure_errors() {
        let rig = rig();
        let exp = stored_experiment(&rig, Phase::Running).await;
        // Nothing scripted: every query fails.
        let err = rig.evaluator.evaluate(&exp).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_three_total_failures_fail_analysis() {
        let rig = rig();
        let exp = stored_experiment(&rig, Phase::Analyzing).await;

        for _ in 0..3 {
            rig.evaluator.evaluate_all().await.unwrap();
        }

        let failed = rig.store.get_experiment(exp.id).await.unwrap();
        assert_eq!(failed.phase, Phase::Failed);
        assert!(failed
            .status
            .last_error
            .as_deref()
            .unwrap()
            .contains("kpi evaluation"));
    }

    #[tokio::test]
    async fn test_failure_streak_resets_on_success() {
        let rig = rig();
        let exp = stored_experiment(&rig, Phase::Analyzing).await;

        rig.evaluator.evaluate_all().await.unwrap();
        rig.evaluator.evaluate_all().await.unwrap();

        // Backend recovers before the third strike.
        rig.mock.answer("otelcol_", 10.0);
        rig.evaluator.evaluate_all().await.unwrap();

        // Backend dies again; the streak must restart from zero.
        rig.mock.clear();
        rig.evaluator.evaluate_all().await.unwrap();
        rig.evaluator.evaluate_all().await.unwrap();

        let current = rig.store.get_experiment(exp.id).await.unwrap();
        assert_eq!(current.phase, Phase::Analyzing, "streak reset kept it alive");
    }
}
