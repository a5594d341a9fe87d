//! KPI results and success-criteria evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::experiment::SuccessCriteria;

/// Baseline/candidate pair for one resource dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DimensionDelta {
    pub baseline: f64,
    pub candidate: f64,
    /// `(baseline - candidate) / baseline`, clamped to [-1, 1].
    pub reduction: f64,
}

impl DimensionDelta {
    pub fn from_pair(baseline: f64, candidate: f64) -> Self {
        Self {
            baseline,
            candidate,
            reduction: reduction(baseline, candidate),
        }
    }

    /// Positive overhead fraction when the candidate costs more.
    pub fn overhead(&self) -> f64 {
        (-self.reduction).max(0.0)
    }
}

/// Relative reduction, clamped so a pathological sample cannot dominate.
pub fn reduction(baseline: f64, candidate: f64) -> f64 {
    if baseline <= 0.0 {
        return 0.0;
    }
    ((baseline - candidate) / baseline).clamp(-1.0, 1.0)
}

/// One full KPI evaluation for an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiResult {
    pub experiment_id: Uuid,
    pub calculated_at: DateTime<Utc>,
    /// Fractional reduction in active series count.
    pub cardinality_reduction: f64,
    /// Fractional reduction in projected dollar cost.
    pub cost_reduction: f64,
    pub cpu: DimensionDelta,
    pub memory: DimensionDelta,
    pub ingest_rate: DimensionDelta,
    /// Critical-process metric retention, 1.0 = nothing lost.
    pub data_accuracy: f64,
    pub criteria_met: bool,
    /// Per-query failures absorbed during evaluation.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl KpiResult {
    /// Check the success-criteria conjunction against this result: the
    /// cardinality floor, the cost ceiling, CPU/memory/latency overhead
    /// bounds, and the retention floor all have to hold.
    pub fn meets(&self, criteria: &SuccessCriteria) -> bool {
        self.cardinality_reduction >= criteria.min_cardinality_reduction
            && self.cost_reduction >= -criteria.max_cost_increase
            && self.cpu.overhead() <= criteria.max_overhead
            && self.memory.overhead() <= criteria.max_overhead
            && self.ingest_rate.overhead() <= criteria.max_latency_increase
            && self.data_accuracy >= criteria.min_process_retention
    }

    pub fn summary(&self) -> KpiSummary {
        KpiSummary {
            calculated_at: self.calculated_at,
            cardinality_reduction: self.cardinality_reduction,
            cost_reduction: self.cost_reduction,
            criteria_met: self.criteria_met,
        }
    }
}

/// Compact snapshot embedded in `ExperimentStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KpiSummary {
    pub calculated_at: DateTime<Utc>,
    pub cardinality_reduction: f64,
    pub cost_reduction: f64,
    pub criteria_met: bool,
}

// ── Tests ────────────────────────────────────────────────────────────
