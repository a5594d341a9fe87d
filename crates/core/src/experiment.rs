//! Experiment model and the phase transition graph.
//!
//! An experiment is a time-bounded A/B comparison between a baseline and a
//! candidate collector pipeline across a named set of hosts. Phases move
//! strictly forward along the graph below; the only "backward-looking"
//! edges are cancellation and analysis failure.
//!
//! ```text
//! pending ──► initializing ──► running ──► analyzing ──► completed
//!    │              │             │            ├────────► failed
//!    │              ├───────────► failed       │
//!    └──────────────┴─────────────┴────────────┴────────► cancelled
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::kpi::KpiSummary;
use crate::task::Variant;

// ── Phase ────────────────────────────────────────────────────────────

/// Coarse lifecycle state of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Initializing,
    Running,
    Analyzing,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    /// Whether the transition `self -> next` is an edge of the phase graph.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Pending, Initializing)
                | (Pending, Cancelled)
                | (Initializing, Running)
                | (Initializing, Failed)
                | (Initializing, Cancelled)
                | (Running, Analyzing)
                | (Running, Cancelled)
                | (Analyzing, Completed)
                | (Analyzing, Failed)
                | (Analyzing, Cancelled)
        )
    }

    /// Terminal phases never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Initializing => "initializing",
            Phase::Running => "running",
            Phase::Analyzing => "analyzing",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Configuration ────────────────────────────────────────────────────

/// Reference to a rendered pipeline configuration: template id plus the
/// variable bindings and the URL the agent fetches the rendered YAML from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRef {
    pub template: String,
    pub url: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

/// Success criteria evaluated by the KPI evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriteria {
    /// Minimum cardinality reduction, as a fraction (0.3 = 30%).
    pub min_cardinality_reduction: f64,
    /// Maximum tolerated cost increase, as a fraction of baseline.
    #[serde(default)]
    pub max_cost_increase: f64,
    /// Maximum tolerated CPU/memory overhead, as a fraction.
    #[serde(default = "default_max_overhead")]
    pub max_overhead: f64,
    /// Maximum tolerated pipeline latency increase, measured as the
    /// candidate's ingest-rate regression against baseline.
    #[serde(default = "default_max_overhead")]
    pub max_latency_increase: f64,
    /// Minimum critical-process metric retention (data accuracy floor).
    #[serde(default = "default_min_retention")]
    pub min_process_retention: f64,
}

fn default_max_overhead() -> f64 {
    0.1
}

fn default_min_retention() -> f64 {
    0.95
}

impl Default for SuccessCriteria {
    fn default() -> Self {
        Self {
            min_cardinality_reduction: 0.0,
            max_cost_increase: 0.0,
            max_overhead: default_max_overhead(),
            max_latency_increase: default_max_overhead(),
            min_process_retention: default_min_retention(),
        }
    }
}

/// Immutable experiment configuration, fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Target hosts, resolved to concrete host ids at creation time.
    pub target_hosts: Vec<String>,
    pub baseline: PipelineRef,
    pub candidate: PipelineRef,
    /// Measurement window once running.
    pub duration_secs: u64,
    /// Settling time between full deployment and measurement start.
    #[serde(default)]
    pub warmup_secs: u64,
    /// Optional load-profile hint passed through to agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_profile: Option<String>,
    #[serde(default)]
    pub criteria: SuccessCriteria,
}

// ── Mutable status ───────────────────────────────────────────────────

/// Rolling status snapshot, updated by the state machine and KPI evaluator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentStatus {
    /// Hosts with a live deployment for this experiment.
    pub active_hosts: u32,
    /// Most recent KPI snapshot, if any evaluation has run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kpi: Option<KpiSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// One phase-transition record kept on the experiment itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub phase: Phase,
    pub reason: String,
    pub last_transition_time: DateTime<Utc>,
}

// ── Experiment ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Uuid,
    /// Unique per deployment; duplicate creation returns the existing row.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub phase: Phase,
    pub config: ExperimentConfig,
    #[serde(default)]
    pub status: ExperimentStatus,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Set by the promote verb after completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_variant: Option<Variant>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Optimistic concurrency version, bumped on every store write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Experiment {
    /// Construct a fresh `pending` experiment.
    pub fn new(name: impl Into<String>, config: ExperimentConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            phase: Phase::Pending,
            config,
            status: ExperimentStatus::default(),
            conditions: Vec::new(),
            promoted_variant: None,
            metadata: HashMap::new(),
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply a phase transition, recording the condition entry.
    ///
    /// Returns a precondition error when the edge is not in the phase graph;
    /// re-applying the current phase is a no-op (idempotent reconcile).
    pub fn transition(&mut self, next: Phase, reason: impl Into<String>) -> crate::Result<()> {
        if self.phase == next {
            return Ok(());
        }
        if !self.phase.can_transition_to(next) {
            return Err(crate::Error::Precondition(format!(
                "experiment {} cannot move {} -> {}",
                self.id, self.phase, next
            )));
        }
        self.phase = next;
        self.updated_at = Utc::now();
        self.conditions.push(Condition {
            phase: next,
            reason: reason.into(),
            last_transition_time: self.updated_at,
        });
        Ok(())
    }

    /// Timestamp of the most recent transition into the current phase.
    pub fn phase_since(&self) -> Option<DateTime<Utc>> {
        self.conditions
            .iter()
            .rev()
            .find(|c| c.phase == self.phase)
            .map(|c| c.last_transition_time)
    }

    /// Validate a creation request before it reaches the store.
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::Error::Validation("experiment name is empty".into()));
        }
        if self.config.target_hosts.is_empty() {
            return Err(crate::Error::Validation(
                "experiment targets no hosts".into(),
            ));
        }
        if self.config.duration_secs == 0 {
            return Err(crate::Error::Validation("duration must be positive".into()));
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ExperimentConfig {
        ExperimentConfig {
            target_hosts: vec!["h1".into(), "h2".into()],
            baseline: PipelineRef {
                template: "baseline".into(),
                url: "http://configs/baseline.yaml".into(),
                variables: HashMap::new(),
            },
            candidate: PipelineRef {
                template: "adaptive".into(),
                url: "http://configs/candidate.yaml".into(),
                variables: HashMap::new(),
            },
            duration_secs: 300,
            warmup_secs: 30,
            load_profile: None,
            criteria: SuccessCriteria::default(),
        }
    }

    #[test]
    fn test_phase_graph_forward_edges() {
        assert!(Phase::Pending.can_transition_to(Phase::Initializing));
        assert!(Phase::Initializing.can_transition_to(Phase::Running));
        assert!(Phase::Running.can_transition_to(Phase::Analyzing));
        assert!(Phase::Analyzing.can_transition_to(Phase::Completed));
        assert!(Phase::Analyzing.can_transition_to(Phase::Failed));
    }

    #[test]
    fn test_phase_graph_cancellation_edges() {
        for from in [
            Phase::Pending,
            Phase::Initializing,
            Phase::Running,
            Phase::Analyzing,
        ] {
            assert!(from.can_transition_to(Phase::Cancelled), "{from} -> cancelled");
        }
    }

    #[test]
    fn test_phase_graph_rejects_backward_edges() {
        assert!(!Phase::Running.can_transition_to(Phase::Initializing));
        assert!(!Phase::Analyzing.can_transition_to(Phase::Running));
        assert!(!Phase::Completed.can_transition_to(Phase::Running));
        assert!(!Phase::Cancelled.can_transition_to(Phase::Pending));
        assert!(!Phase::Pending.can_transition_to(Phase::Running));
    }

    #[test]
    fn test_terminal_phases() {
        assert!(Phase::Completed.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(Phase::Cancelled.is_terminal());
        assert!(!Phase::Running.is_terminal());
    }

    #[test]
    fn test_transition_records_condition() {
        let mut exp = Experiment::new("exp-a", config());
        exp.transition(Phase::Initializing, "reconcile").unwrap();
        assert_eq!(exp.phase, Phase::Initializing);
        assert_eq!(exp.conditions.len(), 1);
        assert_eq!(exp.conditions[0].reason, "reconcile");
        assert!(exp.phase_since().is_some());
    }

    #[test]
    fn test_transition_same_phase_is_noop() {
        let mut exp = Experiment::new("exp-a", config());
        exp.transition(Phase::Initializing, "first").unwrap();
        exp.transition(Phase::Initializing, "again").unwrap();
        assert_eq!(exp.conditions.len(), 1, "re-applying a phase adds nothing");
    }

    #[test]
    fn test_transition_invalid_edge_is_precondition() {
        let mut exp = Experiment::new("exp-a", config());
        let err = exp.transition(Phase::Running, "skip ahead").unwrap_err();
        assert_eq!(err.code(), "invalid_phase");
        assert_eq!(exp.phase, Phase::Pending, "phase unchanged on error");
    }

    #[test]
    fn test_validate_rejects_empty_targets() {
        let mut cfg = config();
        cfg.target_hosts.clear();
        let exp = Experiment::new("exp-a", cfg);
        assert_eq!(exp.validate().unwrap_err().code(), "validation_failed");
    }

    #[test]
    fn test_phase_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&Phase::Initializing).unwrap(),
            r#""initializing""#
        );
        let p: Phase = serde_json::from_str(r#""analyzing""#).unwrap();
        assert_eq!(p, Phase::Analyzing);
    }

    #[test]
    fn test_criteria_defaults() {
        let json = r#"{"min_cardinality_reduction":0.3}"#;
        let c: SuccessCriteria = serde_json::from_str(json).unwrap();
        assert_eq!(c.min_cardinality_reduction, 0.3);
        assert_eq!(c.max_overhead, 0.1);
        assert_eq!(c.max_latency_increase, 0.1);
        assert_eq!(c.min_process_retention, 0.95);
    }
}
