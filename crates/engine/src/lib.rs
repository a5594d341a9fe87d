//! Experiment engine: the lifecycle state machine, the per-experiment
//! reconciler actors, and the KPI evaluator.

mod kpi;
mod machine;
mod metrics;
mod supervisor;

pub use kpi::{run_evaluator, KpiEvaluator};
pub use machine::StateMachine;
pub use metrics::{MetricsBackend, MockBackend, PromBackend};
pub use supervisor::{run_supervisor, Supervisor};
