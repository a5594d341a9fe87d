//! Shared harness for the server integration suites: a fully wired
//! in-process server (in-memory store, scripted metrics backend, short
//! timings) plus HTTP helpers driving the router through tower.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::util::ServiceExt;
use uuid::Uuid;

use phoenix_core::{Phase, PhoenixConfig};
use phoenix_engine::{KpiEvaluator, MetricsBackend, MockBackend, Supervisor};
use phoenix_server::{build_router, AppState};
use phoenix_store::{MemStore, Store};

pub struct Harness {
    pub state: Arc<AppState>,
    pub app: Router,
    pub mock: Arc<MockBackend>,
}

/// Build a wired server with test timings. Background loops run with a
/// 50 ms reconcile tick and a 1 s claim lease / KPI cadence.
pub fn harness(tweak: impl FnOnce(&mut PhoenixConfig)) -> Harness {
    let mut config = PhoenixConfig::default();
    config.task.claim_lease_secs = 1;
    config.kpi.evaluation_interval_secs = 1;
    config.experiment.init_timeout_secs = 30;
    config.experiment.analysis_timeout_secs = 30;
    tweak(&mut config);

    let state = AppState::new(config, Arc::new(MemStore::new()));
    let app = build_router(state.clone());

    tokio::spawn(phoenix_queue::run_recovery_loop(
        state.queue.clone(),
        state.config.task.claim_lease(),
        state.config.task.max_retries,
    ));
    tokio::spawn(
        Supervisor::new(
            state.machine.clone(),
            state.bus.clone(),
            Duration::from_millis(50),
        )
        .run(),
    );

    let mock = Arc::new(MockBackend::new());
    let backend: Arc<dyn MetricsBackend> = mock.clone();
    let evaluator = Arc::new(KpiEvaluator::new(
        state.store.clone(),
        state.bus.clone(),
        state.machine.clone(),
        backend,
        state.config.kpi.clone(),
    ));
    tokio::spawn(phoenix_engine::run_evaluator(evaluator));

    Harness { state, app, mock }
}

/// Script the metrics backend for one experiment so every dimension
/// favors the candidate by the given cardinality ratio
/// (`candidate_series / baseline_series`).
pub fn script_metrics(mock: &MockBackend, experiment_id: Uuid, candidate_ratio: f64) {
    for (variant, factor) in [("baseline", 1.0), ("candidate", candidate_ratio)] {
        let selector = format!(r#"experiment_id="{experiment_id}",variant="{variant}""#);
        mock.answer(
            format!("otelcol_active_series{{{selector}}}"),
            100_000.0 * factor,
        );
        mock.answer(
            format!("otelcol_exporter_sent_bytes_total{{{selector}}}"),
            1_000_000.0 * factor,
        );
        mock.answer(format!("otelcol_process_cpu_percent{{{selector}}}"), 20.0);
        mock.answer(format!("otelcol_process_memory_percent{{{selector}}}"), 30.0);
        mock.answer(
            format!("otelcol_receiver_accepted_metric_points_total{{{selector}}}"),
            50_000.0,
        );
        mock.answer(
            format!("otelcol_critical_process_series{{{selector}}}"),
            500.0,
        );
    }
}

// ── HTTP helpers ─────────────────────────────────────────────────────

pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    agent_host: Option<&str>,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(host) = agent_host {
        builder = builder.header("X-Agent-Host-ID", host);
    }
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

pub fn experiment_body(name: &str, hosts: &[&str], duration_secs: u64, min_card: f64) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "config": {
            "target_hosts": hosts,
            "baseline": {
                "template": "baseline",
                "url": "http://configs/baseline.yaml",
                "variables": {}
            },
            "candidate": {
                "template": "adaptive-filter-v2",
                "url": "http://configs/candidate.yaml",
                "variables": {"sample_rate": "0.1"}
            },
            "duration_secs": duration_secs,
            "warmup_secs": 0,
            "criteria": {
                "min_cardinality_reduction": min_card
            }
        }
    })
}

/// Poll the store until the experiment reaches `phase` or the deadline
/// passes.
pub async fn wait_for_phase(state: &Arc<AppState>, id: Uuid, phase: Phase, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let current = state.store.get_experiment(id).await.unwrap().phase;
        if current == phase {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "experiment stuck in {current}, wanted {phase}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// A simulated agent: long-polls over HTTP and reports every task
/// completed, until dropped.
pub fn spawn_agent(app: Router, host: &'static str) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (status, json) = send(
                &app,
                Method::GET,
                "/api/v1/agent/tasks?max_wait=1s",
                Some(host),
                None,
            )
            .await;
            if status == StatusCode::OK {
                let id = json["id"].as_str().unwrap().to_string();
                let _ = send(
                    &app,
                    Method::PUT,
                    &format!("/api/v1/agent/tasks/{id}"),
                    Some(host),
                    Some(serde_json::json!({"status": "running"})),
                )
                .await;
                let (done, _) = send(
                    &app,
                    Method::PUT,
                    &format!("/api/v1/agent/tasks/{id}"),
                    Some(host),
                    Some(serde_json::json!({"status": "completed", "result": {"ok": true}})),
                )
                .await;
                assert_eq!(done, StatusCode::NO_CONTENT);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
}
