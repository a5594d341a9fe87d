//! Agent fleet records and derived liveness.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Point-in-time resource usage reported with a heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_bytes: u64,
}

/// Liveness tier derived from heartbeat age, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Healthy,
    Degraded,
    Offline,
}

impl Liveness {
    /// `healthy` within 2 heartbeat intervals, `degraded` within 5, else `offline`.
    pub fn derive(
        last_heartbeat: DateTime<Utc>,
        now: DateTime<Utc>,
        heartbeat_interval: Duration,
    ) -> Self {
        let age = (now - last_heartbeat).num_milliseconds().max(0) as u128;
        let interval = heartbeat_interval.as_millis().max(1);
        if age <= 2 * interval {
            Liveness::Healthy
        } else if age <= 5 * interval {
            Liveness::Degraded
        } else {
            Liveness::Offline
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Liveness::Healthy => "healthy",
            Liveness::Degraded => "degraded",
            Liveness::Offline => "offline",
        }
    }
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One known host, keyed by the stable agent-supplied host id.
///
/// Created on first heartbeat or poll; never deleted, only marked offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub host_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
    /// Agent-declared status string, passed through untrusted.
    #[serde(default)]
    pub declared_status: String,
    #[serde(default)]
    pub capabilities: HashMap<String, String>,
    #[serde(default)]
    pub active_tasks: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceUsage>,
    pub first_seen: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentRecord {
    /// Fresh record for a host seen for the first time.
    pub fn first_seen_now(host_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            host_id: host_id.into(),
            hostname: None,
            address: None,
            agent_version: None,
            declared_status: String::new(),
            capabilities: HashMap::new(),
            active_tasks: Vec::new(),
            resources: None,
            first_seen: now,
            last_heartbeat: now,
        }
    }

    pub fn liveness(&self, now: DateTime<Utc>, heartbeat_interval: Duration) -> Liveness {
        Liveness::derive(self.last_heartbeat, now, heartbeat_interval)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
