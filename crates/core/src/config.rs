use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_u16(key: &str, default: u16) -> Result<u16, ConfigError> {
    parse_env(key, default)
}

fn env_u32(key: &str, default: u32) -> Result<u32, ConfigError> {
    parse_env(key, default)
}

fn env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    parse_env(key, default)
}

fn env_f64(key: &str, default: f64) -> Result<f64, ConfigError> {
    parse_env(key, default)
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env_opt(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(key.to_string(), raw)),
        None => Ok(default),
    }
}

/// A config value that could not be parsed. The process exits with code 2.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: '{1}'")]
    Invalid(String, String),
}

// ── Top-level config ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoenixConfig {
    pub server: ServerConfig,
    pub postgres: PostgresConfig,
    pub agent: AgentConfig,
    pub task: TaskConfig,
    pub kpi: KpiConfig,
    pub experiment: ExperimentTimeouts,
    pub metric_cache: MetricCacheConfig,
}

impl PhoenixConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerConfig::from_env()?,
            postgres: PostgresConfig::from_env()?,
            agent: AgentConfig::from_env()?,
            task: TaskConfig::from_env()?,
            kpi: KpiConfig::from_env()?,
            experiment: ExperimentTimeouts::from_env()?,
            metric_cache: MetricCacheConfig::from_env()?,
        })
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  server:      {}:{}", self.server.host, self.server.port);
        tracing::info!(
            "  store:       {}",
            if self.postgres.is_configured() { "postgres" } else { "memory" }
        );
        tracing::info!(
            "  agent:       poll_timeout={}s, heartbeat_interval={}s",
            self.agent.poll_timeout_secs,
            self.agent.heartbeat_interval_secs
        );
        tracing::info!(
            "  task:        claim_lease={}s, max_retries={}",
            self.task.claim_lease_secs,
            self.task.max_retries
        );
        tracing::info!(
            "  kpi:         interval={}s, metrics_url={}",
            self.kpi.evaluation_interval_secs,
            self.kpi.metrics_url
        );
        tracing::info!(
            "  experiment:  init_timeout={}s, analysis_timeout={}s, reconcile={}s",
            self.experiment.init_timeout_secs,
            self.experiment.analysis_timeout_secs,
            self.experiment.reconcile_interval_secs
        );
    }
}

impl Default for PhoenixConfig {
    /// Built-in defaults, independent of the process environment.
    /// Used by tests and as the base for dev-mode overrides.
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".into(),
                port: 8080,
                api_token: None,
            },
            postgres: PostgresConfig {
                pg_url: None,
                max_connections: 10,
            },
            agent: AgentConfig {
                poll_timeout_secs: 30,
                heartbeat_interval_secs: 15,
            },
            task: TaskConfig {
                claim_lease_secs: 300,
                max_retries: 3,
            },
            kpi: KpiConfig {
                evaluation_interval_secs: 60,
                metrics_url: "http://localhost:9090".into(),
                cost_per_series: 0.0001,
                cost_per_gb: 0.25,
            },
            experiment: ExperimentTimeouts {
                init_timeout_secs: 600,
                analysis_timeout_secs: 1800,
                reconcile_interval_secs: 30,
            },
            metric_cache: MetricCacheConfig { retention_days: 7 },
        }
    }
}

// ── Server ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token required on the user surface when set.
    #[serde(default, skip_serializing)]
    pub api_token: Option<String>,
}

impl ServerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_or("HOST", "0.0.0.0"),
            port: env_u16("PORT", 8080)?,
            api_token: env_opt("PHOENIX_API_TOKEN"),
        })
    }
}

// ── PostgreSQL ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Full connection string; unset runs the in-memory store (dev/test).
    #[serde(default, skip_serializing)]
    pub pg_url: Option<String>,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            pg_url: env_opt("PG_URL"),
            max_connections: env_u32("PG_MAX_CONNECTIONS", 10)?,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.pg_url.is_some()
    }
}

// ── Agent ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum long-poll wait before responding 204.
    pub poll_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl AgentConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            poll_timeout_secs: env_u64("PHOENIX_POLL_TIMEOUT_SECS", 30)?,
            heartbeat_interval_secs: env_u64("PHOENIX_HEARTBEAT_INTERVAL_SECS", 15)?,
        })
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// How long an assignment may sit unacknowledged before requeue.
    pub claim_lease_secs: u64,
    pub max_retries: i32,
}

impl TaskConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            claim_lease_secs: env_u64("PHOENIX_CLAIM_LEASE_SECS", 300)?,
            max_retries: parse_env("PHOENIX_MAX_RETRIES", 3)?,
        })
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }
}

// ── KPI evaluation ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiConfig {
    pub evaluation_interval_secs: u64,
    /// Prometheus-compatible HTTP API base URL.
    pub metrics_url: String,
    /// Dollar rate per active series per month.
    pub cost_per_series: f64,
    /// Dollar rate per ingested GB.
    pub cost_per_gb: f64,
}

impl KpiConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            evaluation_interval_secs: env_u64("PHOENIX_KPI_INTERVAL_SECS", 60)?,
            metrics_url: env_or("PHOENIX_METRICS_URL", "http://localhost:9090"),
            cost_per_series: env_f64("PHOENIX_COST_PER_SERIES", 0.0001)?,
            cost_per_gb: env_f64("PHOENIX_COST_PER_GB", 0.25)?,
        })
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_secs)
    }
}

// ── Experiment timeouts ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentTimeouts {
    pub init_timeout_secs: u64,
    pub analysis_timeout_secs: u64,
    pub reconcile_interval_secs: u64,
}

impl ExperimentTimeouts {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            init_timeout_secs: env_u64("PHOENIX_INIT_TIMEOUT_SECS", 600)?,
            analysis_timeout_secs: env_u64("PHOENIX_ANALYSIS_TIMEOUT_SECS", 1800)?,
            reconcile_interval_secs: env_u64("PHOENIX_RECONCILE_INTERVAL_SECS", 30)?,
        })
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

// ── Metric cache ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricCacheConfig {
    pub retention_days: u32,
}

impl MetricCacheConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            retention_days: env_u32("PHOENIX_METRIC_RETENTION_DAYS", 7)?,
        })
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 86_400)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_spec() {
        let cfg = PhoenixConfig::default();
        assert_eq!(cfg.agent.poll_timeout_secs, 30);
        assert_eq!(cfg.task.claim_lease_secs, 300);
        assert_eq!(cfg.task.max_retries, 3);
        assert_eq!(cfg.agent.heartbeat_interval_secs, 15);
        assert_eq!(cfg.kpi.evaluation_interval_secs, 60);
        assert_eq!(cfg.experiment.init_timeout_secs, 600);
        assert_eq!(cfg.experiment.analysis_timeout_secs, 1800);
        assert_eq!(cfg.metric_cache.retention_days, 7);
    }

    #[test]
    fn test_duration_accessors() {
        let cfg = PhoenixConfig::default();
        assert_eq!(cfg.task.claim_lease(), Duration::from_secs(300));
        assert_eq!(cfg.agent.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(cfg.metric_cache.retention(), Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn test_parse_env_rejects_garbage() {
        // Direct parse check; environment mutation is unsafe in parallel tests.
        let err = "not-a-number".parse::<u64>();
        assert!(err.is_err());
        let cfg_err = ConfigError::Invalid("PORT".into(), "abc".into());
        assert!(cfg_err.to_string().contains("PORT"));
    }
}
