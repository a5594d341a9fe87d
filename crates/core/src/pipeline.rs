//! Active-pipeline records: which collector variant runs where.
//!
//! Used for reconciliation and the fleet view. Stopped deployments are
//! soft-deleted by setting `stopped_at`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::Variant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivePipeline {
    pub id: Uuid,
    pub host_id: String,
    /// Unset for standalone deployments made outside any experiment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<Uuid>,
    pub variant: Variant,
    pub pipeline_url: String,
    /// Hash of the rendered config, for drift detection.
    pub config_hash: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub deployed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl ActivePipeline {
    pub fn new(
        host_id: impl Into<String>,
        experiment_id: Option<Uuid>,
        variant: Variant,
        pipeline_url: impl Into<String>,
        config_hash: impl Into<String>,
        variables: HashMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            host_id: host_id.into(),
            experiment_id,
            variant,
            pipeline_url: pipeline_url.into(),
            config_hash: config_hash.into(),
            variables,
            deployed_at: Utc::now(),
            stopped_at: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.stopped_at.is_none()
    }
}
