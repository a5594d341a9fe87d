//! Metric cache rows: agent-pushed samples buffered for the REST surface.
//!
//! Insert-only; rows past the retention window are swept by a background
//! loop. The KPI evaluator does not read this cache, it queries the
//! external metrics backend directly.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::Variant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRow {
    pub experiment_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<Variant>,
    pub host_id: String,
    pub value: f64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_row_serde() {
        let row = MetricRow {
            experiment_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            metric_name: "phoenix_active_series".into(),
            variant: Some(Variant::Candidate),
            host_id: "h1".into(),
            value: 1234.0,
            labels: HashMap::from([("job".into(), "collector".into())]),
        };
        let json = serde_json::to_string(&row).unwrap();
        let parsed: MetricRow = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.metric_name, "phoenix_active_series");
        assert_eq!(parsed.variant, Some(Variant::Candidate));
        assert_eq!(parsed.labels["job"], "collector");
    }
}
