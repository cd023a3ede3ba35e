use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What the startup sweep does with rows left in `processing` by a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePolicy {
    /// Put the row back to `pending` and enqueue it again.
    #[default]
    Requeue,
    /// Fail the row with an "interrupted" message.
    Fail,
}

impl FromStr for ReconcilePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "requeue" => Ok(Self::Requeue),
            "fail" => Ok(Self::Fail),
            other => Err(format!("unknown reconcile policy '{other}'")),
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Model artifact that must exist before the executor is registered.
    pub model_path: Option<PathBuf>,
    /// Refuse to register the executor unless the inference service reports
    /// healthy during setup.
    pub require_healthy: bool,
    /// Run feature extraction after a successful segmentation.
    pub extract_features: bool,
    pub reconcile_policy: ReconcilePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            require_healthy: false,
            extract_features: true,
            reconcile_policy: ReconcilePolicy::default(),
        }
    }
}
