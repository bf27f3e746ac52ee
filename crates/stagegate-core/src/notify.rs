//! Gate notifications.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gate::GateOutcome;
use crate::id::RunId;
use crate::Result;

/// Sent to a gate's subscribers when it blocks a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateNotice {
    pub run_id: RunId,
    pub pipeline: String,
    pub stage: String,
    pub stage_digest: String,
    pub outcome: GateOutcome,
    pub subscribers: Vec<String>,
    pub raised_at: DateTime<Utc>,
}

impl GateNotice {
    pub fn subject(&self) -> String {
        format!(
            "[{}] stage '{}' blocked: {}",
            self.pipeline, self.stage, self.outcome
        )
    }
}

/// Delivers gate notices to subscribers.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: GateNotice) -> Result<()>;
}
