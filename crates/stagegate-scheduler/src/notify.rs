//! Notifier that reports gate notices through `tracing`.

use async_trait::async_trait;
use stagegate_core::Result;
use stagegate_core::notify::{GateNotice, Notifier};
use tracing::warn;

/// Emits each notice as a warning event, one per subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: GateNotice) -> Result<()> {
        for subscriber in &notice.subscribers {
            warn!(
                run_id = %notice.run_id,
                stage = %notice.stage,
                subscriber = %subscriber,
                findings = notice.outcome.findings().len(),
                "{}",
                notice.subject()
            );
        }
        for finding in notice.outcome.findings() {
            warn!(stage = %notice.stage, "  {}", finding);
        }
        Ok(())
    }
}
