//! Promotion orchestration for stagegate pipelines.
//!
//! Walks a validated plan stage by stage: evaluates each stage's gate,
//! deploys its units through a [`Deployer`](stagegate_core::deployer::Deployer),
//! and stops at the first blocked stage.

pub mod notify;
pub mod orchestrator;

pub use notify::LogNotifier;
pub use orchestrator::{
    BlockReason, PipelineEvent, PromotionOrchestrator, PromotionResult, RunOutcome, StageRecord,
    StageState,
};
