//! Local promotion command.

use anyhow::{Context, Result};
use stagegate_deployer::LocalDeployer;
use stagegate_scheduler::{
    BlockReason, LogNotifier, PipelineEvent, PromotionOrchestrator, RunOutcome, StageState,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::state::StateDir;

/// Promote a pipeline through its stages against the local state directory.
///
/// A previous run of the same pipeline that stopped at a blocked stage is
/// resumed unless `fresh` is set.
pub async fn run_local(
    config_path: &str,
    state_dir: &Path,
    run_scripts: bool,
    fresh: bool,
) -> Result<()> {
    let plan = Arc::new(super::load(config_path)?);
    for warning in plan.warnings() {
        println!("warning: {}", warning);
    }

    println!("Running pipeline: {}", plan.name());
    println!("Stages: {}", plan.stages().count());

    let mut deployer = LocalDeployer::new(state_dir);
    if run_scripts {
        // Scripts run from the directory holding the definition.
        let working_dir = Path::new(config_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .canonicalize()
            .context("Failed to resolve working directory")?;
        println!("Working directory: {}", working_dir.display());
        deployer = deployer.with_scripts(working_dir);
    }

    let state = StateDir::new(state_dir);
    let approvals = state.load_approvals()?;
    let previous = if fresh {
        None
    } else {
        state.blocked_run(plan.name())?
    };

    let orchestrator =
        PromotionOrchestrator::new(Arc::new(deployer)).with_notifier(Arc::new(LogNotifier));

    println!("\n--- Starting promotion ---\n");

    info!(
        pipeline = %plan.name(),
        state_dir = %state_dir.display(),
        approvals = approvals.iter().count(),
        run_scripts,
        "Starting promotion"
    );

    let (mut rx, result_handle) = match previous {
        Some(previous) => {
            println!("Resuming run {}", previous.run_id.short());
            orchestrator.resume(plan.clone(), previous, approvals)
        }
        None => orchestrator.execute(plan.clone(), approvals),
    };

    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::StageEvaluating { stage } => {
                println!("▶ Stage '{}' evaluating gate", stage);
            }
            PipelineEvent::GateEvaluated { stage, outcome } => {
                println!("  [{}] gate {}", stage, outcome);
                for finding in outcome.findings() {
                    println!("  [{}]! {}", stage, finding);
                }
            }
            PipelineEvent::UnitDeploying { stage, unit } => {
                println!("  [{}]  deploying {}", stage, unit);
            }
            PipelineEvent::UnitDeployed { stage, handle } => {
                println!("  [{}]* {} -> {}", stage, handle.unit, handle.deployer_ref);
            }
            PipelineEvent::StageDeployed { stage } => {
                println!("✓ Stage '{}' deployed\n", stage);
            }
            PipelineEvent::StageBlocked { stage, reason } => {
                println!("✗ Stage '{}' blocked: {}\n", stage, reason);
            }
            PipelineEvent::PipelineCompleted { outcome } => match outcome {
                RunOutcome::Succeeded => println!("--- Promotion completed ---"),
                RunOutcome::Blocked { stage } => {
                    println!("--- Promotion stopped at '{}' ---", stage)
                }
            },
        }
    }

    let result = result_handle
        .await
        .context("Promotion task failed")?;
    state.save_run(&result)?;
    info!(run_id = %result.run_id, success = result.success(), "Run recorded");

    println!("\n--- Stage Summary ---");
    for record in &result.stages {
        let status = match &record.state {
            StageState::Deployed => "✓ deployed".to_string(),
            StageState::Blocked { reason } => format!("✗ blocked: {}", reason),
            StageState::Pending => "○ pending".to_string(),
            other => format!("▶ {:?}", other),
        };
        println!("  {} - {}", record.name, status);
    }

    if result.success() {
        println!("\n✓ Pipeline promoted!");
        return Ok(());
    }

    let awaiting_gate = result.blocked_stage().filter(|stage| {
        matches!(
            stage.state,
            StageState::Blocked {
                reason: BlockReason::Gate { .. }
            }
        )
    });
    if let Some(stage) = result.blocked_stage() {
        warn!(run_id = %result.run_id, stage = %stage.name, "Promotion blocked");
    }
    if let Some(stage) = awaiting_gate {
        println!(
            "\nTo continue, review the findings and run:\n  stagegate approve {} {}",
            config_path, stage.name
        );
    }
    anyhow::bail!("Promotion blocked");
}
