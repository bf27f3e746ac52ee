//! CLI command implementations.

pub mod run;
pub mod state;

use anyhow::{Context, Result};
use stagegate_config::load_pipeline;
use stagegate_core::Plan;
use stagegate_deployer::LocalDeployer;
use std::path::Path;

use state::StateDir;

pub(crate) fn load(path: &str) -> Result<Plan> {
    load_pipeline(path).with_context(|| format!("Failed to load pipeline definition: {}", path))
}

pub fn validate(path: &str) -> Result<()> {
    match load_pipeline(path) {
        Ok(plan) => {
            println!(
                "Pipeline '{}' is valid ({} stages)",
                plan.name(),
                plan.stages().count()
            );
            for warning in plan.warnings() {
                println!("  warning: {}", warning);
            }
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

pub fn plan(path: &str) -> Result<()> {
    let plan = load(path)?;
    println!("{}", plan.to_json()?);
    Ok(())
}

pub fn approve(path: &str, state_dir: &Path, stage: &str, by: Option<String>) -> Result<()> {
    let plan = load(path)?;
    let planned = plan
        .stage(stage)
        .with_context(|| format!("Pipeline '{}' has no stage '{}'", plan.name(), stage))?;

    let state = StateDir::new(state_dir);
    let mut approvals = state.load_approvals()?;
    approvals.approve(stage, planned.digest, by);
    state.save_approvals(&approvals)?;

    println!(
        "Approved stage '{}' at digest {}",
        stage,
        &planned.digest[..12.min(planned.digest.len())]
    );
    Ok(())
}

pub async fn status(state_dir: &Path) -> Result<()> {
    let deployer = LocalDeployer::new(state_dir);
    let snapshots = deployer
        .snapshots()
        .await
        .with_context(|| format!("Failed to read state directory: {}", state_dir.display()))?;

    if snapshots.is_empty() {
        println!("No deployments recorded in {}", state_dir.display());
        return Ok(());
    }

    println!("{:<20} {:<24} {:<28} {:>6}  DEPLOYED", "STAGE", "UNIT", "ENV", "GRANTS");
    for (stage, snapshot) in snapshots {
        println!(
            "{:<20} {:<24} {:<28} {:>6}  {}",
            stage,
            snapshot.unit,
            snapshot.env.to_string(),
            snapshot.grants.len(),
            snapshot.deployed_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    let approvals = StateDir::new(state_dir).load_approvals()?;
    for approval in approvals.iter() {
        println!(
            "approved: {} by {} at {}",
            approval.stage,
            approval.approved_by.as_deref().unwrap_or("unknown"),
            approval.approved_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}
