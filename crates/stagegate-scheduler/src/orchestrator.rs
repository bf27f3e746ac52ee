//! Promotion orchestrator - walks a plan's stages strictly in order.
//!
//! Each stage moves `Pending -> Evaluating -> Passed -> Deploying -> Deployed`,
//! or stops in `Blocked` when its gate does not pass or a unit fails to
//! deploy. A blocked stage halts the run; later stages stay `Pending` and are
//! never evaluated. [`PromotionOrchestrator::resume`] re-evaluates the blocked
//! stage, e.g. after an approval was recorded.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use stagegate_core::deployer::{Deployer, DeploymentHandle, DeploymentSpec, UnitSnapshot};
use stagegate_core::gate::{ApprovalSet, GateContext, GateOutcome, GatePolicy};
use stagegate_core::notify::{GateNotice, Notifier};
use stagegate_core::unit::ApplicationUnit;
use stagegate_core::{DeploymentId, Plan, PlannedStage, RunId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// State of a stage during a promotion run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Evaluating,
    Passed,
    Deploying,
    Deployed,
    Blocked { reason: BlockReason },
}

impl StageState {
    pub fn is_deployed(&self) -> bool {
        matches!(self, StageState::Deployed)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, StageState::Blocked { .. })
    }
}

/// Why a stage is blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    /// The gate failed or is waiting for an approval.
    Gate { outcome: GateOutcome },
    /// The deployer reported a failure. Not retried.
    DeployFailed { unit: String, message: String },
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::Gate { outcome } => write!(f, "gate {}", outcome),
            BlockReason::DeployFailed { unit, message } => {
                write!(f, "deploy of '{}' failed: {}", unit, message)
            }
        }
    }
}

/// Event emitted during a promotion run.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StageEvaluating { stage: String },
    GateEvaluated { stage: String, outcome: GateOutcome },
    UnitDeploying { stage: String, unit: String },
    UnitDeployed { stage: String, handle: DeploymentHandle },
    StageDeployed { stage: String },
    StageBlocked { stage: String, reason: BlockReason },
    PipelineCompleted { outcome: RunOutcome },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Blocked { stage: String },
}

/// Per-stage record of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub digest: String,
    pub state: StageState,
    pub deployments: Vec<DeploymentHandle>,
}

/// Result of a promotion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionResult {
    pub run_id: RunId,
    pub pipeline: String,
    pub stages: Vec<StageRecord>,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PromotionResult {
    pub fn success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Succeeded)
    }

    pub fn state_of(&self, stage: &str) -> Option<&StageState> {
        self.stages
            .iter()
            .find(|s| s.name == stage)
            .map(|s| &s.state)
    }

    pub fn blocked_stage(&self) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.state.is_blocked())
    }
}

/// Orchestrates promotion of a plan through its stages.
pub struct PromotionOrchestrator {
    deployer: Arc<dyn Deployer>,
    notifier: Option<Arc<dyn Notifier>>,
}

struct RunState {
    run_id: RunId,
    started_at: DateTime<Utc>,
    records: Vec<StageRecord>,
    start: usize,
}

impl PromotionOrchestrator {
    pub fn new(deployer: Arc<dyn Deployer>) -> Self {
        Self {
            deployer,
            notifier: None,
        }
    }

    /// Deliver gate notices to `notifier` when a gate with subscribers blocks.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Start a fresh run, returning a channel of events and a handle to get
    /// the final result. The channel is unbounded, so the run never waits on
    /// the receiver.
    pub fn execute(
        &self,
        plan: Arc<Plan>,
        approvals: ApprovalSet,
    ) -> (
        mpsc::UnboundedReceiver<PipelineEvent>,
        tokio::task::JoinHandle<PromotionResult>,
    ) {
        let state = RunState {
            run_id: RunId::new(),
            started_at: Utc::now(),
            records: plan
                .stages()
                .map(|s| StageRecord {
                    name: s.stage.name.clone(),
                    digest: s.digest.to_string(),
                    state: StageState::Pending,
                    deployments: Vec::new(),
                })
                .collect(),
            start: 0,
        };
        self.spawn(plan, approvals, state)
    }

    /// Continue a previous run from its first stage that is not deployed.
    ///
    /// Deployed stages are kept only while they still match the plan (same
    /// position, name and digest); from the first mismatch on, stages start
    /// over as `Pending`.
    pub fn resume(
        &self,
        plan: Arc<Plan>,
        previous: PromotionResult,
        approvals: ApprovalSet,
    ) -> (
        mpsc::UnboundedReceiver<PipelineEvent>,
        tokio::task::JoinHandle<PromotionResult>,
    ) {
        let mut kept = previous.stages.into_iter();
        let mut records = Vec::new();
        let mut start = 0;
        let mut matching = true;

        for planned in plan.stages() {
            let prior = kept.next();
            match prior {
                Some(record)
                    if matching
                        && record.state.is_deployed()
                        && record.name == planned.stage.name
                        && record.digest == planned.digest =>
                {
                    records.push(record);
                    start += 1;
                }
                _ => {
                    matching = false;
                    records.push(StageRecord {
                        name: planned.stage.name.clone(),
                        digest: planned.digest.to_string(),
                        state: StageState::Pending,
                        deployments: Vec::new(),
                    });
                }
            }
        }

        info!(run_id = %previous.run_id, from_stage = start, "Resuming promotion run");

        let state = RunState {
            run_id: previous.run_id,
            started_at: previous.started_at,
            records,
            start,
        };
        self.spawn(plan, approvals, state)
    }

    fn spawn(
        &self,
        plan: Arc<Plan>,
        approvals: ApprovalSet,
        state: RunState,
    ) -> (
        mpsc::UnboundedReceiver<PipelineEvent>,
        tokio::task::JoinHandle<PromotionResult>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let deployer = self.deployer.clone();
        let notifier = self.notifier.clone();

        let handle = tokio::spawn(async move {
            Self::execute_inner(deployer, notifier, plan, approvals, state, tx).await
        });

        (rx, handle)
    }

    async fn execute_inner(
        deployer: Arc<dyn Deployer>,
        notifier: Option<Arc<dyn Notifier>>,
        plan: Arc<Plan>,
        approvals: ApprovalSet,
        mut state: RunState,
        tx: mpsc::UnboundedSender<PipelineEvent>,
    ) -> PromotionResult {
        let mut outcome = RunOutcome::Succeeded;

        for planned in plan.stages().skip(state.start) {
            let stage_name = planned.stage.name.clone();
            let record = &mut state.records[planned.index];

            record.state = StageState::Evaluating;
            record.deployments.clear();
            info!(run_id = %state.run_id, stage = %stage_name, "Evaluating stage gate");
            let _ = tx
                .send(PipelineEvent::StageEvaluating {
                    stage: stage_name.clone(),
                });

            let gate_outcome = match Self::evaluate_gate(&deployer, planned, &approvals).await {
                Ok(outcome) => outcome,
                Err(reason) => {
                    Self::block(record, reason, &tx);
                    outcome = RunOutcome::Blocked { stage: stage_name };
                    break;
                }
            };

            let _ = tx
                .send(PipelineEvent::GateEvaluated {
                    stage: stage_name.clone(),
                    outcome: gate_outcome.clone(),
                });

            if !gate_outcome.is_pass() {
                warn!(stage = %stage_name, outcome = %gate_outcome, "Stage blocked by gate");
                if let Some(notifier) = &notifier {
                    Self::send_notice(notifier, &state.run_id, &plan, planned, &gate_outcome)
                        .await;
                }
                Self::block(
                    record,
                    BlockReason::Gate {
                        outcome: gate_outcome,
                    },
                    &tx,
                );
                outcome = RunOutcome::Blocked { stage: stage_name };
                break;
            }

            record.state = StageState::Passed;
            info!(stage = %stage_name, "Gate passed");

            record.state = StageState::Deploying;
            match Self::deploy_stage(&deployer, &state.run_id, &plan, planned, &tx).await {
                Ok(handles) => {
                    record.deployments = handles;
                    record.state = StageState::Deployed;
                    info!(stage = %stage_name, units = record.deployments.len(), "Stage deployed");
                    let _ = tx
                        .send(PipelineEvent::StageDeployed {
                            stage: stage_name.clone(),
                        });
                }
                Err(reason) => {
                    error!(stage = %stage_name, reason = %reason, "Stage deploy failed");
                    Self::block(record, reason, &tx);
                    outcome = RunOutcome::Blocked { stage: stage_name };
                    break;
                }
            }
        }

        let _ = tx
            .send(PipelineEvent::PipelineCompleted {
                outcome: outcome.clone(),
            });

        PromotionResult {
            run_id: state.run_id,
            pipeline: plan.name().to_string(),
            stages: state.records,
            outcome,
            started_at: state.started_at,
            finished_at: Utc::now(),
        }
    }

    async fn evaluate_gate(
        deployer: &Arc<dyn Deployer>,
        planned: PlannedStage<'_>,
        approvals: &ApprovalSet,
    ) -> Result<GateOutcome, BlockReason> {
        let stage = planned.stage;
        let policy = stage.gate().cloned().unwrap_or(GatePolicy::None);

        let mut snapshots: HashMap<String, UnitSnapshot> = HashMap::new();
        if matches!(policy, GatePolicy::SecurityDiff { .. }) {
            for unit in stage.units() {
                match deployer.snapshot(&stage.name, unit).await {
                    Ok(Some(snapshot)) => {
                        snapshots.insert(unit.name.clone(), snapshot);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        return Err(BlockReason::DeployFailed {
                            unit: unit.name.clone(),
                            message: format!("failed to read deployed state: {}", e),
                        });
                    }
                }
            }
        }

        Ok(policy.evaluate(&GateContext {
            stage,
            digest: planned.digest,
            snapshots: &snapshots,
            approvals,
        }))
    }

    /// Deploy every stack unit concurrently, then every script unit. Any
    /// failure fails the whole stage.
    async fn deploy_stage(
        deployer: &Arc<dyn Deployer>,
        run_id: &RunId,
        plan: &Plan,
        planned: PlannedStage<'_>,
        tx: &mpsc::UnboundedSender<PipelineEvent>,
    ) -> Result<Vec<DeploymentHandle>, BlockReason> {
        let (scripts, stacks): (Vec<&ApplicationUnit>, Vec<&ApplicationUnit>) =
            planned.stage.units().iter().partition(|u| u.is_script());

        let mut handles = Vec::new();
        for wave in [stacks, scripts] {
            if wave.is_empty() {
                continue;
            }

            for unit in &wave {
                let _ = tx
                    .send(PipelineEvent::UnitDeploying {
                        stage: planned.stage.name.clone(),
                        unit: unit.name.clone(),
                    });
            }

            let results = join_all(wave.iter().map(|unit| {
                let spec = DeploymentSpec {
                    id: DeploymentId::new(),
                    run_id: *run_id,
                    pipeline: plan.name().to_string(),
                    stage: planned.stage.name.clone(),
                    stage_digest: planned.digest.to_string(),
                    unit: (*unit).clone(),
                };
                let deployer = deployer.clone();
                async move { deployer.deploy(spec).await }
            }))
            .await;

            let mut failure = None;
            for (unit, result) in wave.iter().zip(results) {
                match result {
                    Ok(handle) => {
                        let _ = tx
                            .send(PipelineEvent::UnitDeployed {
                                stage: planned.stage.name.clone(),
                                handle: handle.clone(),
                            });
                        handles.push(handle);
                    }
                    Err(e) => {
                        error!(stage = %planned.stage.name, unit = %unit.name, error = %e, "Unit deploy failed");
                        failure.get_or_insert(BlockReason::DeployFailed {
                            unit: unit.name.clone(),
                            message: e.to_string(),
                        });
                    }
                }
            }

            if let Some(reason) = failure {
                return Err(reason);
            }
        }

        Ok(handles)
    }

    fn block(
        record: &mut StageRecord,
        reason: BlockReason,
        tx: &mpsc::UnboundedSender<PipelineEvent>,
    ) {
        record.state = StageState::Blocked {
            reason: reason.clone(),
        };
        let _ = tx
            .send(PipelineEvent::StageBlocked {
                stage: record.name.clone(),
                reason,
            });
    }

    async fn send_notice(
        notifier: &Arc<dyn Notifier>,
        run_id: &RunId,
        plan: &Plan,
        planned: PlannedStage<'_>,
        outcome: &GateOutcome,
    ) {
        let subscribers = planned
            .stage
            .gate()
            .map(|g| g.notify_targets().to_vec())
            .unwrap_or_default();
        if subscribers.is_empty() {
            return;
        }

        let notice = GateNotice {
            run_id: *run_id,
            pipeline: plan.name().to_string(),
            stage: planned.stage.name.clone(),
            stage_digest: planned.digest.to_string(),
            outcome: outcome.clone(),
            subscribers,
            raised_at: Utc::now(),
        };
        if let Err(e) = notifier.notify(notice).await {
            warn!(stage = %planned.stage.name, error = %e, "Failed to deliver gate notice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagegate_core::gate::{BroadeningRule, OnBroadening};
    use stagegate_core::secret::SecretRef;
    use stagegate_core::source::{BuildStep, SourceSpec};
    use stagegate_core::unit::{Environment, Grant, Principal, Resource};
    use stagegate_core::{Stage, define_pipeline};
    use stagegate_deployer::MemoryDeployer;
    use tokio::sync::Mutex;

    const ACCOUNT: &str = "045046196850";

    fn env() -> Environment {
        Environment::new(ACCOUNT, "us-west-2")
    }

    fn unit(name: &str, principal: Principal) -> ApplicationUnit {
        ApplicationUnit::stack(name, env()).with_resource(
            Resource::new(format!("{name}Bucket"), "s3:Bucket")
                .with_grant(Grant::new(principal, ["s3:GetObject"])),
        )
    }

    fn plain_stage(name: &str, unit_name: &str) -> Stage {
        Stage::new(name)
            .with_application(unit(unit_name, Principal::Account(ACCOUNT.to_string())))
            .unwrap()
    }

    fn plan(stages: Vec<Stage>) -> Arc<Plan> {
        Arc::new(
            define_pipeline(
                "TestPipeline",
                env(),
                SourceSpec::github(
                    "BryanPan342",
                    "test-cdk",
                    "main",
                    SecretRef::secrets_manager("github-token"),
                ),
                BuildStep::yarn(Some("yarn build".to_string())),
                stages,
            )
            .unwrap(),
        )
    }

    /// `[PreProd(security-diff, A), Prod(no gate, B)]`
    fn security_plan(a_principal: Principal) -> Arc<Plan> {
        let preprod = Stage::new("PreProd")
            .with_gate(GatePolicy::security_diff())
            .with_application(unit("A", a_principal))
            .unwrap();
        plan(vec![preprod, plain_stage("Prod", "B")])
    }

    async fn run(
        deployer: Arc<MemoryDeployer>,
        plan: Arc<Plan>,
        approvals: ApprovalSet,
    ) -> (PromotionResult, Vec<PipelineEvent>) {
        let orchestrator = PromotionOrchestrator::new(deployer);
        let (mut rx, handle) = orchestrator.execute(plan, approvals);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (handle.await.unwrap(), events)
    }

    fn evaluated(events: &[PipelineEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::StageEvaluating { stage } => Some(stage.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_stages_evaluated_in_declaration_order() {
        let deployer = Arc::new(MemoryDeployer::new());
        let plan = plan(vec![
            plain_stage("Gamma", "A"),
            plain_stage("Alpha", "B"),
            plain_stage("Beta", "C"),
        ]);

        let (result, events) = run(deployer.clone(), plan, ApprovalSet::new()).await;

        assert!(result.success());
        assert_eq!(evaluated(&events), vec!["Gamma", "Alpha", "Beta"]);
        let deployed: Vec<_> = deployer
            .history()
            .await
            .into_iter()
            .map(|r| r.stage)
            .collect();
        assert_eq!(deployed, vec!["Gamma", "Alpha", "Beta"]);
    }

    #[tokio::test]
    async fn test_large_stage_completes_without_reading_events() {
        let deployer = Arc::new(MemoryDeployer::new());
        let stage = (0..60).try_fold(Stage::new("Prod"), |stage, i| {
            stage.with_application(unit(
                &format!("Unit{i}"),
                Principal::Account(ACCOUNT.to_string()),
            ))
        });
        let orchestrator = PromotionOrchestrator::new(deployer.clone());

        let (mut rx, handle) = orchestrator.execute(plan(vec![stage.unwrap()]), ApprovalSet::new());
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("run stalled on a full event channel")
            .unwrap();

        assert!(result.success());
        assert_eq!(result.stages[0].deployments.len(), 60);
        assert_eq!(deployer.history().await.len(), 60);

        let mut events = 0;
        while rx.try_recv().is_ok() {
            events += 1;
        }
        // evaluating, gate, 60 x (deploying, deployed), stage deployed, completed
        assert_eq!(events, 124);
    }

    #[tokio::test]
    async fn test_stage_without_gate_passes() {
        let deployer = Arc::new(MemoryDeployer::new());
        // Even a broad grant goes through when nothing gates the stage.
        let stage = Stage::new("Dev")
            .with_application(unit("A", Principal::Any))
            .unwrap();

        let (result, events) = run(deployer, plan(vec![stage]), ApprovalSet::new()).await;

        assert_eq!(result.state_of("Dev"), Some(&StageState::Deployed));
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::GateEvaluated { outcome: GateOutcome::Pass, .. }
        )));
    }

    #[tokio::test]
    async fn test_broad_grant_blocks_preprod_and_prod_never_evaluated() {
        let deployer = Arc::new(MemoryDeployer::new());

        let (result, events) = run(
            deployer.clone(),
            security_plan(Principal::Any),
            ApprovalSet::new(),
        )
        .await;

        assert_eq!(
            result.outcome,
            RunOutcome::Blocked {
                stage: "PreProd".to_string()
            }
        );
        assert!(matches!(
            result.state_of("PreProd"),
            Some(StageState::Blocked {
                reason: BlockReason::Gate {
                    outcome: GateOutcome::NeedsApproval { .. }
                }
            })
        ));
        assert_eq!(result.state_of("Prod"), Some(&StageState::Pending));
        assert_eq!(evaluated(&events), vec!["PreProd"]);
        assert!(deployer.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_scoped_grant_promotes_both_stages() {
        let deployer = Arc::new(MemoryDeployer::new());

        let (result, events) = run(
            deployer.clone(),
            security_plan(Principal::Account(ACCOUNT.to_string())),
            ApprovalSet::new(),
        )
        .await;

        assert!(result.success());
        assert_eq!(result.state_of("PreProd"), Some(&StageState::Deployed));
        assert_eq!(result.state_of("Prod"), Some(&StageState::Deployed));
        assert_eq!(evaluated(&events), vec!["PreProd", "Prod"]);

        let units: Vec<_> = deployer
            .history()
            .await
            .into_iter()
            .map(|r| r.unit)
            .collect();
        assert_eq!(units, vec!["A", "B"]);
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::PipelineCompleted {
                outcome: RunOutcome::Succeeded
            })
        ));
    }

    #[tokio::test]
    async fn test_last_attached_gate_governs() {
        let deployer = Arc::new(MemoryDeployer::new());

        let mut relaxed = Stage::new("PreProd")
            .with_application(unit("A", Principal::Any))
            .unwrap();
        relaxed.set_gate(GatePolicy::security_diff());
        relaxed.set_gate(GatePolicy::None);
        let (result, _) = run(deployer.clone(), plan(vec![relaxed]), ApprovalSet::new()).await;
        assert!(result.success());

        let mut strict = Stage::new("PreProd")
            .with_application(unit("A2", Principal::Any))
            .unwrap();
        strict.set_gate(GatePolicy::None);
        strict.set_gate(GatePolicy::security_diff());
        let (result, _) = run(deployer, plan(vec![strict]), ApprovalSet::new()).await;
        assert!(result.state_of("PreProd").unwrap().is_blocked());
    }

    #[tokio::test]
    async fn test_resume_after_approval() {
        let deployer = Arc::new(MemoryDeployer::new());
        let orchestrator = PromotionOrchestrator::new(deployer.clone());
        let plan = security_plan(Principal::Any);

        let (_rx, handle) = orchestrator.execute(plan.clone(), ApprovalSet::new());
        let blocked = handle.await.unwrap();
        assert!(!blocked.success());

        let mut approvals = ApprovalSet::new();
        let digest = plan.stage("PreProd").unwrap().digest.to_string();
        approvals.approve("PreProd", digest, Some("security-team".to_string()));

        let run_id = blocked.run_id;
        let (_rx, handle) = orchestrator.resume(plan, blocked, approvals);
        let resumed = handle.await.unwrap();

        assert!(resumed.success());
        assert_eq!(resumed.run_id, run_id);
        assert_eq!(deployer.history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_resume_skips_deployed_stages() {
        let deployer = Arc::new(MemoryDeployer::new());
        deployer.fail_unit("B").await;
        let orchestrator = PromotionOrchestrator::new(deployer.clone());
        let plan = plan(vec![plain_stage("Beta", "A"), plain_stage("Prod", "B")]);

        let (_rx, handle) = orchestrator.execute(plan.clone(), ApprovalSet::new());
        let first = handle.await.unwrap();
        assert!(matches!(
            first.state_of("Prod"),
            Some(StageState::Blocked {
                reason: BlockReason::DeployFailed { .. }
            })
        ));

        deployer.heal("B").await;
        let (mut rx, handle) = orchestrator.resume(plan, first, ApprovalSet::new());
        let second = handle.await.unwrap();
        assert!(second.success());

        let mut evaluated_stages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            evaluated_stages.push(event);
        }
        assert_eq!(evaluated(&evaluated_stages), vec!["Prod"]);
        // A deployed once, B once after healing.
        assert_eq!(deployer.history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_deploy_failure_blocks_without_partial_promotion() {
        let deployer = Arc::new(MemoryDeployer::new());
        deployer.fail_unit("A2").await;

        let preprod = Stage::new("PreProd")
            .with_application(unit("A1", Principal::Account(ACCOUNT.to_string())))
            .and_then(|s| s.with_application(unit("A2", Principal::Account(ACCOUNT.to_string()))))
            .unwrap();
        let (result, events) = run(
            deployer.clone(),
            plan(vec![preprod, plain_stage("Prod", "B")]),
            ApprovalSet::new(),
        )
        .await;

        match result.state_of("PreProd") {
            Some(StageState::Blocked {
                reason: BlockReason::DeployFailed { unit, .. },
            }) => assert_eq!(unit, "A2"),
            other => panic!("unexpected state: {other:?}"),
        }
        assert_eq!(result.state_of("Prod"), Some(&StageState::Pending));
        assert_eq!(evaluated(&events), vec!["PreProd"]);
        assert!(!events
            .iter()
            .any(|e| matches!(e, PipelineEvent::StageDeployed { .. })));
    }

    #[tokio::test]
    async fn test_fail_closed_gate_ignores_approval() {
        let deployer = Arc::new(MemoryDeployer::new());
        let stage = Stage::new("PreProd")
            .with_gate(GatePolicy::SecurityDiff {
                rule: BroadeningRule::default(),
                on_broadening: OnBroadening::Fail,
                notify: Vec::new(),
            })
            .with_application(unit("A", Principal::Any))
            .unwrap();
        let plan = plan(vec![stage]);

        let mut approvals = ApprovalSet::new();
        approvals.approve("PreProd", plan.stage("PreProd").unwrap().digest, None);
        let (result, _) = run(deployer, plan, approvals).await;

        assert!(matches!(
            result.state_of("PreProd"),
            Some(StageState::Blocked {
                reason: BlockReason::Gate {
                    outcome: GateOutcome::Fail { .. }
                }
            })
        ));
    }

    #[tokio::test]
    async fn test_previously_deployed_grant_does_not_block() {
        let deployer = Arc::new(MemoryDeployer::new());
        let broad = unit("A", Principal::Any);
        deployer.seed("PreProd", UnitSnapshot::of(&broad)).await;

        let (result, _) = run(deployer, security_plan(Principal::Any), ApprovalSet::new()).await;
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_scripts_run_after_stacks() {
        let deployer = Arc::new(MemoryDeployer::new());
        let stage = Stage::new("Prod")
            .with_application(ApplicationUnit::script("Smoke", env(), ["curl -f localhost"]))
            .and_then(|s| s.with_application(unit("Api", Principal::Account(ACCOUNT.to_string()))))
            .unwrap();

        let (result, _) = run(deployer.clone(), plan(vec![stage]), ApprovalSet::new()).await;

        assert!(result.success());
        let order: Vec<_> = deployer
            .history()
            .await
            .into_iter()
            .map(|r| r.unit)
            .collect();
        assert_eq!(order, vec!["Api", "Smoke"]);
        assert_eq!(result.stages[0].deployments.len(), 2);
    }

    #[derive(Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<GateNotice>>,
    }

    #[async_trait::async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notice: GateNotice) -> stagegate_core::Result<()> {
            self.notices.lock().await.push(notice);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_blocked_gate_notifies_subscribers() {
        let deployer = Arc::new(MemoryDeployer::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator =
            PromotionOrchestrator::new(deployer).with_notifier(notifier.clone());

        let stage = Stage::new("PreProd")
            .with_gate(GatePolicy::SecurityDiff {
                rule: BroadeningRule::default(),
                on_broadening: OnBroadening::RequireApproval,
                notify: vec!["security@example.com".to_string()],
            })
            .with_application(unit("A", Principal::Any))
            .unwrap();

        let (_rx, handle) = orchestrator.execute(plan(vec![stage]), ApprovalSet::new());
        handle.await.unwrap();

        let notices = notifier.notices.lock().await;
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].subscribers, vec!["security@example.com"]);
        assert_eq!(notices[0].outcome.findings().len(), 1);
    }
}
