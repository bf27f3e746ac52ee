//! Gate policies that decide whether a stage may be promoted.
//!
//! A gate is evaluated against a [`GateContext`]: the stage being promoted,
//! its content digest, the last deployed snapshot of each of its units, and
//! the approvals recorded so far. Evaluation is pure; the orchestrator owns
//! the resulting state transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::deployer::UnitSnapshot;
use crate::stage::Stage;
use crate::unit::{ApplicationUnit, Grant, Principal};

/// Decides which new grants count as permission broadening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadeningRule {
    /// Grants to `*` are broad.
    pub wildcard_principal: bool,
    /// `*` or `service:*` actions are broad.
    pub wildcard_actions: bool,
    /// Account principals other than the unit's own account are broad,
    /// unless listed in `trusted_accounts`.
    pub cross_account: bool,
    pub trusted_accounts: Vec<String>,
}

impl Default for BroadeningRule {
    fn default() -> Self {
        Self {
            wildcard_principal: true,
            wildcard_actions: true,
            cross_account: false,
            trusted_accounts: Vec::new(),
        }
    }
}

impl BroadeningRule {
    /// Classify a grant declared by `unit`. `None` means the grant is scoped.
    pub fn classify(&self, unit: &ApplicationUnit, grant: &Grant) -> Option<BroadeningKind> {
        if self.wildcard_principal && grant.principal.is_wildcard() {
            return Some(BroadeningKind::WildcardPrincipal);
        }
        if self.cross_account {
            if let Principal::Account(account) = &grant.principal {
                if *account != unit.env.account && !self.trusted_accounts.contains(account) {
                    return Some(BroadeningKind::CrossAccount(account.clone()));
                }
            }
        }
        if self.wildcard_actions && grant.has_wildcard_action() {
            return Some(BroadeningKind::WildcardAction);
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadeningKind {
    WildcardPrincipal,
    WildcardAction,
    CrossAccount(String),
}

impl std::fmt::Display for BroadeningKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BroadeningKind::WildcardPrincipal => write!(f, "grants access to any principal"),
            BroadeningKind::WildcardAction => write!(f, "grants wildcard actions"),
            BroadeningKind::CrossAccount(account) => {
                write!(f, "grants access to untrusted account {}", account)
            }
        }
    }
}

/// A broadening grant found by the security diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFinding {
    pub unit: String,
    pub resource: String,
    pub grant: Grant,
    pub kind: BroadeningKind,
}

impl std::fmt::Display for SecurityFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} {} ({} -> {})",
            self.unit,
            self.resource,
            self.kind,
            self.grant.principal,
            self.grant.actions.join(",")
        )
    }
}

/// Grants the stage would add, compared with what is deployed, that `rule`
/// classifies as broad. Units without a snapshot have never been deployed, so
/// all of their grants are new.
pub fn security_diff(
    stage: &Stage,
    snapshots: &HashMap<String, UnitSnapshot>,
    rule: &BroadeningRule,
) -> Vec<SecurityFinding> {
    let mut findings = Vec::new();

    for unit in stage.units() {
        let deployed: HashSet<(&str, &Grant)> = snapshots
            .get(&unit.name)
            .map(|s| s.grants.iter().map(|g| (g.resource.as_str(), &g.grant)).collect())
            .unwrap_or_default();

        for (resource, grant) in unit.grants() {
            if deployed.contains(&(resource, grant)) {
                continue;
            }
            if let Some(kind) = rule.classify(unit, grant) {
                findings.push(SecurityFinding {
                    unit: unit.name.clone(),
                    resource: resource.to_string(),
                    grant: grant.clone(),
                    kind,
                });
            }
        }
    }

    findings
}

/// What a security-diff gate does when it finds broadening.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnBroadening {
    /// Hold the stage until an operator approves this exact stage content.
    #[default]
    RequireApproval,
    /// Fail closed. Only changing the stage unblocks it.
    Fail,
}

impl std::str::FromStr for OnBroadening {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" | "require-approval" => Ok(OnBroadening::RequireApproval),
            "fail" => Ok(OnBroadening::Fail),
            _ => Err(format!("Unknown broadening action: {}", s)),
        }
    }
}

/// A stage gate. Selected by configuration, at most one per stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GatePolicy {
    /// Always passes.
    #[default]
    None,
    /// Waits for an operator approval.
    ManualApproval {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
    /// Blocks when the stage broadens permissions.
    SecurityDiff {
        #[serde(default)]
        rule: BroadeningRule,
        #[serde(default)]
        on_broadening: OnBroadening,
        /// Subscribers informed when the gate blocks.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        notify: Vec<String>,
    },
}

impl GatePolicy {
    pub fn security_diff() -> Self {
        GatePolicy::SecurityDiff {
            rule: BroadeningRule::default(),
            on_broadening: OnBroadening::default(),
            notify: Vec::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatePolicy::None => "none",
            GatePolicy::ManualApproval { .. } => "manual",
            GatePolicy::SecurityDiff { .. } => "security-diff",
        }
    }

    pub fn notify_targets(&self) -> &[String] {
        match self {
            GatePolicy::SecurityDiff { notify, .. } => notify,
            _ => &[],
        }
    }

    pub fn evaluate(&self, ctx: &GateContext<'_>) -> GateOutcome {
        match self {
            GatePolicy::None => GateOutcome::Pass,
            GatePolicy::ManualApproval { comment } => {
                if ctx.is_approved() {
                    GateOutcome::Pass
                } else {
                    GateOutcome::NeedsApproval {
                        reason: comment
                            .clone()
                            .unwrap_or_else(|| "manual approval required".to_string()),
                        findings: Vec::new(),
                    }
                }
            }
            GatePolicy::SecurityDiff {
                rule,
                on_broadening,
                ..
            } => {
                let findings = security_diff(ctx.stage, ctx.snapshots, rule);
                if findings.is_empty() {
                    return GateOutcome::Pass;
                }
                let reason = format!(
                    "{} broadening permission change(s) in stage '{}'",
                    findings.len(),
                    ctx.stage.name
                );
                match on_broadening {
                    OnBroadening::Fail => GateOutcome::Fail { reason, findings },
                    OnBroadening::RequireApproval if ctx.is_approved() => GateOutcome::Pass,
                    OnBroadening::RequireApproval => {
                        GateOutcome::NeedsApproval { reason, findings }
                    }
                }
            }
        }
    }
}

/// Result of evaluating a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateOutcome {
    Pass,
    Fail {
        reason: String,
        findings: Vec<SecurityFinding>,
    },
    NeedsApproval {
        reason: String,
        findings: Vec<SecurityFinding>,
    },
}

impl GateOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, GateOutcome::Pass)
    }

    pub fn findings(&self) -> &[SecurityFinding] {
        match self {
            GateOutcome::Pass => &[],
            GateOutcome::Fail { findings, .. } | GateOutcome::NeedsApproval { findings, .. } => {
                findings
            }
        }
    }
}

impl std::fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateOutcome::Pass => write!(f, "passed"),
            GateOutcome::Fail { reason, .. } => write!(f, "failed: {}", reason),
            GateOutcome::NeedsApproval { reason, .. } => {
                write!(f, "needs approval: {}", reason)
            }
        }
    }
}

/// An operator approval, bound to the stage content it was given for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub stage: String,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    pub approved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalSet {
    approvals: Vec<Approval>,
}

impl ApprovalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an approval. An earlier approval for the same stage is replaced.
    pub fn approve(
        &mut self,
        stage: impl Into<String>,
        digest: impl Into<String>,
        approved_by: Option<String>,
    ) {
        let stage = stage.into();
        self.approvals.retain(|a| a.stage != stage);
        self.approvals.push(Approval {
            stage,
            digest: digest.into(),
            approved_by,
            approved_at: Utc::now(),
        });
    }

    pub fn is_approved(&self, stage: &str, digest: &str) -> bool {
        self.approvals
            .iter()
            .any(|a| a.stage == stage && a.digest == digest)
    }

    pub fn get(&self, stage: &str) -> Option<&Approval> {
        self.approvals.iter().find(|a| a.stage == stage)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Approval> {
        self.approvals.iter()
    }
}

/// Inputs to a gate evaluation.
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    pub stage: &'a Stage,
    pub digest: &'a str,
    /// Last deployed snapshot per unit name.
    pub snapshots: &'a HashMap<String, UnitSnapshot>,
    pub approvals: &'a ApprovalSet,
}

impl GateContext<'_> {
    fn is_approved(&self) -> bool {
        self.approvals.is_approved(&self.stage.name, self.digest)
    }
}
