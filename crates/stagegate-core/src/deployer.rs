//! Deployer trait and deployment types.
//!
//! A deployer is the external collaborator that actually provisions an
//! application unit. The orchestrator hands it one unit at a time and treats
//! any error as an opaque deploy failure of the whole stage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{DeploymentId, RunId};
use crate::unit::{ApplicationUnit, Environment, Grant};
use crate::Result;

/// Everything a deployer needs to deploy one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub id: DeploymentId,
    pub run_id: RunId,
    pub pipeline: String,
    pub stage: String,
    /// Digest of the stage content being deployed.
    pub stage_digest: String,
    pub unit: ApplicationUnit,
}

/// Handle to a completed deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentHandle {
    pub id: DeploymentId,
    pub unit: String,
    pub deployer_name: String,
    /// Deployer-specific reference (state file, change set, ...).
    pub deployer_ref: String,
}

/// A grant as it was deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedGrant {
    pub resource: String,
    pub grant: Grant,
}

/// The permission surface of a unit as last deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSnapshot {
    pub unit: String,
    pub env: Environment,
    pub grants: Vec<DeployedGrant>,
    pub deployed_at: DateTime<Utc>,
}

impl UnitSnapshot {
    /// Snapshot of a unit's declared grants, taken as it is deployed.
    pub fn of(unit: &ApplicationUnit) -> Self {
        Self {
            unit: unit.name.clone(),
            env: unit.env.clone(),
            grants: unit
                .grants()
                .map(|(resource, grant)| DeployedGrant {
                    resource: resource.to_string(),
                    grant: grant.clone(),
                })
                .collect(),
            deployed_at: Utc::now(),
        }
    }
}

/// Trait for deploy backends.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Name of this deployer.
    fn name(&self) -> &'static str;

    /// Last deployed snapshot of `unit` in `stage`, if it was ever deployed.
    async fn snapshot(&self, stage: &str, unit: &ApplicationUnit) -> Result<Option<UnitSnapshot>>;

    /// Deploy a unit. Returns once the deploy has completed.
    async fn deploy(&self, spec: DeploymentSpec) -> Result<DeploymentHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{Principal, Resource};

    #[test]
    fn test_snapshot_of_unit_collects_all_grants() {
        let unit = ApplicationUnit::stack("MyStack", Environment::new("045046196850", "us-west-2"))
            .with_resource(
                Resource::new("MyBucket", "s3:Bucket")
                    .with_grant(Grant::new(Principal::Any, ["s3:GetObject"]))
                    .with_grant(Grant::new(
                        Principal::Service("lambda.amazonaws.com".to_string()),
                        ["s3:PutObject"],
                    )),
            )
            .with_resource(Resource::new("Logs", "s3:Bucket"));

        let snapshot = UnitSnapshot::of(&unit);
        assert_eq!(snapshot.unit, "MyStack");
        assert_eq!(snapshot.grants.len(), 2);
        assert!(snapshot.grants.iter().all(|g| g.resource == "MyBucket"));
    }
}
