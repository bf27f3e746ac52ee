//! In-memory deployer.

use async_trait::async_trait;
use stagegate_core::deployer::*;
use stagegate_core::unit::ApplicationUnit;
use stagegate_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::info;

/// A deploy recorded by [`MemoryDeployer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRecord {
    pub stage: String,
    pub unit: String,
    pub stage_digest: String,
}

/// Keeps deployed snapshots in memory. Units can be told to fail.
#[derive(Default)]
pub struct MemoryDeployer {
    snapshots: RwLock<HashMap<(String, String), UnitSnapshot>>,
    history: RwLock<Vec<DeploymentRecord>>,
    failing: RwLock<HashSet<String>>,
}

impl MemoryDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every deploy of `unit` fail until [`MemoryDeployer::heal`] is called.
    pub async fn fail_unit(&self, unit: impl Into<String>) {
        self.failing.write().await.insert(unit.into());
    }

    pub async fn heal(&self, unit: &str) {
        self.failing.write().await.remove(unit);
    }

    /// Seed a previously deployed snapshot.
    pub async fn seed(&self, stage: impl Into<String>, snapshot: UnitSnapshot) {
        self.snapshots
            .write()
            .await
            .insert((stage.into(), snapshot.unit.clone()), snapshot);
    }

    /// Deploys in completion order.
    pub async fn history(&self) -> Vec<DeploymentRecord> {
        self.history.read().await.clone()
    }
}

#[async_trait]
impl Deployer for MemoryDeployer {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn snapshot(&self, stage: &str, unit: &ApplicationUnit) -> Result<Option<UnitSnapshot>> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(&(stage.to_string(), unit.name.clone()))
            .cloned())
    }

    async fn deploy(&self, spec: DeploymentSpec) -> Result<DeploymentHandle> {
        if self.failing.read().await.contains(&spec.unit.name) {
            return Err(Error::ExternalDeployFailure {
                unit: spec.unit.name.clone(),
                message: "injected failure".to_string(),
            });
        }

        info!(stage = %spec.stage, unit = %spec.unit.name, "Recording deployment");

        self.snapshots.write().await.insert(
            (spec.stage.clone(), spec.unit.name.clone()),
            UnitSnapshot::of(&spec.unit),
        );
        self.history.write().await.push(DeploymentRecord {
            stage: spec.stage.clone(),
            unit: spec.unit.name.clone(),
            stage_digest: spec.stage_digest.clone(),
        });

        Ok(DeploymentHandle {
            id: spec.id,
            unit: spec.unit.name,
            deployer_name: self.name().to_string(),
            deployer_ref: format!("memory://{}/{}", spec.stage, spec.id.short()),
        })
    }
}
