//! State-directory deployer.
//!
//! Records each deployed unit as a JSON snapshot under
//! `<state_dir>/deployments/<stage>/<unit>.json`, with both names escaped into
//! single path components. Script units can optionally
//! be executed with `sh -c` from a working directory.

use async_trait::async_trait;
use stagegate_core::deployer::*;
use stagegate_core::unit::{ApplicationUnit, UnitKind};
use stagegate_core::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};

pub struct LocalDeployer {
    state_dir: PathBuf,
    /// Where script units run. `None` records scripts without running them.
    script_dir: Option<PathBuf>,
}

impl LocalDeployer {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            script_dir: None,
        }
    }

    /// Run script units from `working_dir`.
    pub fn with_scripts(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.script_dir = Some(working_dir.into());
        self
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn snapshot_path(&self, stage: &str, unit: &str) -> PathBuf {
        self.state_dir
            .join("deployments")
            .join(encode_name(stage))
            .join(format!("{}.json", encode_name(unit)))
    }

    /// Every recorded snapshot as `(stage, snapshot)`, sorted by path.
    pub async fn snapshots(&self) -> Result<Vec<(String, UnitSnapshot)>> {
        let root = self.state_dir.join("deployments");
        if !tokio::fs::try_exists(&root).await? {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        let mut stages = tokio::fs::read_dir(&root).await?;
        while let Some(stage_dir) = stages.next_entry().await? {
            if !stage_dir.file_type().await?.is_dir() {
                continue;
            }
            let dir_name = stage_dir.file_name().to_string_lossy().to_string();
            let Some(stage) = decode_name(&dir_name) else {
                warn!(dir = %dir_name, "Skipping unrecognized stage directory");
                continue;
            };
            let mut units = tokio::fs::read_dir(stage_dir.path()).await?;
            while let Some(entry) = units.next_entry().await? {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == "json") {
                    let content = tokio::fs::read_to_string(&path).await?;
                    let snapshot: UnitSnapshot = serde_json::from_str(&content)?;
                    found.push((path, stage.clone(), snapshot));
                }
            }
        }

        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found.into_iter().map(|(_, stage, s)| (stage, s)).collect())
    }

    async fn run_script(&self, unit: &str, commands: &[String]) -> Result<()> {
        let Some(dir) = &self.script_dir else {
            info!(unit = %unit, "Script execution disabled, recording only");
            return Ok(());
        };

        let script = commands.join(" && ");
        info!(unit = %unit, script = %script, "Running validation script");

        let output = Command::new("/bin/sh")
            .arg("-c")
            .arg(&script)
            .current_dir(dir)
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(unit = %unit, code = ?output.status.code(), "Validation script failed");
            Err(Error::ExternalDeployFailure {
                unit: unit.to_string(),
                message: format!(
                    "script exited with {}: {}",
                    output.status,
                    stderr.trim()
                ),
            })
        }
    }
}

/// Maps a stage or unit name to a single path component.
///
/// ASCII letters, digits and `-` are kept; every other byte becomes `_xx`
/// (lowercase hex), so distinct names never share a component.
fn encode_name(name: &str) -> String {
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("_{:02x}", byte));
        }
    }
    encoded
}

fn decode_name(encoded: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(encoded.len());
    let mut rest = encoded.as_bytes();
    while let Some((&byte, tail)) = rest.split_first() {
        if byte == b'_' {
            let hex = std::str::from_utf8(tail.get(..2)?).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            rest = &tail[2..];
        } else {
            bytes.push(byte);
            rest = tail;
        }
    }
    String::from_utf8(bytes).ok()
}

#[async_trait]
impl Deployer for LocalDeployer {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn snapshot(&self, stage: &str, unit: &ApplicationUnit) -> Result<Option<UnitSnapshot>> {
        let path = self.snapshot_path(stage, &unit.name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn deploy(&self, spec: DeploymentSpec) -> Result<DeploymentHandle> {
        if let UnitKind::Script { commands } = &spec.unit.kind {
            self.run_script(&spec.unit.name, commands).await?;
        }

        let path = self.snapshot_path(&spec.stage, &spec.unit.name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let snapshot = UnitSnapshot::of(&spec.unit);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&snapshot)?).await?;

        info!(
            stage = %spec.stage,
            unit = %spec.unit.name,
            env = %spec.unit.env,
            path = %path.display(),
            "Unit deployed"
        );

        Ok(DeploymentHandle {
            id: spec.id,
            unit: spec.unit.name,
            deployer_name: self.name().to_string(),
            deployer_ref: path.display().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagegate_core::unit::{Environment, Grant, Principal, Resource};
    use stagegate_core::{DeploymentId, RunId};

    fn env() -> Environment {
        Environment::new("045046196850", "us-west-2")
    }

    fn spec(stage: &str, unit: ApplicationUnit) -> DeploymentSpec {
        DeploymentSpec {
            id: DeploymentId::new(),
            run_id: RunId::new(),
            pipeline: "TestPipeline".to_string(),
            stage: stage.to_string(),
            stage_digest: "abc".to_string(),
            unit,
        }
    }

    #[tokio::test]
    async fn test_snapshot_persisted_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let unit = ApplicationUnit::stack("MyStack", env()).with_resource(
            Resource::new("MyBucket", "s3:Bucket")
                .with_grant(Grant::new(Principal::Any, ["s3:GetObject"])),
        );

        let deployer = LocalDeployer::new(dir.path());
        assert!(deployer.snapshot("PreProduction", &unit).await.unwrap().is_none());
        deployer.deploy(spec("PreProduction", unit.clone())).await.unwrap();

        let reopened = LocalDeployer::new(dir.path());
        let snapshot = reopened.snapshot("PreProduction", &unit).await.unwrap().unwrap();
        assert_eq!(snapshot.grants[0].grant.principal, Principal::Any);

        let all = reopened.snapshots().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "PreProduction");
    }

    #[tokio::test]
    async fn test_snapshots_empty_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = LocalDeployer::new(dir.path().join("missing"));
        assert!(deployer.snapshots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_script_is_deploy_failure() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = LocalDeployer::new(dir.path()).with_scripts(dir.path());
        let unit = ApplicationUnit::script("Smoke", env(), ["exit 3"]);

        let err = deployer.deploy(spec("Prod", unit.clone())).await.unwrap_err();
        assert!(matches!(err, Error::ExternalDeployFailure { ref unit, .. } if unit == "Smoke"));
        assert!(deployer.snapshot("Prod", &unit).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_script_recorded_when_execution_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = LocalDeployer::new(dir.path());
        let unit = ApplicationUnit::script("Smoke", env(), ["exit 3"]);
        assert!(deployer.deploy(spec("Prod", unit)).await.is_ok());
    }

    #[test]
    fn test_name_encoding_is_reversible() {
        assert_eq!(encode_name("Pre Prod"), "Pre_20Prod");
        assert_eq!(encode_name("Pre_Prod"), "Pre_5fProd");
        assert_eq!(encode_name("my-stack"), "my-stack");
        for name in ["Pre Prod/1", "a_b", "..", "Étape"] {
            assert_eq!(decode_name(&encode_name(name)).as_deref(), Some(name));
        }
        assert_eq!(decode_name("bad_z"), None);
    }

    #[tokio::test]
    async fn test_similar_stage_names_do_not_share_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let deployer = LocalDeployer::new(dir.path());
        let unit = ApplicationUnit::stack("A", env()).with_resource(
            Resource::new("MyBucket", "s3:Bucket")
                .with_grant(Grant::new(Principal::Any, ["s3:GetObject"])),
        );

        deployer.deploy(spec("Pre Prod", unit.clone())).await.unwrap();

        assert!(deployer.snapshot("Pre_Prod", &unit).await.unwrap().is_none());
        assert!(deployer.snapshot("Pre Prod", &unit).await.unwrap().is_some());

        let all = deployer.snapshots().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "Pre Prod");
    }
}
