//! JSON files kept next to the deployed snapshots in the state directory.

use anyhow::{Context, Result};
use stagegate_core::ApprovalSet;
use stagegate_scheduler::PromotionResult;
use std::path::{Path, PathBuf};

const APPROVALS_FILE: &str = "approvals.json";
const LAST_RUN_FILE: &str = "last-run.json";

pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn load_approvals(&self) -> Result<ApprovalSet> {
        Ok(self.read(APPROVALS_FILE)?.unwrap_or_default())
    }

    pub fn save_approvals(&self, approvals: &ApprovalSet) -> Result<()> {
        self.write(APPROVALS_FILE, approvals)
    }

    /// The last recorded run of `pipeline`, if it did not succeed.
    pub fn blocked_run(&self, pipeline: &str) -> Result<Option<PromotionResult>> {
        let last: Option<PromotionResult> = self.read(LAST_RUN_FILE)?;
        Ok(last.filter(|run| run.pipeline == pipeline && !run.success()))
    }

    pub fn save_run(&self, result: &PromotionResult) -> Result<()> {
        self.write(LAST_RUN_FILE, result)
    }

    fn path(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    fn read<T: serde::de::DeserializeOwned>(&self, file: &str) -> Result<Option<T>> {
        let path = self.path(file);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    fn write<T: serde::Serialize>(&self, file: &str, value: &T) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create {}", self.root.display()))?;
        let path = self.path(file);
        std::fs::write(&path, serde_json::to_vec_pretty(value)?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_approvals_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path().join("state"));
        assert_eq!(state.load_approvals().unwrap().iter().count(), 0);
        assert!(state.blocked_run("TestPipeline").unwrap().is_none());
    }

    #[test]
    fn test_approvals_persist() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path());

        let mut approvals = ApprovalSet::new();
        approvals.approve("PreProd", "abc123", Some("ops".to_string()));
        state.save_approvals(&approvals).unwrap();

        let loaded = StateDir::new(state.root()).load_approvals().unwrap();
        assert!(loaded.is_approved("PreProd", "abc123"));
        assert!(!loaded.is_approved("PreProd", "def456"));
    }
}
