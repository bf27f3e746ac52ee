//! Source-fetch and build/synthesis step descriptors.
//!
//! Both steps are executed by the external orchestrator; the plan only
//! describes them.

use serde::{Deserialize, Serialize};

use crate::secret::SecretRef;

/// Source code host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceProvider {
    Github,
}

impl std::fmt::Display for SourceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceProvider::Github => write!(f, "github"),
        }
    }
}

impl std::str::FromStr for SourceProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "github" => Ok(SourceProvider::Github),
            _ => Err(format!("Unknown source provider: {}", s)),
        }
    }
}

/// Where the pipeline fetches its source from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub provider: SourceProvider,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    /// Credential used to fetch the source.
    pub token: SecretRef,
}

impl SourceSpec {
    pub fn github(
        owner: impl Into<String>,
        repo: impl Into<String>,
        branch: impl Into<String>,
        token: SecretRef,
    ) -> Self {
        Self {
            provider: SourceProvider::Github,
            owner: owner.into(),
            repo: repo.into(),
            branch: branch.into(),
            token,
        }
    }

    /// `owner/repo@branch`
    pub fn locator(&self) -> String {
        format!("{}/{}@{}", self.owner, self.repo, self.branch)
    }
}

/// The build/synthesis step run against fetched source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStep {
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    /// Command producing the deployable artifact.
    pub synth_command: String,
    /// Name of the produced artifact.
    pub artifact: String,
}

pub const DEFAULT_ARTIFACT: &str = "CloudAsm";
pub const DEFAULT_SYNTH_COMMAND: &str = "npx cdk synth";

impl BuildStep {
    pub fn new(synth_command: impl Into<String>) -> Self {
        Self {
            install_command: None,
            build_command: None,
            synth_command: synth_command.into(),
            artifact: DEFAULT_ARTIFACT.to_string(),
        }
    }

    /// Yarn project: frozen-lockfile install, optional build, then synth.
    pub fn yarn(build_command: Option<String>) -> Self {
        Self {
            install_command: Some("yarn install --frozen-lockfile".to_string()),
            build_command,
            synth_command: DEFAULT_SYNTH_COMMAND.to_string(),
            artifact: DEFAULT_ARTIFACT.to_string(),
        }
    }

    /// npm project: `npm ci`, optional build, then synth.
    pub fn npm(build_command: Option<String>) -> Self {
        Self {
            install_command: Some("npm ci".to_string()),
            build_command,
            synth_command: DEFAULT_SYNTH_COMMAND.to_string(),
            artifact: DEFAULT_ARTIFACT.to_string(),
        }
    }

    /// Commands in execution order.
    pub fn commands(&self) -> Vec<&str> {
        self.install_command
            .iter()
            .chain(self.build_command.iter())
            .map(String::as_str)
            .chain(std::iter::once(self.synth_command.as_str()))
            .collect()
    }
}
