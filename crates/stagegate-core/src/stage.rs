//! Stages: one promotion step holding an ordered set of application units.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::ConfigurationError;
use crate::gate::GatePolicy;
use crate::unit::ApplicationUnit;
use crate::Result;

/// An authoring problem that does not stop plan assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PlanWarning {
    /// A second gate was attached to a stage and replaced the first.
    GateReplaced {
        stage: String,
        previous: String,
        current: String,
    },
}

impl std::fmt::Display for PlanWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanWarning::GateReplaced {
                stage,
                previous,
                current,
            } => write!(
                f,
                "stage '{}': gate '{}' replaced by '{}'",
                stage, previous, current
            ),
        }
    }
}

/// A stage in a promotion pipeline.
///
/// All units of a stage sit behind the same gate: none of them advances past
/// the stage boundary on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    units: Vec<ApplicationUnit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gate: Option<GatePolicy>,
    #[serde(skip)]
    warnings: Vec<PlanWarning>,
}

/// The part of a stage that approvals are bound to.
#[derive(Serialize)]
struct StageContent<'a> {
    name: &'a str,
    units: &'a [ApplicationUnit],
    gate: Option<&'a GatePolicy>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            units: Vec::new(),
            gate: None,
            warnings: Vec::new(),
        }
    }

    /// Append a unit.
    ///
    /// Fails if the name is empty, already used in this stage, or if the unit
    /// declares a resource another unit of this stage already declares in the
    /// same account and region. Script units may not declare resources.
    pub fn add_application(
        &mut self,
        unit: ApplicationUnit,
    ) -> std::result::Result<(), ConfigurationError> {
        if unit.name.trim().is_empty() {
            return Err(ConfigurationError::EmptyName("application unit"));
        }
        if self.units.iter().any(|u| u.name == unit.name) {
            return Err(ConfigurationError::DuplicateUnit {
                stage: self.name.clone(),
                unit: unit.name,
            });
        }
        if unit.is_script() && !unit.resources.is_empty() {
            return Err(ConfigurationError::ScriptWithResources {
                stage: self.name.clone(),
                unit: unit.name,
            });
        }

        for (i, resource) in unit.resources.iter().enumerate() {
            let declared_earlier = self
                .units
                .iter()
                .filter(|u| u.env == unit.env)
                .find(|u| u.resources.iter().any(|r| r.id == resource.id))
                .map(|u| u.name.clone())
                .or_else(|| {
                    unit.resources[..i]
                        .iter()
                        .any(|r| r.id == resource.id)
                        .then(|| unit.name.clone())
                });

            if let Some(first) = declared_earlier {
                return Err(ConfigurationError::OverlappingResource {
                    stage: self.name.clone(),
                    resource: resource.id.clone(),
                    account: unit.env.account.clone(),
                    region: unit.env.region.clone(),
                    first,
                    second: unit.name.clone(),
                });
            }
        }

        self.units.push(unit);
        Ok(())
    }

    /// Builder form of [`Stage::add_application`].
    pub fn with_application(
        mut self,
        unit: ApplicationUnit,
    ) -> std::result::Result<Self, ConfigurationError> {
        self.add_application(unit)?;
        Ok(self)
    }

    /// Attach the stage gate, returning the one it replaced.
    ///
    /// Only one gate governs a stage. Replacing an existing gate is almost
    /// always an authoring mistake, so it is logged and recorded as a
    /// [`PlanWarning`].
    pub fn set_gate(&mut self, policy: GatePolicy) -> Option<GatePolicy> {
        let previous = self.gate.replace(policy);
        if let (Some(previous), Some(current)) = (&previous, &self.gate) {
            warn!(
                stage = %self.name,
                previous = previous.kind(),
                current = current.kind(),
                "Stage gate replaced"
            );
            self.warnings.push(PlanWarning::GateReplaced {
                stage: self.name.clone(),
                previous: previous.kind().to_string(),
                current: current.kind().to_string(),
            });
        }
        previous
    }

    /// Builder form of [`Stage::set_gate`].
    pub fn with_gate(mut self, policy: GatePolicy) -> Self {
        self.set_gate(policy);
        self
    }

    /// The gate governing this stage, if any. No gate behaves as
    /// [`GatePolicy::None`].
    pub fn gate(&self) -> Option<&GatePolicy> {
        self.gate.as_ref()
    }

    pub fn units(&self) -> &[ApplicationUnit] {
        &self.units
    }

    pub fn warnings(&self) -> &[PlanWarning] {
        &self.warnings
    }

    /// Hex SHA-256 of the stage's name, units and gate.
    pub fn digest(&self) -> Result<String> {
        let content = StageContent {
            name: &self.name,
            units: &self.units,
            gate: self.gate.as_ref(),
        };
        let bytes = serde_json::to_vec(&content)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}
