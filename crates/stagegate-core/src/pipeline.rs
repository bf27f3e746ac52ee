//! Pipeline definitions and validated plans.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::ConfigurationError;
use crate::source::{BuildStep, SourceSpec};
use crate::stage::{PlanWarning, Stage};
use crate::unit::Environment;
use crate::Result;

/// A promotion pipeline: source, build, then stages in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    /// Where the pipeline itself runs.
    pub env: Environment,
    pub source: SourceSpec,
    pub build: BuildStep,
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(
        name: impl Into<String>,
        env: Environment,
        source: SourceSpec,
        build: BuildStep,
    ) -> Self {
        Self {
            name: name.into(),
            env,
            source,
            build,
            stages: Vec::new(),
        }
    }

    /// Append a stage. Stage order is deployment order.
    pub fn add_stage(&mut self, stage: Stage) -> std::result::Result<(), ConfigurationError> {
        if stage.name.trim().is_empty() {
            return Err(ConfigurationError::EmptyName("stage"));
        }
        if self.stages.iter().any(|s| s.name == stage.name) {
            return Err(ConfigurationError::DuplicateStage(stage.name));
        }
        self.stages.push(stage);
        Ok(())
    }

    pub fn with_stage(mut self, stage: Stage) -> std::result::Result<Self, ConfigurationError> {
        self.add_stage(stage)?;
        Ok(self)
    }

    /// Validate the whole definition and assemble a plan.
    pub fn into_plan(self) -> Result<Plan> {
        validate(&self)?;

        let digests = self
            .stages
            .iter()
            .map(Stage::digest)
            .collect::<Result<Vec<_>>>()?;
        let warnings = self
            .stages
            .iter()
            .flat_map(|s| s.warnings().iter().cloned())
            .collect();

        Ok(Plan {
            pipeline: self,
            digests,
            warnings,
        })
    }
}

/// Assemble and validate a plan in one call.
pub fn define_pipeline(
    name: impl Into<String>,
    env: Environment,
    source: SourceSpec,
    build: BuildStep,
    stages: Vec<Stage>,
) -> Result<Plan> {
    let mut pipeline = Pipeline::new(name, env, source, build);
    for stage in stages {
        pipeline.add_stage(stage)?;
    }
    pipeline.into_plan()
}

fn require(value: &str, field: &str) -> std::result::Result<(), ConfigurationError> {
    if value.trim().is_empty() {
        Err(ConfigurationError::MissingField(field.to_string()))
    } else {
        Ok(())
    }
}

fn validate(pipeline: &Pipeline) -> std::result::Result<(), ConfigurationError> {
    if pipeline.name.trim().is_empty() {
        return Err(ConfigurationError::EmptyName("pipeline"));
    }
    require(&pipeline.source.owner, "source owner")?;
    require(&pipeline.source.repo, "source repo")?;
    require(&pipeline.source.branch, "source branch")?;
    require(&pipeline.source.token.name, "source token")?;
    require(&pipeline.build.synth_command, "build synth command")?;

    if pipeline.stages.is_empty() {
        return Err(ConfigurationError::NoStages(pipeline.name.clone()));
    }

    let mut seen = HashSet::new();
    for stage in &pipeline.stages {
        if stage.name.trim().is_empty() {
            return Err(ConfigurationError::EmptyName("stage"));
        }
        if !seen.insert(stage.name.as_str()) {
            return Err(ConfigurationError::DuplicateStage(stage.name.clone()));
        }
        if stage.units().is_empty() {
            return Err(ConfigurationError::EmptyStage(stage.name.clone()));
        }

        // Stages can arrive deserialized; re-run the per-unit checks.
        let mut check = Stage::new(stage.name.clone());
        for unit in stage.units() {
            require(&unit.env.account, &format!("account for unit '{}'", unit.name))?;
            require(&unit.env.region, &format!("region for unit '{}'", unit.name))?;
            check.add_application(unit.clone())?;
        }
    }

    Ok(())
}

/// A validated pipeline, ready to hand to an orchestrator.
#[derive(Debug, Clone)]
pub struct Plan {
    pipeline: Pipeline,
    digests: Vec<String>,
    warnings: Vec<PlanWarning>,
}

/// A stage of a plan together with its position and content digest.
#[derive(Debug, Clone, Copy)]
pub struct PlannedStage<'a> {
    pub index: usize,
    pub stage: &'a Stage,
    pub digest: &'a str,
}

impl Plan {
    pub fn name(&self) -> &str {
        &self.pipeline.name
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Stages in deployment order.
    pub fn stages(&self) -> impl Iterator<Item = PlannedStage<'_>> {
        self.pipeline
            .stages
            .iter()
            .zip(&self.digests)
            .enumerate()
            .map(|(index, (stage, digest))| PlannedStage {
                index,
                stage,
                digest,
            })
    }

    pub fn stage(&self, name: &str) -> Option<PlannedStage<'_>> {
        self.stages().find(|s| s.stage.name == name)
    }

    pub fn warnings(&self) -> &[PlanWarning] {
        &self.warnings
    }

    /// The plan document consumed by an external orchestrator.
    pub fn to_json(&self) -> Result<String> {
        #[derive(Serialize)]
        struct StageDocument<'a> {
            name: &'a str,
            digest: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            gate: Option<&'a crate::gate::GatePolicy>,
            units: &'a [crate::unit::ApplicationUnit],
        }

        #[derive(Serialize)]
        struct PlanDocument<'a> {
            name: &'a str,
            env: &'a Environment,
            source: &'a SourceSpec,
            build: &'a BuildStep,
            stages: Vec<StageDocument<'a>>,
            warnings: &'a [PlanWarning],
        }

        let doc = PlanDocument {
            name: &self.pipeline.name,
            env: &self.pipeline.env,
            source: &self.pipeline.source,
            build: &self.pipeline.build,
            stages: self
                .stages()
                .map(|s| StageDocument {
                    name: &s.stage.name,
                    digest: s.digest,
                    gate: s.stage.gate(),
                    units: s.stage.units(),
                })
                .collect(),
            warnings: &self.warnings,
        };

        Ok(serde_json::to_string_pretty(&doc)?)
    }
}
