//! Variable interpolation for pipeline definitions.
//!
//! Supports variables like:
//! - `${pipeline.name}` - Pipeline name
//! - `${pipeline.account}` - Account the pipeline runs in
//! - `${pipeline.region}` - Region the pipeline runs in
//! - `${env.VAR_NAME}` - Environment variable
//! - `${name}` - Custom variable
//!
//! Unknown variables are left untouched.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub pipeline: PipelineContext,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Custom variables defined by the caller
    pub custom: HashMap<String, String>,
}

/// The pipeline's own identity and environment.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub name: String,
    pub account: String,
    pub region: String,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context seeded with the current process environment.
    pub fn from_process_env() -> Self {
        let mut ctx = Self::new();
        ctx.env.extend(std::env::vars());
        ctx
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["pipeline", "name"] => Some(self.pipeline.name.clone()),
            ["pipeline", "account"] => Some(self.pipeline.account.clone()),
            ["pipeline", "region"] => Some(self.pipeline.region.clone()),

            ["env", name] => self.env.get(*name).cloned(),

            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    /// Variable references in `input` that this context cannot resolve.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_pipeline(
        mut self,
        name: impl Into<String>,
        account: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        self.ctx.pipeline = PipelineContext {
            name: name.into(),
            account: account.into(),
            region: region.into(),
        };
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.custom.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_variables() {
        let ctx = VariableContextBuilder::new()
            .with_pipeline("TestPipeline", "045046196850", "us-west-2")
            .build();

        let result = ctx.interpolate("${pipeline.name} in ${pipeline.account}/${pipeline.region}");
        assert_eq!(result, "TestPipeline in 045046196850/us-west-2");
    }

    #[test]
    fn test_env_variables() {
        let ctx = VariableContextBuilder::new()
            .with_env("CDK_DEFAULT_ACCOUNT", "111111111111")
            .build();

        assert_eq!(ctx.interpolate("${env.CDK_DEFAULT_ACCOUNT}"), "111111111111");
    }

    #[test]
    fn test_unknown_variable_preserved() {
        let ctx = VariableContext::new();
        let result = ctx.interpolate("Unknown: ${unknown.var}");
        assert_eq!(result, "Unknown: ${unknown.var}");
        assert_eq!(ctx.unresolved("${unknown.var} ${env.NOPE}").len(), 2);
    }

    #[test]
    fn test_custom_variables() {
        let mut ctx = VariableContext::new();
        ctx.set("bucket", "assets");
        assert_eq!(ctx.interpolate("${bucket}-logs"), "assets-logs");
    }

    #[test]
    fn test_interpolate_vec() {
        let ctx = VariableContextBuilder::new()
            .with_custom("suite", "smoke")
            .build();
        let inputs = vec!["npm run ${suite}".to_string(), "echo done".to_string()];
        assert_eq!(
            ctx.interpolate_vec(&inputs),
            vec!["npm run smoke".to_string(), "echo done".to_string()]
        );
    }
}
