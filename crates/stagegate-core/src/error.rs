//! Error types for stagegate.

use thiserror::Error;

/// Problems found while assembling a plan. Always raised at definition time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("{0} name must not be empty")]
    EmptyName(&'static str),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("duplicate stage: {0}")]
    DuplicateStage(String),

    #[error("duplicate application unit '{unit}' in stage '{stage}'")]
    DuplicateUnit { stage: String, unit: String },

    #[error(
        "resource '{resource}' in {account}/{region} is declared by both '{first}' and '{second}' in stage '{stage}'"
    )]
    OverlappingResource {
        stage: String,
        resource: String,
        account: String,
        region: String,
        first: String,
        second: String,
    },

    #[error("script unit '{unit}' in stage '{stage}' must not declare resources")]
    ScriptWithResources { stage: String, unit: String },

    #[error("pipeline '{0}' has no stages")]
    NoStages(String),

    #[error("stage '{0}' has no application units")]
    EmptyStage(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("deploy of '{unit}' failed: {message}")]
    ExternalDeployFailure { unit: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
