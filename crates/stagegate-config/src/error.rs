//! Configuration parsing errors.

use stagegate_core::ConfigurationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("stage '{0}' declares more than one gate")]
    ConflictingGate(String),

    #[error(transparent)]
    Plan(#[from] ConfigurationError),

    #[error("plan assembly failed: {0}")]
    Core(stagegate_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<stagegate_core::Error> for ConfigError {
    fn from(err: stagegate_core::Error) -> Self {
        match err {
            stagegate_core::Error::Configuration(e) => ConfigError::Plan(e),
            other => ConfigError::Core(other),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
