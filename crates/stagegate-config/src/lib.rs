//! KDL configuration parsing for stagegate.
//!
//! This crate handles:
//! - Pipeline definitions (stagegate.kdl)
//! - Variable interpolation in definition values

pub mod error;
pub mod pipeline;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{load_pipeline, parse_pipeline, parse_pipeline_with_context};
pub use variables::{PipelineContext, VariableContext, VariableContextBuilder};
