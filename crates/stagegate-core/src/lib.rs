//! Core domain types and traits for stagegate promotion pipelines.
//!
//! This crate contains:
//! - Application units, resources and permission grants
//! - Stages and their gate policies
//! - Pipeline definitions and validated plans
//! - Source and build step descriptors, secret references
//! - Deployer and notifier traits

pub mod deployer;
pub mod error;
pub mod gate;
pub mod id;
pub mod notify;
pub mod pipeline;
pub mod secret;
pub mod source;
pub mod stage;
pub mod unit;

pub use error::{ConfigurationError, Error, Result};
pub use gate::{ApprovalSet, GateContext, GateOutcome, GatePolicy};
pub use id::{DeploymentId, RunId};
pub use pipeline::{Pipeline, Plan, PlannedStage, define_pipeline};
pub use stage::{PlanWarning, Stage};
pub use unit::{ApplicationUnit, Environment, Grant, Principal, Resource};
