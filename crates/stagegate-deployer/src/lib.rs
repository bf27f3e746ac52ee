//! Deployment backends for stagegate.
//!
//! Provides deployer implementations:
//! - Local state directory (CLI runs)
//! - In-memory (tests and dry runs)

pub mod local;
pub mod memory;

pub use local::LocalDeployer;
pub use memory::MemoryDeployer;
pub use stagegate_core::deployer::{DeployedGrant, Deployer, DeploymentHandle, DeploymentSpec, UnitSnapshot};
