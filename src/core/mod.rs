// Domain records
pub mod deployment;
pub mod error;
pub mod events;
pub mod repository;

// Pipeline components
pub mod dispatch;
pub mod git;
pub mod notify;
pub mod pipeline;
pub mod runner;
pub mod store;

// Configuration
pub mod config;
pub mod paths;

// Re-export common types for convenience
pub use deployment::{Deployment, DeploymentStatus};
pub use error::{Error, ErrorCode, Result};
pub use repository::{BranchConfig, Provider, Repository};
