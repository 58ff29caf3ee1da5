// Public API
pub mod cli;
pub mod commands;

// Core domain types
pub mod engine;
pub mod installers;
pub mod terraform;
pub mod version;
pub mod workspace;

mod config;
mod error;
mod ui;
mod util;

// Re-export main types
pub use config::Config;
pub use error::{Error, Result};
pub use terraform::Terraform;
pub use workspace::{Plan, Workspace, WorkspaceId, NO_ARGS};
