pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use crate::config::CliConfig;
pub use crate::config::RecipeConfig;

pub use crate::adapters::{DockerCli, LocalStorage, ProcessRunner};
pub use crate::core::{BuildEngine, BuildPlan, Recipe, SecretMode};
pub use crate::utils::error::{BuildError, Result};
