pub mod args;
pub mod engine;
pub mod idle;
pub mod pipeline;
pub mod recipe;
pub mod source;
pub mod stages;
pub mod verify;

pub use crate::domain::model::{ImageMetadata, ProjectInfo};
pub use crate::domain::ports::{CommandRunner, Storage};
pub use crate::utils::error::Result;
pub use engine::BuildEngine;
pub use recipe::{Recipe, SecretMode};
pub use stages::BuildPlan;
