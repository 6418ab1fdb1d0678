use crate::adapters::docker::DockerCli;
use crate::core::recipe::{Recipe, SecretMode};
use crate::domain::model::{ExposedPort, ImageMetadata};
use crate::domain::ports::CommandRunner;
use crate::utils::error::{BuildError, Result};
use crate::utils::redact::Redactor;
use std::collections::BTreeSet;

fn format_ports(ports: &BTreeSet<ExposedPort>) -> String {
    ports.iter().map(ExposedPort::to_string).collect::<Vec<_>>().join(", ")
}

/// Compares inspected image metadata with what the recipe declares.
pub fn check_metadata(recipe: &Recipe, metadata: &ImageMetadata) -> Result<()> {
    let expected_ports = recipe.exposed_ports();
    if metadata.exposed_ports != expected_ports {
        return Err(BuildError::VerificationError {
            message: format!(
                "exposed ports are {{{}}}, expected {{{}}}",
                format_ports(&metadata.exposed_ports),
                format_ports(&expected_ports)
            ),
        });
    }

    let expected_cmd = recipe.command.argv();
    if metadata.cmd != expected_cmd {
        return Err(BuildError::VerificationError {
            message: format!(
                "default command is {:?}, expected {:?}",
                metadata.cmd, expected_cmd
            ),
        });
    }

    if metadata.working_dir != recipe.workdir {
        return Err(BuildError::VerificationError {
            message: format!(
                "working directory is '{}', expected '{}'",
                metadata.working_dir, recipe.workdir
            ),
        });
    }

    Ok(())
}

/// 回傳第一個含有秘密值的位置
pub fn find_leak(redactor: &Redactor, history: &[String], inspect_raw: &str) -> Option<String> {
    if redactor.is_empty() {
        return None;
    }

    if let Some(index) = history.iter().position(|line| redactor.contains_secret(line)) {
        return Some(format!("image history (layer {} from top)", index));
    }

    if redactor.contains_secret(inspect_raw) {
        return Some("image configuration".to_string());
    }

    None
}

/// Inspects a built image, checks its metadata and scans it for leaked secrets.
///
/// In [`SecretMode::BuildArg`] a leak is expected and only logged.
pub async fn verify_image<R: CommandRunner>(
    docker: &DockerCli<R>,
    recipe: &Recipe,
    tag: &str,
    redactor: &Redactor,
) -> Result<ImageMetadata> {
    let (metadata, inspect_raw) = docker.inspect(tag).await?;
    check_metadata(recipe, &metadata)?;

    if redactor.is_empty() {
        tracing::debug!("No secret values known; skipping leak scan");
        return Ok(metadata);
    }

    let history = docker.history(tag).await?;
    match (find_leak(redactor, &history, &inspect_raw), recipe.secret_mode) {
        (Some(location), SecretMode::Mount) => Err(BuildError::SecretLeakError { location }),
        (Some(location), SecretMode::BuildArg) => {
            tracing::warn!(
                "⚠️ Secret value is visible in {} (expected with --secret-mode build-arg)",
                location
            );
            Ok(metadata)
        }
        (None, _) => {
            tracing::info!("🔒 No secret values found in image history or configuration");
            Ok(metadata)
        }
    }
}
