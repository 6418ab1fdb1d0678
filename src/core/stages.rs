use crate::adapters::docker::{BuildRequest, DockerCli};
use crate::core::args::SuppliedArgs;
use crate::core::pipeline::{BuildStage, StageContext, StageOutcome};
use crate::core::recipe::{Recipe, RenderInputs, SecretMode};
use crate::core::source::{IgnoreRules, SourceTree};
use crate::core::verify::verify_image;
use crate::domain::model::Secret;
use crate::domain::ports::{CommandRunner, Storage};
use crate::utils::error::{BuildError, Result};
use crate::utils::validation::Validate;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

pub const DOCKERFILE_NAME: &str = "Dockerfile";
/// BuildKit reads `<Dockerfile>.dockerignore` in place of the context root `.dockerignore`.
pub const DOCKERIGNORE_NAME: &str = "Dockerfile.dockerignore";

/// Everything a build needs, assembled from the recipe file and CLI flags.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub recipe: Recipe,
    pub context_dir: PathBuf,
    pub ignore: IgnoreRules,
    pub write_dockerignore: bool,
    pub tag: String,
    pub supplied_args: SuppliedArgs,
    pub allow_missing_secrets: bool,
    pub no_cache: bool,
    pub verify: bool,
    pub render_only: bool,
}

fn missing_state(stage: &str, what: &str) -> BuildError {
    BuildError::ConfigError {
        message: format!("stage '{}' requires {} from an earlier stage", stage, what),
    }
}

pub struct ValidateRecipeStage {
    plan: Arc<BuildPlan>,
}

impl ValidateRecipeStage {
    pub fn new(plan: Arc<BuildPlan>) -> Self {
        Self { plan }
    }
}

#[async_trait::async_trait]
impl BuildStage for ValidateRecipeStage {
    fn name(&self) -> &str {
        "validate-recipe"
    }

    async fn run(&self, _context: &mut StageContext) -> Result<StageOutcome> {
        let recipe = &self.plan.recipe;
        recipe.validate()?;

        if recipe.secret_mode == SecretMode::BuildArg {
            tracing::warn!(
                "⚠️ Secret mode 'build-arg' passes tokens as build arguments; they will be visible in image history"
            );
        }

        Ok(StageOutcome::new(format!(
            "{} steps, base {}",
            recipe.steps().len(),
            recipe.base_image
        ))
        .with_metadata("secret_mode", json!(recipe.secret_mode)))
    }
}

pub struct ResolveArgsStage {
    plan: Arc<BuildPlan>,
}

impl ResolveArgsStage {
    pub fn new(plan: Arc<BuildPlan>) -> Self {
        Self { plan }
    }
}

#[async_trait::async_trait]
impl BuildStage for ResolveArgsStage {
    fn name(&self) -> &str {
        "resolve-args"
    }

    async fn run(&self, context: &mut StageContext) -> Result<StageOutcome> {
        let resolved = self
            .plan
            .recipe
            .args
            .resolve(&self.plan.supplied_args, self.plan.allow_missing_secrets)?;

        let names: Vec<&str> = resolved.iter().map(|(name, _)| name).collect();
        let dropped: Vec<&str> = resolved.dropped().collect();
        let outcome = StageOutcome::new(format!("{} resolved, {} dropped", names.len(), dropped.len()))
            .with_metadata("resolved", json!(names))
            .with_metadata("dropped", json!(dropped));

        context.resolved_args = Some(resolved);
        Ok(outcome)
    }
}

pub struct StageSourceStage {
    plan: Arc<BuildPlan>,
}

impl StageSourceStage {
    pub fn new(plan: Arc<BuildPlan>) -> Self {
        Self { plan }
    }
}

#[async_trait::async_trait]
impl BuildStage for StageSourceStage {
    fn name(&self) -> &str {
        "stage-source"
    }

    async fn run(&self, context: &mut StageContext) -> Result<StageOutcome> {
        let plan = Arc::clone(&self.plan);
        let tree = tokio::task::spawn_blocking(move || SourceTree::scan(&plan.context_dir, &plan.ignore))
            .await
            .map_err(|e| BuildError::ContextError {
                path: self.plan.context_dir.display().to_string(),
                message: format!("context scan aborted: {}", e),
            })??;

        let project = tree.require_project()?;
        tracing::info!(
            "📦 Project {} {} ({} files, {} bytes, digest {})",
            project.name,
            project.version.as_deref().unwrap_or("(unversioned)"),
            tree.entries.len(),
            tree.total_bytes,
            &tree.digest[..12]
        );

        if self.plan.write_dockerignore {
            let path = self.plan.context_dir.join(".dockerignore");
            tokio::fs::write(&path, self.plan.ignore.to_dockerignore()).await?;
            tracing::debug!("Wrote {}", path.display());
        }

        let outcome = StageOutcome::new(format!("{} files staged", tree.entries.len()))
            .with_metadata("digest", json!(tree.digest))
            .with_metadata("project", json!(project));

        context.source = Some(tree);
        Ok(outcome)
    }
}

pub struct RenderDockerfileStage<S: Storage> {
    plan: Arc<BuildPlan>,
    storage: Arc<S>,
}

impl<S: Storage> RenderDockerfileStage<S> {
    pub fn new(plan: Arc<BuildPlan>, storage: Arc<S>) -> Self {
        Self { plan, storage }
    }
}

#[async_trait::async_trait]
impl<S: Storage + 'static> BuildStage for RenderDockerfileStage<S> {
    fn name(&self) -> &str {
        "render-dockerfile"
    }

    async fn run(&self, context: &mut StageContext) -> Result<StageOutcome> {
        let index_enabled = match (&self.plan.recipe.install.index_arg, &context.resolved_args) {
            (Some(arg), Some(resolved)) => !resolved.is_dropped(arg),
            _ => true,
        };
        let inputs = RenderInputs {
            context_digest: context.source.as_ref().map(|s| s.digest.as_str()),
            project: context.source.as_ref().and_then(|s| s.project.as_ref()),
            index_enabled,
        };

        let dockerfile = self.plan.recipe.render(&inputs);
        let path = self.storage.write_file(DOCKERFILE_NAME, dockerfile.as_bytes()).await?;
        // 與摘要使用同一套規則，確保 docker 收到的 context 與標籤一致
        let ignore_path = self
            .storage
            .write_file(DOCKERIGNORE_NAME, self.plan.ignore.to_dockerignore().as_bytes())
            .await?;

        let outcome = StageOutcome::new(format!("written to {}", path))
            .with_metadata("bytes", json!(dockerfile.len()))
            .with_metadata("ignore_file", json!(ignore_path));
        context.dockerfile_path = Some(path);
        Ok(outcome)
    }
}

pub struct ImageBuildStage<R: CommandRunner> {
    plan: Arc<BuildPlan>,
    docker: Arc<DockerCli<R>>,
}

impl<R: CommandRunner> ImageBuildStage<R> {
    pub fn new(plan: Arc<BuildPlan>, docker: Arc<DockerCli<R>>) -> Self {
        Self { plan, docker }
    }

    /// 依秘密模式決定哪些值走 build arg、哪些走 secret mount
    fn build_request(&self, context: &StageContext, dockerfile: &str) -> Result<BuildRequest> {
        let recipe = &self.plan.recipe;
        let resolved = context
            .resolved_args
            .as_ref()
            .ok_or_else(|| missing_state("build-image", "resolved build arguments"))?;

        let rendered: Vec<&str> = recipe.rendered_args().into_iter().map(|s| s.name.as_str()).collect();
        let build_args: Vec<(String, Secret)> = resolved
            .iter()
            .filter(|(name, _)| rendered.contains(name))
            .map(|(name, arg)| (name.to_string(), arg.value.clone()))
            .collect();

        let mut secrets = Vec::new();
        if let (Some(id), Some(index_arg)) = (recipe.index_secret_id(), &recipe.install.index_arg) {
            match resolved.get(index_arg) {
                Some(arg) => secrets.push((id, arg.value.clone())),
                None => tracing::warn!("⚠️ No value for {}; installing from public index only", index_arg),
            }
        }

        Ok(BuildRequest {
            dockerfile: PathBuf::from(dockerfile),
            context_dir: self.plan.context_dir.clone(),
            tag: self.plan.tag.clone(),
            build_args,
            secrets,
            no_cache: self.plan.no_cache,
        })
    }
}

#[async_trait::async_trait]
impl<R: CommandRunner + 'static> BuildStage for ImageBuildStage<R> {
    fn name(&self) -> &str {
        "build-image"
    }

    fn should_execute(&self, _context: &StageContext) -> bool {
        !self.plan.render_only
    }

    async fn run(&self, context: &mut StageContext) -> Result<StageOutcome> {
        let dockerfile = context
            .dockerfile_path
            .clone()
            .ok_or_else(|| missing_state(self.name(), "a rendered Dockerfile"))?;
        let request = self.build_request(context, &dockerfile)?;

        self.docker.build(&request, &context.redactor()).await?;

        let arg_names: Vec<&str> = request.build_args.iter().map(|(name, _)| name.as_str()).collect();
        let secret_ids: Vec<&str> = request.secrets.iter().map(|(id, _)| id.as_str()).collect();
        Ok(StageOutcome::new(format!("image {} built", self.plan.tag))
            .with_metadata("tag", json!(self.plan.tag))
            .with_metadata("build_args", json!(arg_names))
            .with_metadata("secrets", json!(secret_ids)))
    }
}

pub struct VerifyImageStage<R: CommandRunner> {
    plan: Arc<BuildPlan>,
    docker: Arc<DockerCli<R>>,
}

impl<R: CommandRunner> VerifyImageStage<R> {
    pub fn new(plan: Arc<BuildPlan>, docker: Arc<DockerCli<R>>) -> Self {
        Self { plan, docker }
    }
}

#[async_trait::async_trait]
impl<R: CommandRunner + 'static> BuildStage for VerifyImageStage<R> {
    fn name(&self) -> &str {
        "verify-image"
    }

    fn should_execute(&self, _context: &StageContext) -> bool {
        self.plan.verify && !self.plan.render_only
    }

    async fn run(&self, context: &mut StageContext) -> Result<StageOutcome> {
        let metadata = verify_image(&self.docker, &self.plan.recipe, &self.plan.tag, &context.redactor()).await?;

        let ports: Vec<String> = metadata.exposed_ports.iter().map(|p| p.to_string()).collect();
        let outcome = StageOutcome::new(format!("{} verified", metadata.id))
            .with_metadata("image_id", json!(metadata.id))
            .with_metadata("exposed_ports", json!(ports));
        context.image = Some(metadata);
        Ok(outcome)
    }
}
