use crate::adapters::docker::DockerCli;
use crate::core::pipeline::{BuildSequence, StageContext};
use crate::core::stages::{
    BuildPlan, ImageBuildStage, RenderDockerfileStage, ResolveArgsStage, StageSourceStage,
    ValidateRecipeStage, VerifyImageStage,
};
use crate::domain::ports::{CommandRunner, Storage};
use crate::utils::error::Result;
use std::sync::Arc;

pub const REPORT_NAME: &str = "build-report.json";

/// Drives a [`BuildPlan`] through the host-side build stages.
pub struct BuildEngine<S: Storage, R: CommandRunner> {
    plan: Arc<BuildPlan>,
    storage: Arc<S>,
    docker: Arc<DockerCli<R>>,
    monitor_enabled: bool,
}

impl<S: Storage + 'static, R: CommandRunner + 'static> BuildEngine<S, R> {
    pub fn new(plan: BuildPlan, storage: S, docker: DockerCli<R>) -> Self {
        Self {
            plan: Arc::new(plan),
            storage: Arc::new(storage),
            docker: Arc::new(docker),
            monitor_enabled: false,
        }
    }

    pub fn new_with_monitoring(plan: BuildPlan, storage: S, docker: DockerCli<R>, monitor_enabled: bool) -> Self {
        Self {
            monitor_enabled,
            ..Self::new(plan, storage, docker)
        }
    }

    pub fn plan(&self) -> &BuildPlan {
        &self.plan
    }

    /// 建立固定順序的建置階段
    pub fn sequence(&self, execution_id: String) -> BuildSequence {
        let mut sequence = BuildSequence::new(execution_id).with_monitoring(self.monitor_enabled);
        sequence.add_stage(Box::new(ValidateRecipeStage::new(Arc::clone(&self.plan))));
        sequence.add_stage(Box::new(ResolveArgsStage::new(Arc::clone(&self.plan))));
        sequence.add_stage(Box::new(StageSourceStage::new(Arc::clone(&self.plan))));
        sequence.add_stage(Box::new(RenderDockerfileStage::new(
            Arc::clone(&self.plan),
            Arc::clone(&self.storage),
        )));
        sequence.add_stage(Box::new(ImageBuildStage::new(
            Arc::clone(&self.plan),
            Arc::clone(&self.docker),
        )));
        sequence.add_stage(Box::new(VerifyImageStage::new(
            Arc::clone(&self.plan),
            Arc::clone(&self.docker),
        )));
        sequence
    }

    pub async fn run(&self) -> Result<StageContext> {
        let execution_id = format!("build-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
        tracing::info!("🚀 Building {} ({})", self.plan.tag, execution_id);

        let context = self.sequence(execution_id).execute_all().await?;

        tracing::info!(
            "🏁 {} stages completed, {} skipped",
            context.previous_results.len(),
            context.skipped_stages.len()
        );
        Ok(context)
    }

    /// Writes the execution summary next to the rendered Dockerfile.
    pub async fn write_report(&self, context: &StageContext) -> Result<String> {
        let mut summary = BuildSequence::get_execution_summary(context);
        if let Some(object) = summary.as_object_mut() {
            object.insert("tag".to_string(), serde_json::json!(self.plan.tag));
            object.insert("secret_mode".to_string(), serde_json::json!(self.plan.recipe.secret_mode));
        }

        let data = serde_json::to_vec_pretty(&summary)?;
        self.storage.write_file(REPORT_NAME, &data).await
    }
}
