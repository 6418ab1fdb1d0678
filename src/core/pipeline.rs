use crate::core::args::ResolvedArgs;
use crate::core::source::SourceTree;
use crate::domain::model::ImageMetadata;
use crate::utils::error::{BuildError, Result};
use crate::utils::monitor::SystemMonitor;
use crate::utils::redact::Redactor;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Stage 執行結果
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage_name: String,
    pub detail: String,
    pub duration: Duration,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// What a stage reports back on success.
#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    pub detail: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl StageOutcome {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// 建置執行上下文，用於在 Stage 間傳遞狀態
#[derive(Debug, Default)]
pub struct StageContext {
    pub execution_id: String,
    pub previous_results: Vec<StageResult>,
    pub skipped_stages: Vec<String>,
    pub resolved_args: Option<ResolvedArgs>,
    pub source: Option<SourceTree>,
    pub dockerfile_path: Option<String>,
    pub image: Option<ImageMetadata>,
}

impl StageContext {
    pub fn new(execution_id: String) -> Self {
        Self {
            execution_id,
            ..Default::default()
        }
    }

    pub fn get_result_by_name(&self, name: &str) -> Option<&StageResult> {
        self.previous_results.iter().find(|r| r.stage_name == name)
    }

    pub fn add_result(&mut self, result: StageResult) {
        self.previous_results.push(result);
    }

    /// Redactor over every sensitive value resolved so far.
    pub fn redactor(&self) -> Redactor {
        Redactor::new(
            self.resolved_args
                .as_ref()
                .map(ResolvedArgs::sensitive_values)
                .unwrap_or_default(),
        )
    }
}

/// 建置流程中的單一具名步驟
#[async_trait::async_trait]
pub trait BuildStage: Send + Sync {
    fn name(&self) -> &str;

    /// 根據上下文決定是否執行
    fn should_execute(&self, _context: &StageContext) -> bool {
        true
    }

    async fn run(&self, context: &mut StageContext) -> Result<StageOutcome>;
}

/// Runs stages strictly in order and stops at the first failure.
pub struct BuildSequence {
    stages: Vec<Box<dyn BuildStage>>,
    monitor: Option<SystemMonitor>,
    execution_id: String,
}

impl BuildSequence {
    pub fn new(execution_id: String) -> Self {
        Self {
            stages: Vec::new(),
            monitor: None,
            execution_id,
        }
    }

    /// 啟用或禁用系統監控
    pub fn with_monitoring(mut self, enabled: bool) -> Self {
        self.monitor = enabled.then(|| SystemMonitor::new(true));
        self
    }

    pub fn add_stage(&mut self, stage: Box<dyn BuildStage>) {
        self.stages.push(stage);
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn execute_all(&self) -> Result<StageContext> {
        let mut context = StageContext::new(self.execution_id.clone());

        if let Some(monitor) = &self.monitor {
            monitor.log_stats("Build started");
        }

        for stage in &self.stages {
            if !stage.should_execute(&context) {
                tracing::info!("⏭️ Skipping stage: {}", stage.name());
                context.skipped_stages.push(stage.name().to_string());
                continue;
            }

            tracing::info!("▶️ Stage: {}", stage.name());
            let start_time = Instant::now();

            match stage.run(&mut context).await {
                Ok(outcome) => {
                    let result = StageResult {
                        stage_name: stage.name().to_string(),
                        detail: outcome.detail,
                        duration: start_time.elapsed(),
                        metadata: outcome.metadata,
                    };

                    tracing::info!(
                        "✅ Stage completed: {} ({}, duration: {:?})",
                        result.stage_name,
                        result.detail,
                        result.duration
                    );

                    if let Some(monitor) = &self.monitor {
                        monitor.log_stats(&result.stage_name);
                    }

                    context.add_result(result);
                }
                Err(e) => {
                    tracing::error!("❌ Stage failed: {}: {}", stage.name(), e);
                    return Err(BuildError::StageFailed {
                        stage: stage.name().to_string(),
                        source: Box::new(e),
                    });
                }
            }
        }

        if let Some(monitor) = &self.monitor {
            monitor.log_stats("Build completed");
        }

        Ok(context)
    }

    /// 獲取執行摘要
    pub fn get_execution_summary(context: &StageContext) -> serde_json::Value {
        let total_duration: Duration = context.previous_results.iter().map(|r| r.duration).sum();

        let stages: Vec<serde_json::Value> = context
            .previous_results
            .iter()
            .map(|r| {
                json!({
                    "name": r.stage_name,
                    "detail": r.detail,
                    "duration_ms": r.duration.as_millis() as u64,
                    "metadata": r.metadata,
                })
            })
            .collect();

        json!({
            "execution_id": context.execution_id,
            "total_stages": context.previous_results.len(),
            "total_duration_ms": total_duration.as_millis() as u64,
            "executed_stages": stages,
            "skipped_stages": context.skipped_stages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct MockStage {
        name: String,
        should_execute: bool,
        fail: bool,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl MockStage {
        fn new(name: &str, calls: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                should_execute: true,
                fail: false,
                calls: Arc::clone(calls),
            }
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn with_execution_condition(mut self, should_execute: bool) -> Self {
            self.should_execute = should_execute;
            self
        }
    }

    #[async_trait::async_trait]
    impl BuildStage for MockStage {
        fn name(&self) -> &str {
            &self.name
        }

        fn should_execute(&self, _context: &StageContext) -> bool {
            self.should_execute
        }

        async fn run(&self, context: &mut StageContext) -> Result<StageOutcome> {
            self.calls.lock().unwrap().push(self.name.clone());
            if self.fail {
                return Err(BuildError::CommandError {
                    program: "docker".to_string(),
                    code: Some(1),
                    stderr: "boom".to_string(),
                });
            }
            Ok(StageOutcome::new(format!("{} done", self.name)).with_metadata("order", json!(context.previous_results.len())))
        }
    }

    #[tokio::test]
    async fn test_sequence_runs_stages_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut sequence = BuildSequence::new("test".to_string());
        sequence.add_stage(Box::new(MockStage::new("first", &calls)));
        sequence.add_stage(Box::new(MockStage::new("second", &calls)));

        let context = sequence.execute_all().await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(context.previous_results.len(), 2);
        assert_eq!(context.previous_results[1].stage_name, "second");
        assert_eq!(context.get_result_by_name("first").unwrap().detail, "first done");
    }

    #[tokio::test]
    async fn test_sequence_stops_at_first_failure() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut sequence = BuildSequence::new("test".to_string());
        sequence.add_stage(Box::new(MockStage::new("first", &calls)));
        sequence.add_stage(Box::new(MockStage::new("broken", &calls).failing()));
        sequence.add_stage(Box::new(MockStage::new("never", &calls)));

        let err = sequence.execute_all().await.unwrap_err();

        assert_eq!(*calls.lock().unwrap(), vec!["first", "broken"]);
        match err {
            BuildError::StageFailed { stage, source } => {
                assert_eq!(stage, "broken");
                assert!(matches!(*source, BuildError::CommandError { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sequence_skips_and_summarises() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut sequence = BuildSequence::new("summary".to_string());
        sequence.add_stage(Box::new(MockStage::new("first", &calls)));
        sequence.add_stage(Box::new(MockStage::new("skipped", &calls).with_execution_condition(false)));
        sequence.add_stage(Box::new(MockStage::new("third", &calls)));

        assert_eq!(sequence.stage_names(), vec!["first", "skipped", "third"]);

        let context = sequence.execute_all().await.unwrap();
        let summary = BuildSequence::get_execution_summary(&context);

        assert_eq!(summary["execution_id"], "summary");
        assert_eq!(summary["total_stages"], 2);
        assert_eq!(summary["skipped_stages"], json!(["skipped"]));
        assert_eq!(summary["executed_stages"][1]["name"], "third");
        assert_eq!(summary["executed_stages"][1]["metadata"]["order"], 1);
    }
}
