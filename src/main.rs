use breakwater_image::config::cli::{BuildArgs, Command, IdleArgs, ProbeArgs, RenderArgs, VerifyArgs};
use breakwater_image::core::args::SuppliedArgs;
use breakwater_image::core::idle::{probe, shutdown_signal, IdleProcess};
use breakwater_image::core::verify::verify_image;
use breakwater_image::utils::redact::Redactor;
use breakwater_image::utils::{logger, validation::Validate};
use breakwater_image::{
    BuildEngine, BuildPlan, CliConfig, DockerCli, LocalStorage, ProcessRunner, RecipeConfig,
    Result,
};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = CliConfig::parse();

    // 初始化日誌
    if cli.log_json {
        logger::init_json_logger(cli.verbose);
    } else {
        logger::init_cli_logger(cli.verbose);
    }

    let docker = DockerCli::new(ProcessRunner).with_program(cli.docker);
    let outcome = match cli.command {
        Command::Render(args) => render(args, docker).await,
        Command::Build(args) => build(args, docker).await,
        Command::Verify(args) => verify(args, docker).await,
        Command::Idle(args) => idle(args).await,
        Command::Probe(args) => run_probe(args).await,
    };

    if let Err(e) = outcome {
        // 記錄詳細錯誤信息
        tracing::error!(
            "❌ Failed: {} (Category: {:?}, Severity: {:?})",
            e,
            e.category(),
            e.severity()
        );
        tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

        eprintln!("❌ {}", e.user_friendly_message());
        eprintln!("💡 Suggestion: {}", e.recovery_suggestion());
        std::process::exit(e.exit_code());
    }
}

fn load_config(path: &std::path::Path) -> Result<RecipeConfig> {
    tracing::info!("📁 Loading recipe from: {}", path.display());
    let config = RecipeConfig::load_or_default(path)?;
    config.validate()?;
    tracing::info!("✅ Recipe loaded and validated");
    Ok(config)
}

async fn render(args: RenderArgs, docker: DockerCli<ProcessRunner>) -> Result<()> {
    let config = load_config(&args.config)?;
    let plan = args.as_build_args().build_plan(&config)?;
    let storage = LocalStorage::new(args.output_dir(&config));

    let engine = BuildEngine::new(plan, storage, docker);
    let context = engine.run().await?;

    if let Some(path) = context.dockerfile_path {
        println!("📄 Dockerfile written to: {}", path);
    }
    Ok(())
}

async fn build(args: BuildArgs, docker: DockerCli<ProcessRunner>) -> Result<()> {
    let config = load_config(&args.config)?;
    let plan = args.build_plan(&config)?;

    display_plan_summary(&plan, &args);

    let storage = LocalStorage::new(args.output_dir(&config));
    let engine = BuildEngine::new_with_monitoring(plan, storage, docker, args.monitor);

    if args.dry_run {
        tracing::info!("🔍 DRY RUN MODE - nothing will be written or built");
        perform_dry_run(&engine);
        return Ok(());
    }

    if args.monitor {
        tracing::info!("🔍 System monitoring enabled");
    }

    let context = engine.run().await?;
    let report = engine.write_report(&context).await?;

    tracing::info!("✅ Build completed successfully!");
    match &context.image {
        Some(image) => println!("✅ Image {} ({})", engine.plan().tag, image.id),
        None => println!("✅ Build finished for {}", engine.plan().tag),
    }
    println!("📁 Report saved to: {}", report);
    Ok(())
}

async fn verify(args: VerifyArgs, docker: DockerCli<ProcessRunner>) -> Result<()> {
    let config = load_config(&args.config)?;
    let recipe = config.into_recipe();

    let supplied = SuppliedArgs::collect(recipe.args.specs(), &args.build_args, |var| std::env::var(var).ok())?;
    let resolved = recipe.args.resolve(&supplied, true)?;
    let redactor = Redactor::new(resolved.sensitive_values());

    let metadata = verify_image(&docker, &recipe, &args.tag, &redactor).await?;

    let ports: Vec<String> = metadata.exposed_ports.iter().map(|p| p.to_string()).collect();
    println!("✅ {} verified", args.tag);
    println!("  Exposed ports: {}", ports.join(", "));
    println!("  Command: {:?}", metadata.cmd);
    println!("  Working dir: {}", metadata.working_dir);
    Ok(())
}

async fn idle(args: IdleArgs) -> Result<()> {
    IdleProcess::new(args.ready_file)
        .with_service(args.service)
        .run_until(shutdown_signal())
        .await
}

async fn run_probe(args: ProbeArgs) -> Result<()> {
    let marker = probe(&args.ready_file).await?;
    println!("{}", serde_json::to_string(&marker)?);
    Ok(())
}

fn display_plan_summary(plan: &BuildPlan, args: &BuildArgs) {
    println!("📋 Build Summary:");
    println!("  Tag: {}", plan.tag);
    println!("  Base: {}", plan.recipe.base_image);
    println!("  Context: {}", plan.context_dir.display());
    println!("  Secret mode: {:?}", plan.recipe.secret_mode);

    let supplied: Vec<&str> = plan.supplied_args.names().collect();
    println!(
        "  Build args supplied: {}",
        if supplied.is_empty() { "(none)".to_string() } else { supplied.join(", ") }
    );

    if plan.allow_missing_secrets {
        println!("  ⚠️ Missing secrets allowed");
    }
    if plan.render_only {
        println!("  Render only");
    }
    if args.dry_run {
        println!("  🔍 DRY RUN MODE ENABLED");
    }
}

fn perform_dry_run<S, R>(engine: &BuildEngine<S, R>)
where
    S: breakwater_image::core::Storage + 'static,
    R: breakwater_image::core::CommandRunner + 'static,
{
    let sequence = engine.sequence("dry-run".to_string());
    println!("🔍 Stages:");
    for (index, name) in sequence.stage_names().iter().enumerate() {
        println!("  {}. {}", index + 1, name);
    }

    println!("🔍 Recipe steps:");
    for step in engine.plan().recipe.steps() {
        println!("  - {}", step.name());
    }
}
