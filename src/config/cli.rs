use crate::config::toml_config::{RecipeConfig, DEFAULT_CONFIG_FILE};
use crate::core::args::SuppliedArgs;
use crate::core::idle::DEFAULT_READY_FILE;
use crate::core::recipe::SecretMode;
use crate::core::source::IgnoreRules;
use crate::core::stages::BuildPlan;
use crate::utils::error::Result;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(name = "breakwater-image")]
#[command(version, about = "Builds the breakwater container image")]
pub struct CliConfig {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Docker-compatible CLI to invoke
    #[arg(long, global = true, default_value = "docker")]
    pub docker: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Render the Dockerfile without building
    Render(RenderArgs),
    /// Render, build and verify the image
    Build(BuildArgs),
    /// Check an existing image against the recipe
    Verify(VerifyArgs),
    /// Hold the container in an explicit idle state
    Idle(IdleArgs),
    /// Exit 0 when the idle readiness marker is present
    Probe(ProbeArgs),
}

#[derive(Debug, Args)]
pub struct RenderArgs {
    /// Path to the recipe file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Output directory, overrides [output] dir
    #[arg(short, long)]
    pub output: Option<String>,
}

#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Path to the recipe file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Image tag, overrides [image] name and tag
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Build argument as NAME=VALUE (repeatable)
    #[arg(long = "build-arg", value_name = "NAME=VALUE")]
    pub build_args: Vec<String>,

    /// How secret build arguments reach the build
    #[arg(long, value_enum)]
    pub secret_mode: Option<SecretMode>,

    /// Build without secrets that have no value
    #[arg(long)]
    pub allow_missing_secrets: bool,

    #[arg(long)]
    pub no_cache: bool,

    /// Skip inspecting the built image
    #[arg(long)]
    pub no_verify: bool,

    /// Stop after rendering the Dockerfile
    #[arg(long)]
    pub render_only: bool,

    /// Show what would be built without executing
    #[arg(long)]
    pub dry_run: bool,

    /// Log CPU and memory usage per stage
    #[arg(long)]
    pub monitor: bool,
}

#[derive(Debug, Args)]
pub struct VerifyArgs {
    /// Path to the recipe file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Image to inspect
    #[arg(short, long)]
    pub tag: String,

    /// Build argument as NAME=VALUE, used only to scan for leaked secrets
    #[arg(long = "build-arg", value_name = "NAME=VALUE")]
    pub build_args: Vec<String>,
}

#[derive(Debug, Args)]
pub struct IdleArgs {
    #[arg(long, default_value = DEFAULT_READY_FILE)]
    pub ready_file: PathBuf,

    /// Service operators are expected to start by hand
    #[arg(long)]
    pub service: Option<String>,
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    #[arg(long, default_value = DEFAULT_READY_FILE)]
    pub ready_file: PathBuf,
}

/// 相對路徑以設定檔所在目錄為基準
pub fn resolve_relative(config_path: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(path),
        _ => path.to_path_buf(),
    }
}

/// 合併預設忽略規則、設定檔規則與既有的 .dockerignore
pub fn ignore_rules(config: &RecipeConfig, context_dir: &Path) -> Result<IgnoreRules> {
    let mut rules = IgnoreRules::with_defaults(&config.context.ignore)?;
    let existing = context_dir.join(".dockerignore");
    if existing.is_file() {
        tracing::debug!("Merging rules from {}", existing.display());
        rules.extend(IgnoreRules::from_dockerignore(&existing)?);
    }
    Ok(rules)
}

impl BuildArgs {
    pub fn build_plan(&self, config: &RecipeConfig) -> Result<BuildPlan> {
        let mut recipe = config.into_recipe();
        if let Some(mode) = self.secret_mode {
            recipe.secret_mode = mode;
        }

        let context_dir = resolve_relative(&self.config, config.context_path());
        let ignore = ignore_rules(config, &context_dir)?;
        let supplied_args = SuppliedArgs::collect(recipe.args.specs(), &self.build_args, |var| {
            std::env::var(var).ok()
        })?;

        Ok(BuildPlan {
            recipe,
            context_dir,
            ignore,
            write_dockerignore: config.context.write_dockerignore,
            tag: self.tag.clone().unwrap_or_else(|| config.image_tag()),
            supplied_args,
            allow_missing_secrets: self.allow_missing_secrets,
            no_cache: self.no_cache,
            verify: !self.no_verify,
            render_only: self.render_only,
        })
    }

    pub fn output_dir(&self, config: &RecipeConfig) -> PathBuf {
        resolve_relative(&self.config, config.output_dir())
    }
}

impl RenderArgs {
    /// Rendering never contacts docker, so missing secrets are tolerated.
    pub fn as_build_args(&self) -> BuildArgs {
        BuildArgs {
            config: self.config.clone(),
            tag: None,
            build_args: Vec::new(),
            secret_mode: None,
            allow_missing_secrets: true,
            no_cache: false,
            no_verify: true,
            render_only: true,
            dry_run: false,
            monitor: false,
        }
    }

    pub fn output_dir(&self, config: &RecipeConfig) -> PathBuf {
        match &self.output {
            Some(dir) => PathBuf::from(dir),
            None => resolve_relative(&self.config, config.output_dir()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_build_command() {
        let cli = CliConfig::try_parse_from([
            "breakwater-image",
            "-v",
            "build",
            "--config",
            "deploy/breakwater.toml",
            "--build-arg",
            "GITHUB_TOKEN=abc",
            "--secret-mode",
            "build-arg",
            "--no-cache",
        ])
        .unwrap();

        assert!(cli.verbose);
        assert_eq!(cli.docker, "docker");
        match cli.command {
            Command::Build(args) => {
                assert_eq!(args.config, PathBuf::from("deploy/breakwater.toml"));
                assert_eq!(args.build_args, vec!["GITHUB_TOKEN=abc"]);
                assert_eq!(args.secret_mode, Some(SecretMode::BuildArg));
                assert!(args.no_cache);
                assert!(!args.render_only);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_verify_requires_tag() {
        assert!(CliConfig::try_parse_from(["breakwater-image", "verify"]).is_err());
    }

    #[test]
    fn test_idle_defaults() {
        let cli = CliConfig::try_parse_from(["breakwater-image", "idle"]).unwrap();
        match cli.command {
            Command::Idle(args) => assert_eq!(args.ready_file, PathBuf::from(DEFAULT_READY_FILE)),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_resolve_relative_to_config_dir() {
        assert_eq!(
            resolve_relative(Path::new("deploy/breakwater.toml"), ".."),
            PathBuf::from("deploy/..")
        );
        assert_eq!(resolve_relative(Path::new("breakwater.toml"), "."), PathBuf::from("."));
        assert_eq!(resolve_relative(Path::new("x/b.toml"), "/srv/app"), PathBuf::from("/srv/app"));
    }

    #[test]
    fn test_build_plan_from_cli() {
        let args = BuildArgs {
            config: PathBuf::from("breakwater.toml"),
            tag: Some("breakwater:test".to_string()),
            build_args: vec!["GITHUB_TOKEN=from-cli".to_string()],
            secret_mode: Some(SecretMode::BuildArg),
            allow_missing_secrets: false,
            no_cache: false,
            no_verify: true,
            render_only: false,
            dry_run: false,
            monitor: false,
        };

        let plan = args.build_plan(&RecipeConfig::default()).unwrap();
        assert_eq!(plan.tag, "breakwater:test");
        assert_eq!(plan.recipe.secret_mode, SecretMode::BuildArg);
        assert_eq!(plan.supplied_args.get("GITHUB_TOKEN").unwrap().expose(), "from-cli");
        assert!(!plan.verify);
    }
}
