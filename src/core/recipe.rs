//! The image recipe and its Dockerfile rendering.
//!
//! A recipe is an ordered list of [`RecipeStep`]s. Rendering is a pure
//! function of the recipe and [`RenderInputs`]; secret values never reach it,
//! so the same inputs always yield a byte-identical Dockerfile.

use crate::core::args::{ArgSet, ArgSpec};
use crate::domain::model::{ExposedPort, ProjectInfo};
use crate::utils::error::{BuildError, Result};
use crate::utils::validation::{
    validate_absolute_container_path, validate_non_empty_string, validate_package_names,
    validate_pinned_image, validate_range, validate_unique, validate_url_template, Validate,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

pub const DEFAULT_BASE_IMAGE: &str = "python:3.10-slim";
pub const DEFAULT_WORKDIR: &str = "/breakwater";
pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_INDEX_URL: &str = "https://${GITHUB_TOKEN}@pypi.data.vanoord.com/";
pub const IDLE_COMMAND: [&str; 3] = ["tail", "-f", "/dev/null"];

pub const LABEL_ENTRYPOINT: &str = "org.breakwater.entrypoint";
pub const LABEL_CONTEXT_DIGEST: &str = "org.breakwater.context-digest";
pub const LABEL_VERSION: &str = "org.opencontainers.image.version";
pub const LABEL_TITLE: &str = "org.opencontainers.image.title";

/// 秘密注入方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
pub enum SecretMode {
    /// BuildKit secret mount scoped to the install instruction.
    #[default]
    Mount,
    /// Plain build arguments. Values are visible in image history.
    BuildArg,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultCommand {
    /// Keep-alive placeholder; no service is started.
    Idle,
    Exec(Vec<String>),
}

impl DefaultCommand {
    pub fn argv(&self) -> Vec<String> {
        match self {
            DefaultCommand::Idle => IDLE_COMMAND.iter().map(|s| s.to_string()).collect(),
            DefaultCommand::Exec(argv) => argv.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSpec {
    pub target: String,
    pub editable: bool,
    /// Build argument holding the extra package index URL.
    pub index_arg: Option<String>,
}

impl Default for InstallSpec {
    fn default() -> Self {
        Self {
            target: ".".to_string(),
            editable: true,
            index_arg: Some("PYPI_URL".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeStep {
    Base,
    Args,
    SystemPackages,
    UpgradeInstaller,
    StageSource,
    InstallApplication,
    Expose,
    DefaultCommand,
}

impl RecipeStep {
    pub const ALL: [RecipeStep; 8] = [
        RecipeStep::Base,
        RecipeStep::Args,
        RecipeStep::SystemPackages,
        RecipeStep::UpgradeInstaller,
        RecipeStep::StageSource,
        RecipeStep::InstallApplication,
        RecipeStep::Expose,
        RecipeStep::DefaultCommand,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RecipeStep::Base => "base",
            RecipeStep::Args => "args",
            RecipeStep::SystemPackages => "system-packages",
            RecipeStep::UpgradeInstaller => "upgrade-installer",
            RecipeStep::StageSource => "stage-source",
            RecipeStep::InstallApplication => "install-application",
            RecipeStep::Expose => "expose",
            RecipeStep::DefaultCommand => "default-command",
        }
    }
}

/// Per-build facts that end up in the Dockerfile. Contains no secret values.
#[derive(Debug, Clone)]
pub struct RenderInputs<'a> {
    pub context_digest: Option<&'a str>,
    pub project: Option<&'a ProjectInfo>,
    /// False when the private index arg was dropped for lack of a token.
    pub index_enabled: bool,
}

impl Default for RenderInputs<'_> {
    fn default() -> Self {
        Self {
            context_digest: None,
            project: None,
            index_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    pub base_image: String,
    pub args: ArgSet,
    pub system_packages: Vec<String>,
    pub upgrade_installer: bool,
    pub workdir: String,
    pub install: InstallSpec,
    pub expose: Vec<u16>,
    pub command: DefaultCommand,
    pub secret_mode: SecretMode,
    pub labels: BTreeMap<String, String>,
}

impl Default for Recipe {
    fn default() -> Self {
        Self {
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            args: ArgSet::new(vec![
                ArgSpec::new("GITHUB_TOKEN")
                    .secret()
                    .required()
                    .from_env("GITHUB_TOKEN"),
                ArgSpec::new("PYPI_URL").with_default(DEFAULT_INDEX_URL),
            ]),
            system_packages: vec!["git".to_string(), "procps".to_string()],
            upgrade_installer: true,
            workdir: DEFAULT_WORKDIR.to_string(),
            install: InstallSpec::default(),
            expose: vec![DEFAULT_PORT],
            command: DefaultCommand::Idle,
            secret_mode: SecretMode::Mount,
            labels: BTreeMap::new(),
        }
    }
}

impl Recipe {
    pub fn steps(&self) -> &'static [RecipeStep] {
        &RecipeStep::ALL
    }

    pub fn exposed_ports(&self) -> BTreeSet<ExposedPort> {
        self.expose.iter().copied().map(ExposedPort::tcp).collect()
    }

    /// True when the index URL must travel through a secret mount.
    fn index_via_secret(&self) -> bool {
        self.secret_mode == SecretMode::Mount
            && self
                .install
                .index_arg
                .as_deref()
                .is_some_and(|arg| self.args.is_sensitive(arg))
    }

    /// BuildKit secret id for the index URL (mount mode only).
    pub fn index_secret_id(&self) -> Option<String> {
        if !self.index_via_secret() {
            return None;
        }
        self.install.index_arg.as_deref().map(str::to_ascii_lowercase)
    }

    /// Args that are written as `ARG` instructions and passed as build args.
    pub fn rendered_args(&self) -> Vec<&ArgSpec> {
        self.args
            .specs()
            .iter()
            .filter(|spec| {
                self.secret_mode == SecretMode::BuildArg || !self.args.is_sensitive(&spec.name)
            })
            .collect()
    }

    /// Labels attached to the image, including the derived ones.
    pub fn effective_labels(&self, inputs: &RenderInputs<'_>) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();

        let entrypoint = match self.command {
            DefaultCommand::Idle => "placeholder",
            DefaultCommand::Exec(_) => "service",
        };
        labels.insert(LABEL_ENTRYPOINT.to_string(), entrypoint.to_string());

        if let Some(digest) = inputs.context_digest {
            labels.insert(LABEL_CONTEXT_DIGEST.to_string(), digest.to_string());
        }
        if let Some(project) = inputs.project {
            labels.insert(LABEL_TITLE.to_string(), project.name.clone());
            if let Some(version) = &project.version {
                labels.insert(LABEL_VERSION.to_string(), version.clone());
            }
        }

        labels
    }

    pub fn render(&self, inputs: &RenderInputs<'_>) -> String {
        let blocks: Vec<String> = self
            .steps()
            .iter()
            .map(|step| self.render_step(*step, inputs))
            .filter(|block| !block.is_empty())
            .collect();
        blocks.join("\n")
    }

    pub fn render_step(&self, step: RecipeStep, inputs: &RenderInputs<'_>) -> String {
        let mut out = String::new();
        match step {
            RecipeStep::Base => {
                if self.secret_mode == SecretMode::Mount {
                    out.push_str("# syntax=docker/dockerfile:1\n");
                }
                let _ = writeln!(out, "FROM {}", self.base_image);
            }
            RecipeStep::Args => {
                for spec in self.rendered_args() {
                    match &spec.default {
                        Some(default) => {
                            let _ = writeln!(out, "ARG {}={}", spec.name, quote_if_needed(default));
                        }
                        None => {
                            let _ = writeln!(out, "ARG {}", spec.name);
                        }
                    }
                }
            }
            RecipeStep::SystemPackages => {
                if !self.system_packages.is_empty() {
                    let _ = writeln!(out, "RUN apt-get update \\");
                    let _ = writeln!(
                        out,
                        "    && apt-get install -y --no-install-recommends {} \\",
                        self.system_packages.join(" ")
                    );
                    let _ = writeln!(out, "    && rm -rf /var/lib/apt/lists/*");
                }
            }
            RecipeStep::UpgradeInstaller => {
                if self.upgrade_installer {
                    out.push_str("RUN python -m pip install --upgrade pip\n");
                }
            }
            RecipeStep::StageSource => {
                let _ = writeln!(out, "COPY . {}", self.workdir);
                let _ = writeln!(out, "WORKDIR {}", self.workdir);
            }
            RecipeStep::InstallApplication => {
                let install = if self.install.editable {
                    format!("python -m pip install -e {}", self.install.target)
                } else {
                    format!("python -m pip install {}", self.install.target)
                };

                match (&self.install.index_arg, self.index_secret_id()) {
                    (Some(_), Some(id)) => {
                        // 秘密只在這一個 RUN 指令中可見；缺少時退回公開索引
                        let _ = writeln!(out, "RUN --mount=type=secret,id={} \\", id);
                        let _ = writeln!(
                            out,
                            "    if [ -f /run/secrets/{id} ]; then export PIP_EXTRA_INDEX_URL=\"$(cat /run/secrets/{id})\"; fi \\"
                        );
                        let _ = writeln!(out, "    && {}", install);
                    }
                    (Some(arg), None) if inputs.index_enabled => {
                        let _ = writeln!(out, "RUN {} --extra-index-url ${{{}}}", install, arg);
                    }
                    _ => {
                        let _ = writeln!(out, "RUN {}", install);
                    }
                }
            }
            RecipeStep::Expose => {
                for port in &self.expose {
                    let _ = writeln!(out, "EXPOSE {}", port);
                }
            }
            RecipeStep::DefaultCommand => {
                for (key, value) in self.effective_labels(inputs) {
                    let _ = writeln!(out, "LABEL {}={}", key, json_string(&value));
                }
                let _ = writeln!(out, "CMD {}", exec_form(&self.command.argv()));
            }
        }
        out
    }
}

impl Validate for Recipe {
    fn validate(&self) -> Result<()> {
        validate_pinned_image("image.base", &self.base_image)?;
        self.args.validate()?;
        validate_package_names("system.packages", &self.system_packages)?;
        validate_absolute_container_path("image.workdir", &self.workdir)?;

        validate_non_empty_string("install.target", &self.install.target)?;
        if self.install.target.chars().any(char::is_whitespace) {
            return Err(BuildError::InvalidConfigValueError {
                field: "install.target".to_string(),
                value: self.install.target.clone(),
                reason: "Install target cannot contain whitespace".to_string(),
            });
        }

        if let Some(index_arg) = &self.install.index_arg {
            let spec = self.args.get(index_arg).ok_or_else(|| BuildError::InvalidConfigValueError {
                field: "install.index_arg".to_string(),
                value: index_arg.clone(),
                reason: "Index argument is not declared in [[args]]".to_string(),
            })?;
            if let Some(default) = &spec.default {
                validate_url_template(&format!("args.{}.default", spec.name), default)?;
            }
        }

        for port in &self.expose {
            validate_range("image.expose", *port, 1, u16::MAX)?;
        }
        let ports: Vec<String> = self.expose.iter().map(u16::to_string).collect();
        validate_unique("image.expose", ports.iter().map(String::as_str))?;

        if let DefaultCommand::Exec(argv) = &self.command {
            if argv.is_empty() || argv[0].trim().is_empty() {
                return Err(BuildError::MissingConfigError {
                    field: "runtime.exec".to_string(),
                });
            }
        }

        for key in self.labels.keys() {
            validate_non_empty_string("image.labels", key)?;
        }

        Ok(())
    }
}

fn json_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn exec_form(argv: &[String]) -> String {
    let items: Vec<String> = argv.iter().map(|a| json_string(a)).collect();
    format!("[{}]", items.join(", "))
}

fn quote_if_needed(value: &str) -> String {
    if value.chars().any(|c| c.is_whitespace() || c == '"') {
        json_string(value)
    } else {
        value.to_string()
    }
}
