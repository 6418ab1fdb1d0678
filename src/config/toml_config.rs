use crate::core::args::{ArgSet, ArgSpec};
use crate::core::recipe::{
    DefaultCommand, InstallSpec, Recipe, SecretMode, DEFAULT_BASE_IMAGE, DEFAULT_PORT, DEFAULT_WORKDIR,
};
use crate::utils::error::{BuildError, Result};
use crate::utils::validation::{validate_non_empty_string, validate_path, Validate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

pub const DEFAULT_CONFIG_FILE: &str = "breakwater.toml";

/// `breakwater.toml`：所有欄位皆可省略，預設值即為內建配方
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipeConfig {
    pub image: ImageConfig,
    /// Omitted means the default `GITHUB_TOKEN` / `PYPI_URL` pair.
    pub args: Option<Vec<ArgSpec>>,
    pub system: SystemConfig,
    pub install: InstallConfig,
    pub context: ContextConfig,
    pub runtime: RuntimeConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub name: String,
    pub tag: String,
    pub base: String,
    pub workdir: String,
    pub expose: Vec<u16>,
    pub secret_mode: SecretMode,
    pub labels: BTreeMap<String, String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            name: "breakwater".to_string(),
            tag: "dev".to_string(),
            base: DEFAULT_BASE_IMAGE.to_string(),
            workdir: DEFAULT_WORKDIR.to_string(),
            expose: vec![DEFAULT_PORT],
            secret_mode: SecretMode::default(),
            labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub packages: Vec<String>,
    pub upgrade_installer: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            packages: vec!["git".to_string(), "procps".to_string()],
            upgrade_installer: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    pub target: String,
    pub editable: bool,
    /// Build argument carrying the extra index URL; an empty string disables the private index.
    pub index_arg: String,
}

impl Default for InstallConfig {
    fn default() -> Self {
        let spec = InstallSpec::default();
        Self {
            target: spec.target,
            editable: spec.editable,
            index_arg: spec.index_arg.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub path: String,
    pub ignore: Vec<String>,
    pub write_dockerignore: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            path: ".".to_string(),
            ignore: Vec::new(),
            write_dockerignore: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Exec-form default command. Omitted keeps the idle placeholder.
    pub exec: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: "./build".to_string(),
        }
    }
}

fn env_placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{env:([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

impl RecipeConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| BuildError::ConfigError {
            message: format!("cannot read {}: {}", path.as_ref().display(), e),
        })?;
        Self::from_toml_str(&content)
    }

    /// 讀取檔案；檔案不存在時使用預設配方
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::info!("📄 {} not found, using the built-in recipe", path.display());
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content);
        let config = toml::from_str(&processed_content)?;
        Ok(config)
    }

    /// 替換 `${env:NAME}`；一般的 `${NAME}` 保留給建置參數插值
    fn substitute_env_vars(content: &str) -> String {
        env_placeholder()
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                std::env::var(var_name).unwrap_or_else(|_| {
                    tracing::warn!("⚠️ Environment variable {} is not set; placeholder kept", var_name);
                    caps[0].to_string()
                })
            })
            .into_owned()
    }

    pub fn image_tag(&self) -> String {
        format!("{}:{}", self.image.name, self.image.tag)
    }

    pub fn context_path(&self) -> &str {
        &self.context.path
    }

    pub fn output_dir(&self) -> &str {
        &self.output.dir
    }

    pub fn into_recipe(&self) -> Recipe {
        let defaults = Recipe::default();
        let args = match &self.args {
            Some(specs) => ArgSet::new(specs.clone()),
            None => defaults.args,
        };
        let index_arg = Some(self.install.index_arg.trim())
            .filter(|arg| !arg.is_empty())
            .map(str::to_string);
        let command = match &self.runtime.exec {
            Some(argv) => DefaultCommand::Exec(argv.clone()),
            None => DefaultCommand::Idle,
        };

        Recipe {
            base_image: self.image.base.clone(),
            args,
            system_packages: self.system.packages.clone(),
            upgrade_installer: self.system.upgrade_installer,
            workdir: self.image.workdir.clone(),
            install: InstallSpec {
                target: self.install.target.clone(),
                editable: self.install.editable,
                index_arg,
            },
            expose: self.image.expose.clone(),
            command,
            secret_mode: self.image.secret_mode,
            labels: self.image.labels.clone(),
        }
    }
}

impl Validate for RecipeConfig {
    fn validate(&self) -> Result<()> {
        validate_non_empty_string("image.name", &self.image.name)?;
        validate_non_empty_string("image.tag", &self.image.tag)?;
        validate_path("context.path", &self.context.path)?;
        validate_path("output.dir", &self.output.dir)?;
        self.into_recipe().validate()
    }
}
