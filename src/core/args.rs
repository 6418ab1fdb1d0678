use crate::domain::model::Secret;
use crate::utils::error::{BuildError, Result};
use crate::utils::validation::{validate_arg_name, validate_unique};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

fn reference_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

/// 建置參數宣告（對應 Dockerfile 的 ARG）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub secret: bool,
    #[serde(default)]
    pub required: bool,
    /// Environment variable the value is read from when not given on the command line.
    #[serde(default)]
    pub env: Option<String>,
}

impl ArgSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            secret: false,
            required: false,
            env: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn from_env(mut self, var: impl Into<String>) -> Self {
        self.env = Some(var.into());
        self
    }

    /// Names referenced as `${NAME}` in the default value.
    pub fn references(&self) -> Vec<String> {
        self.default
            .as_deref()
            .map(|default| {
                reference_pattern()
                    .captures_iter(default)
                    .map(|caps| caps[1].to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Values supplied for a build, before defaults and interpolation.
#[derive(Debug, Clone, Default)]
pub struct SuppliedArgs {
    values: BTreeMap<String, Secret>,
}

impl SuppliedArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), Secret::new(value));
    }

    pub fn get(&self, name: &str) -> Option<&Secret> {
        self.values.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// 收集參數值：命令列 `NAME=VALUE` 優先，其次是宣告的環境變數
    pub fn collect<F>(specs: &[ArgSpec], cli_pairs: &[String], env_lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut supplied = Self::new();

        for spec in specs {
            if let Some(var) = &spec.env {
                if let Some(value) = env_lookup(var) {
                    tracing::debug!("Build argument {} taken from environment variable {}", spec.name, var);
                    supplied.insert(spec.name.clone(), value);
                }
            }
        }

        for pair in cli_pairs {
            let (name, value) = parse_build_arg(pair)?;
            if !specs.iter().any(|s| s.name == name) {
                tracing::warn!("⚠️ Build argument {} is not declared by the recipe and will be ignored", name);
                continue;
            }
            supplied.insert(name, value);
        }

        Ok(supplied)
    }
}

/// Parses a `NAME=VALUE` pair as given to `--build-arg`.
pub fn parse_build_arg(pair: &str) -> Result<(String, String)> {
    let (name, value) = pair.split_once('=').ok_or_else(|| BuildError::InvalidConfigValueError {
        field: "build-arg".to_string(),
        value: pair.split('=').next().unwrap_or_default().to_string(),
        reason: "Expected NAME=VALUE".to_string(),
    })?;
    validate_arg_name("build-arg", name)?;
    Ok((name.to_string(), value.to_string()))
}

#[derive(Debug, Clone)]
pub struct ResolvedArg {
    pub value: Secret,
    pub sensitive: bool,
}

/// Build arguments after defaults and interpolation, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ResolvedArgs {
    values: Vec<(String, ResolvedArg)>,
    dropped: BTreeSet<String>,
}

impl ResolvedArgs {
    pub fn get(&self, name: &str) -> Option<&ResolvedArg> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResolvedArg)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Args left unresolved because a secret they need was not supplied.
    pub fn is_dropped(&self, name: &str) -> bool {
        self.dropped.contains(name)
    }

    pub fn dropped(&self) -> impl Iterator<Item = &str> {
        self.dropped.iter().map(String::as_str)
    }

    /// 所有敏感值，用於遮蔽與外洩檢查
    pub fn sensitive_values(&self) -> Vec<String> {
        self.values
            .iter()
            .filter(|(_, v)| v.sensitive && !v.value.is_empty())
            .map(|(_, v)| v.value.expose().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgSet {
    specs: Vec<ArgSpec>,
}

impl ArgSet {
    pub fn new(specs: Vec<ArgSpec>) -> Self {
        Self { specs }
    }

    pub fn specs(&self) -> &[ArgSpec] {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<&ArgSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// An arg is sensitive when declared secret or when its default
    /// interpolates a sensitive arg.
    pub fn is_sensitive(&self, name: &str) -> bool {
        let Some(spec) = self.get(name) else {
            return false;
        };
        if spec.secret {
            return true;
        }
        let position = self.specs.iter().position(|s| s.name == name).unwrap_or(0);
        spec.references().iter().any(|r| {
            // 只看先前宣告的參數，避免循環
            self.specs[..position].iter().any(|s| &s.name == r) && self.is_sensitive(r)
        })
    }

    pub fn validate(&self) -> Result<()> {
        validate_unique("args.name", self.specs.iter().map(|s| s.name.as_str()))?;

        for (index, spec) in self.specs.iter().enumerate() {
            validate_arg_name("args.name", &spec.name)?;

            for reference in spec.references() {
                let declared_before = self.specs[..index].iter().any(|s| s.name == reference);
                if !declared_before {
                    return Err(BuildError::InvalidConfigValueError {
                        field: format!("args.{}.default", spec.name),
                        value: format!("${{{}}}", reference),
                        reason: "Only build arguments declared earlier can be referenced".to_string(),
                    });
                }
            }

            if spec.required && spec.default.is_some() {
                tracing::debug!("Build argument {} is required but has a default; the default satisfies it", spec.name);
            }
        }

        Ok(())
    }

    pub fn resolve(&self, supplied: &SuppliedArgs, allow_missing_secrets: bool) -> Result<ResolvedArgs> {
        let mut resolved = ResolvedArgs::default();

        for spec in &self.specs {
            let sensitive = self.is_sensitive(&spec.name);

            if let Some(value) = supplied.get(&spec.name) {
                resolved.values.push((
                    spec.name.clone(),
                    ResolvedArg {
                        value: value.clone(),
                        sensitive,
                    },
                ));
                continue;
            }

            if let Some(default) = &spec.default {
                let references = spec.references();
                if let Some(missing) = references.iter().find(|r| resolved.dropped.contains(*r)) {
                    tracing::warn!(
                        "⚠️ Build argument {} depends on unavailable secret {}; it will not be set",
                        spec.name,
                        missing
                    );
                    resolved.dropped.insert(spec.name.clone());
                    continue;
                }

                let value = reference_pattern().replace_all(default, |caps: &regex::Captures| {
                    match resolved.get(&caps[1]) {
                        Some(arg) => arg.value.expose().to_string(),
                        None => {
                            tracing::warn!(
                                "⚠️ Build argument {} references unset {}; substituting an empty string",
                                spec.name,
                                &caps[1]
                            );
                            String::new()
                        }
                    }
                });

                resolved.values.push((
                    spec.name.clone(),
                    ResolvedArg {
                        value: Secret::new(value.into_owned()),
                        sensitive,
                    },
                ));
                continue;
            }

            if spec.required {
                if spec.secret && allow_missing_secrets {
                    tracing::warn!(
                        "⚠️ Secret build argument {} not supplied; continuing without private index access",
                        spec.name
                    );
                    resolved.dropped.insert(spec.name.clone());
                    continue;
                }
                return Err(BuildError::MissingBuildArgError {
                    name: spec.name.clone(),
                });
            }
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakwater_args() -> ArgSet {
        ArgSet::new(vec![
            ArgSpec::new("GITHUB_TOKEN").secret().required().from_env("GITHUB_TOKEN"),
            ArgSpec::new("PYPI_URL").with_default("https://${GITHUB_TOKEN}@pypi.data.vanoord.com/"),
        ])
    }

    #[test]
    fn test_default_interpolates_supplied_token() {
        let args = breakwater_args();
        let mut supplied = SuppliedArgs::new();
        supplied.insert("GITHUB_TOKEN", "ghp_secret");

        let resolved = args.resolve(&supplied, false).unwrap();

        assert_eq!(resolved.len(), 2);
        let url = resolved.get("PYPI_URL").unwrap();
        assert_eq!(url.value.expose(), "https://ghp_secret@pypi.data.vanoord.com/");
        assert!(url.sensitive);
        assert_eq!(
            resolved.sensitive_values(),
            vec!["ghp_secret".to_string(), "https://ghp_secret@pypi.data.vanoord.com/".to_string()]
        );
    }

    #[test]
    fn test_missing_required_token_fails() {
        let args = breakwater_args();
        let err = args.resolve(&SuppliedArgs::new(), false).unwrap_err();
        assert!(matches!(err, BuildError::MissingBuildArgError { name } if name == "GITHUB_TOKEN"));
    }

    #[test]
    fn test_missing_token_allowed_drops_dependents() {
        let args = breakwater_args();
        let resolved = args.resolve(&SuppliedArgs::new(), true).unwrap();

        assert!(resolved.is_empty());
        assert!(resolved.is_dropped("GITHUB_TOKEN"));
        assert!(resolved.is_dropped("PYPI_URL"));
    }

    #[test]
    fn test_supplied_value_overrides_default() {
        let args = breakwater_args();
        let mut supplied = SuppliedArgs::new();
        supplied.insert("GITHUB_TOKEN", "t");
        supplied.insert("PYPI_URL", "https://mirror.example.com/simple");

        let resolved = args.resolve(&supplied, false).unwrap();
        let url = resolved.get("PYPI_URL").unwrap();
        assert_eq!(url.value.expose(), "https://mirror.example.com/simple");
        assert!(url.sensitive);
    }

    #[test]
    fn test_optional_reference_substitutes_empty() {
        let args = ArgSet::new(vec![
            ArgSpec::new("SUFFIX"),
            ArgSpec::new("NAME").with_default("app${SUFFIX}"),
        ]);
        let resolved = args.resolve(&SuppliedArgs::new(), false).unwrap();
        assert_eq!(resolved.get("NAME").unwrap().value.expose(), "app");
        assert!(!resolved.get("NAME").unwrap().sensitive);
    }

    #[test]
    fn test_validate_rejects_forward_reference() {
        let args = ArgSet::new(vec![
            ArgSpec::new("PYPI_URL").with_default("https://${GITHUB_TOKEN}@host/"),
            ArgSpec::new("GITHUB_TOKEN").secret(),
        ]);
        assert!(args.validate().is_err());
        assert!(!args.is_sensitive("PYPI_URL"));
    }

    #[test]
    fn test_collect_prefers_cli_over_env() {
        let specs = breakwater_args().specs().to_vec();
        let cli = vec!["GITHUB_TOKEN=from-cli".to_string(), "UNKNOWN=1".to_string()];
        let supplied = SuppliedArgs::collect(&specs, &cli, |var| {
            (var == "GITHUB_TOKEN").then(|| "from-env".to_string())
        })
        .unwrap();

        assert_eq!(supplied.get("GITHUB_TOKEN").unwrap().expose(), "from-cli");
        assert!(supplied.get("UNKNOWN").is_none());
    }

    #[test]
    fn test_parse_build_arg() {
        assert_eq!(
            parse_build_arg("PYPI_URL=https://a=b").unwrap(),
            ("PYPI_URL".to_string(), "https://a=b".to_string())
        );
        assert!(parse_build_arg("NOVALUE").is_err());
        assert!(parse_build_arg("bad-name=1").is_err());
    }
}
