use crate::domain::model::ProjectInfo;
use crate::utils::error::{BuildError, Result};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// 預設忽略規則（與 .dockerignore 語意一致，以 context 根目錄為基準）
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    ".git",
    ".venv",
    ".env",
    ".pytest_cache",
    "**/__pycache__",
    "**/*.pyc",
    "*.egg-info",
    "build",
    "dist",
    "Dockerfile",
    ".dockerignore",
];

#[derive(Debug, Clone)]
struct IgnoreRule {
    pattern: String,
    regex: Regex,
    negated: bool,
}

impl IgnoreRule {
    fn parse(raw: &str) -> Result<Option<Self>> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(None);
        }

        let (negated, body) = match trimmed.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, trimmed),
        };
        let body = body.trim_start_matches("./").trim_start_matches('/').trim_end_matches('/');
        if body.is_empty() {
            return Ok(None);
        }

        let regex = Regex::new(&glob_to_regex(body)).map_err(|e| BuildError::InvalidConfigValueError {
            field: "context.ignore".to_string(),
            value: raw.to_string(),
            reason: format!("Invalid ignore pattern: {}", e),
        })?;

        Ok(Some(Self {
            pattern: trimmed.to_string(),
            regex,
            negated,
        }))
    }

    /// A rule matching a directory also matches everything beneath it.
    fn matches(&self, relative: &str) -> bool {
        if self.regex.is_match(relative) {
            return true;
        }
        relative
            .match_indices('/')
            .any(|(index, _)| self.regex.is_match(&relative[..index]))
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    regex.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    regex.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => regex.push_str("[^/]*"),
            '?' => regex.push_str("[^/]"),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    regex.push('$');
    regex
}

#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    rules: Vec<IgnoreRule>,
}

impl IgnoreRules {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();
        for pattern in patterns {
            if let Some(rule) = IgnoreRule::parse(pattern.as_ref())? {
                rules.push(rule);
            }
        }
        Ok(Self { rules })
    }

    pub fn with_defaults(extra: &[String]) -> Result<Self> {
        let patterns = DEFAULT_IGNORE_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(extra.iter().cloned());
        Self::new(patterns)
    }

    /// 讀取既有的 .dockerignore
    pub fn from_dockerignore(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::new(content.lines())
    }

    pub fn extend(&mut self, other: IgnoreRules) {
        self.rules.extend(other.rules);
    }

    /// Last matching rule wins, so a later `!pattern` re-includes a path.
    pub fn is_ignored(&self, relative: &str) -> bool {
        let mut ignored = false;
        for rule in &self.rules {
            if rule.matches(relative) {
                ignored = !rule.negated;
            }
        }
        ignored
    }

    fn has_negations(&self) -> bool {
        self.rules.iter().any(|r| r.negated)
    }

    pub fn patterns(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.pattern.as_str()).collect()
    }

    pub fn to_dockerignore(&self) -> String {
        let mut out = String::from("# Generated by breakwater-image\n");
        for pattern in self.patterns() {
            out.push_str(pattern);
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceEntry {
    pub path: String,
    pub size: u64,
}

/// The build context as Docker will receive it.
#[derive(Debug, Clone, Serialize)]
pub struct SourceTree {
    pub root: PathBuf,
    pub entries: Vec<SourceEntry>,
    pub total_bytes: u64,
    /// SHA-256 over sorted `(path, content)` pairs.
    pub digest: String,
    pub project: Option<ProjectInfo>,
}

fn context_error(path: &Path, message: impl Into<String>) -> BuildError {
    BuildError::ContextError {
        path: path.display().to_string(),
        message: message.into(),
    }
}

impl SourceTree {
    pub fn scan(root: &Path, rules: &IgnoreRules) -> Result<Self> {
        if !root.is_dir() {
            return Err(context_error(root, "Build context is not a readable directory"));
        }

        let prune = !rules.has_negations();
        let mut hasher = Sha256::new();
        let mut entries = Vec::new();
        let mut total_bytes = 0u64;

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if !prune || entry.depth() == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                relative_path(root, entry.path())
                    .map(|rel| !rules.is_ignored(&rel))
                    .unwrap_or(true)
            });

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                context_error(&path, e.to_string())
            })?;

            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }

            let Some(relative) = relative_path(root, entry.path()) else {
                continue;
            };
            if rules.is_ignored(&relative) {
                continue;
            }

            let content = if file_type.is_symlink() {
                let target = fs::read_link(entry.path()).map_err(|e| context_error(entry.path(), e.to_string()))?;
                target.to_string_lossy().into_owned().into_bytes()
            } else {
                fs::read(entry.path()).map_err(|e| context_error(entry.path(), e.to_string()))?
            };

            hasher.update(relative.as_bytes());
            hasher.update([0u8]);
            hasher.update((content.len() as u64).to_le_bytes());
            hasher.update(&content);

            total_bytes += content.len() as u64;
            entries.push(SourceEntry {
                path: relative,
                size: content.len() as u64,
            });
        }

        let project = detect_project(root)?;

        Ok(Self {
            root: root.to_path_buf(),
            entries,
            total_bytes,
            digest: hex::encode(hasher.finalize()),
            project,
        })
    }

    pub fn contains(&self, relative: &str) -> bool {
        self.entries.iter().any(|e| e.path == relative)
    }

    /// An editable install needs a Python project manifest in the context.
    pub fn require_project(&self) -> Result<&ProjectInfo> {
        self.project.as_ref().ok_or_else(|| {
            context_error(
                &self.root,
                "No pyproject.toml, setup.py or setup.cfg found; nothing to install",
            )
        })
    }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// 從 pyproject.toml / setup.cfg / setup.py 偵測套件名稱與版本
pub fn detect_project(root: &Path) -> Result<Option<ProjectInfo>> {
    let mut found: Option<ProjectInfo> = None;

    let pyproject = root.join("pyproject.toml");
    if pyproject.is_file() {
        let content = fs::read_to_string(&pyproject)?;
        let value: toml::Value = toml::from_str(&content).map_err(|e| {
            context_error(&pyproject, format!("pyproject.toml is not valid TOML: {}", e))
        })?;

        let table = value
            .get("project")
            .or_else(|| value.get("tool").and_then(|t| t.get("poetry")));
        let name = table.and_then(|t| t.get("name")).and_then(|v| v.as_str());
        let version = table.and_then(|t| t.get("version")).and_then(|v| v.as_str());

        if let Some(name) = name {
            found = Some(ProjectInfo {
                name: name.to_string(),
                version: version.map(str::to_string),
                manifest: "pyproject.toml".to_string(),
            });
        }
    }

    if found.is_none() {
        for manifest in ["setup.cfg", "setup.py"] {
            let path = root.join(manifest);
            if !path.is_file() {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            let name_re = if manifest == "setup.cfg" {
                Regex::new(r#"(?m)^\s*name\s*=\s*([A-Za-z0-9._\-]+)\s*$"#).unwrap()
            } else {
                Regex::new(r#"name\s*=\s*["']([A-Za-z0-9._\-]+)["']"#).unwrap()
            };
            let version_re = if manifest == "setup.cfg" {
                Regex::new(r#"(?m)^\s*version\s*=\s*([A-Za-z0-9._+\-]+)\s*$"#).unwrap()
            } else {
                Regex::new(r#"version\s*=\s*["']([A-Za-z0-9._+\-]+)["']"#).unwrap()
            };

            let name = name_re
                .captures(&content)
                .map(|c| c[1].to_string())
                .unwrap_or_else(|| {
                    root.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "unknown".to_string())
                });
            let version = version_re.captures(&content).map(|c| c[1].to_string());

            found = Some(ProjectInfo {
                name,
                version,
                manifest: manifest.to_string(),
            });
            break;
        }
    }

    if let Some(project) = found.as_mut() {
        if project.version.is_none() {
            project.version = package_dunder_version(root, &project.name)?;
        }
    }

    Ok(found)
}

/// Reads `__version__ = "..."` from the package's `__init__.py`.
fn package_dunder_version(root: &Path, name: &str) -> Result<Option<String>> {
    let module = name.replace('-', "_");
    let version_re = Regex::new(r#"(?m)^__version__\s*=\s*["']([^"']+)["']"#).unwrap();

    for candidate in [root.join(&module), root.join("src").join(&module)] {
        let init = candidate.join("__init__.py");
        if init.is_file() {
            let content = fs::read_to_string(&init)?;
            if let Some(caps) = version_re.captures(&content) {
                return Ok(Some(caps[1].to_string()));
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_to_regex() {
        assert_eq!(glob_to_regex("*.pyc"), "^[^/]*\\.pyc$");
        assert_eq!(glob_to_regex("**/__pycache__"), "^(?:.*/)?__pycache__$");
    }

    #[test]
    fn test_ignore_rules_match_dockerignore_semantics() {
        let rules = IgnoreRules::with_defaults(&["docs/*.md".to_string(), "!docs/keep.md".to_string()]).unwrap();

        assert!(rules.is_ignored(".git"));
        assert!(rules.is_ignored(".git/config"));
        assert!(rules.is_ignored("breakwater/__pycache__/core.cpython-310.pyc"));
        assert!(rules.is_ignored("breakwater/core/stability.pyc"));
        assert!(rules.is_ignored("breakwater.egg-info/PKG-INFO"));
        assert!(rules.is_ignored("docs/readme.md"));
        assert!(!rules.is_ignored("docs/keep.md"));
        assert!(!rules.is_ignored("breakwater/__init__.py"));
        assert!(!rules.is_ignored("setup.py"));
    }

    #[test]
    fn test_dockerignore_rendering_skips_comments() {
        let rules = IgnoreRules::new(["# comment", "", ".git", "!keep"]).unwrap();
        assert_eq!(rules.patterns(), vec![".git", "!keep"]);
        assert_eq!(
            rules.to_dockerignore(),
            "# Generated by breakwater-image\n.git\n!keep\n"
        );
    }

    #[test]
    fn test_detect_project_from_pyproject() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(
            dir.path().join("pyproject.toml"),
            "[project]\nname = \"breakwater\"\nversion = \"1.0.2\"\n",
        )
        .unwrap();

        let project = detect_project(dir.path()).unwrap().unwrap();
        assert_eq!(project.name, "breakwater");
        assert_eq!(project.version.as_deref(), Some("1.0.2"));
        assert_eq!(project.manifest, "pyproject.toml");
    }

    #[test]
    fn test_detect_project_falls_back_to_dunder_version() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("setup.cfg"), "[metadata]\nname = breakwater\n").unwrap();
        fs::create_dir_all(dir.path().join("src/breakwater")).unwrap();
        fs::write(dir.path().join("src/breakwater/__init__.py"), "__version__ = 'v1.0.2e'\n").unwrap();

        let project = detect_project(dir.path()).unwrap().unwrap();
        assert_eq!(project.name, "breakwater");
        assert_eq!(project.version.as_deref(), Some("v1.0.2e"));
    }

    #[test]
    fn test_scan_without_manifest_has_no_project() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("notes.txt"), "hs = 2.5").unwrap();

        let tree = SourceTree::scan(dir.path(), &IgnoreRules::with_defaults(&[]).unwrap()).unwrap();
        assert_eq!(tree.entries.len(), 1);
        assert!(tree.require_project().is_err());
    }
}
