use anyhow::Result;
use breakwater_image::core::recipe::{RenderInputs, DEFAULT_PORT};
use breakwater_image::core::source::{IgnoreRules, SourceTree};
use breakwater_image::utils::validation::Validate;
use breakwater_image::{Recipe, RecipeConfig, SecretMode};
use std::path::Path;
use tempfile::TempDir;

fn write(root: &Path, relative: &str, content: &str) -> Result<()> {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

fn create_project(root: &Path) -> Result<()> {
    write(root, "setup.py", "from setuptools import setup\n\nsetup(name=\"breakwater\")\n")?;
    write(root, "breakwater/__init__.py", "__version__ = \"v1.0.2e\"\n")?;
    write(root, "breakwater/core/overtopping.py", "Q = 0.2\n")?;
    Ok(())
}

#[test]
fn test_identical_context_yields_identical_digest() -> Result<()> {
    let first = TempDir::new()?;
    let second = TempDir::new()?;
    create_project(first.path())?;
    create_project(second.path())?;

    // 被忽略的檔案不影響摘要
    write(second.path(), ".git/HEAD", "ref: refs/heads/main\n")?;
    write(second.path(), "breakwater/__pycache__/core.cpython-310.pyc", "\u{1}")?;

    let rules = IgnoreRules::with_defaults(&[])?;
    let a = SourceTree::scan(first.path(), &rules)?;
    let b = SourceTree::scan(second.path(), &rules)?;

    assert_eq!(a.digest, b.digest);
    assert_eq!(a.entries.len(), 3);
    assert!(b.contains("breakwater/core/overtopping.py"));
    assert!(!b.contains(".git/HEAD"));

    write(second.path(), "breakwater/core/overtopping.py", "Q = 0.3\n")?;
    let changed = SourceTree::scan(second.path(), &rules)?;
    assert_ne!(a.digest, changed.digest);
    Ok(())
}

#[test]
fn test_render_is_byte_identical_for_same_inputs() -> Result<()> {
    let context = TempDir::new()?;
    create_project(context.path())?;
    let tree = SourceTree::scan(context.path(), &IgnoreRules::with_defaults(&[])?)?;

    for mode in [SecretMode::Mount, SecretMode::BuildArg] {
        let mut recipe = Recipe::default();
        recipe.secret_mode = mode;
        let inputs = RenderInputs {
            context_digest: Some(&tree.digest),
            project: tree.project.as_ref(),
            index_enabled: true,
        };

        let first = recipe.render(&inputs);
        let second = recipe.render(&inputs);
        assert_eq!(first, second);
        assert!(first.contains(&tree.digest));
        assert!(first.contains("CMD [\"tail\", \"-f\", \"/dev/null\"]"));
        assert!(first.contains(&format!("EXPOSE {}", DEFAULT_PORT)));
    }
    Ok(())
}

#[test]
fn test_render_orders_layers_for_caching() -> Result<()> {
    let dockerfile = Recipe::default().render(&RenderInputs::default());

    let position = |needle: &str| dockerfile.find(needle).unwrap_or(usize::MAX);
    let from = position("FROM python:3.10-slim");
    let packages = position("apt-get install -y --no-install-recommends git procps");
    let upgrade = position("pip install --upgrade pip");
    let copy = position("COPY . /breakwater");
    let install = position("python -m pip install -e .");
    let expose = position("EXPOSE 8888");
    let cmd = position("CMD [");

    assert!(from < packages);
    assert!(packages < upgrade);
    assert!(upgrade < copy);
    assert!(copy < install);
    assert!(install < expose);
    assert!(expose < cmd);
    Ok(())
}

#[test]
fn test_config_file_drives_recipe() -> Result<()> {
    let dir = TempDir::new()?;
    let config_path = dir.path().join("breakwater.toml");
    std::fs::write(
        &config_path,
        r#"
[image]
name = "breakwater"
tag = "v1.0.2e"
secret_mode = "build-arg"

[runtime]
exec = ["python", "-m", "breakwater"]
"#,
    )?;

    let config = RecipeConfig::from_file(&config_path)?;
    config.validate()?;
    let recipe = config.into_recipe();

    assert_eq!(config.image_tag(), "breakwater:v1.0.2e");
    assert_eq!(recipe.secret_mode, SecretMode::BuildArg);

    let dockerfile = recipe.render(&RenderInputs::default());
    assert!(dockerfile.contains("CMD [\"python\", \"-m\", \"breakwater\"]"));
    assert!(dockerfile.contains("LABEL org.breakwater.entrypoint=\"service\""));
    Ok(())
}
