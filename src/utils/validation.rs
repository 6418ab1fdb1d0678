use crate::utils::error::{BuildError, Result};
use regex::Regex;
use std::collections::HashSet;
use url::Url;

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

fn invalid(field_name: &str, value: &str, reason: impl Into<String>) -> BuildError {
    BuildError::InvalidConfigValueError {
        field: field_name.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// 驗證 URL 樣板；`${NAME}` 佔位符以虛擬值代入後再解析
pub fn validate_url_template(field_name: &str, template: &str) -> Result<()> {
    if template.trim().is_empty() {
        return Err(invalid(field_name, template, "URL cannot be empty"));
    }

    let placeholder = Regex::new(r"\$\{[^}]*\}").unwrap();
    let sample = placeholder.replace_all(template, "placeholder");

    match Url::parse(&sample) {
        Ok(url) => match url.scheme() {
            "http" | "https" => Ok(()),
            scheme => Err(invalid(
                field_name,
                template,
                format!("Unsupported URL scheme: {}", scheme),
            )),
        },
        Err(e) => Err(invalid(
            field_name,
            template,
            format!("Invalid URL format: {}", e),
        )),
    }
}

pub fn validate_path(field_name: &str, path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(invalid(field_name, path, "Path cannot be empty"));
    }

    if path.contains('\0') {
        return Err(invalid(field_name, path, "Path contains null bytes"));
    }

    Ok(())
}

pub fn validate_absolute_container_path(field_name: &str, path: &str) -> Result<()> {
    validate_path(field_name, path)?;
    if !path.starts_with('/') {
        return Err(invalid(field_name, path, "Container path must be absolute"));
    }
    if path.chars().any(char::is_whitespace) {
        return Err(invalid(field_name, path, "Container path cannot contain whitespace"));
    }
    Ok(())
}

pub fn validate_non_empty_string(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(invalid(
            field_name,
            value,
            "Value cannot be empty or whitespace-only",
        ));
    }
    Ok(())
}

pub fn validate_range<T: PartialOrd + std::fmt::Display + Copy>(
    field_name: &str,
    value: T,
    min: T,
    max: T,
) -> Result<()> {
    if value < min || value > max {
        return Err(invalid(
            field_name,
            &value.to_string(),
            format!("Value must be between {} and {}", min, max),
        ));
    }
    Ok(())
}

/// Base images must be pinned: an explicit tag or digest, never `latest`.
pub fn validate_pinned_image(field_name: &str, reference: &str) -> Result<()> {
    validate_non_empty_string(field_name, reference)?;

    if reference.chars().any(char::is_whitespace) {
        return Err(invalid(field_name, reference, "Image reference cannot contain whitespace"));
    }

    if reference.contains("@sha256:") {
        return Ok(());
    }

    // 最後一段路徑才可能帶 tag（registry 可能有 port）
    let last_segment = reference.rsplit('/').next().unwrap_or(reference);
    match last_segment.split_once(':') {
        Some((_, "latest")) => Err(invalid(
            field_name,
            reference,
            "Floating 'latest' tag is not reproducible; pin an interpreter version",
        )),
        Some((name, tag)) if !name.is_empty() && !tag.is_empty() => Ok(()),
        _ => Err(invalid(
            field_name,
            reference,
            "Image reference must carry an explicit tag or digest",
        )),
    }
}

pub fn validate_arg_name(field_name: &str, name: &str) -> Result<()> {
    let re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    if !re.is_match(name) {
        return Err(invalid(
            field_name,
            name,
            "Build argument names must match [A-Za-z_][A-Za-z0-9_]*",
        ));
    }
    Ok(())
}

pub fn validate_package_names(field_name: &str, packages: &[String]) -> Result<()> {
    // Debian 套件名稱規則（允許 =版本 固定）
    let re = Regex::new(r"^[a-z0-9][a-z0-9+.\-]+(=[A-Za-z0-9.+:~\-]+)?$").unwrap();
    for package in packages {
        if !re.is_match(package) {
            return Err(invalid(field_name, package, "Not a valid OS package name"));
        }
    }
    Ok(())
}

pub fn validate_unique<'a, I>(field_name: &str, values: I) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    for value in values {
        if !seen.insert(value) {
            return Err(invalid(field_name, value, "Duplicate entry"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url_template() {
        assert!(validate_url_template(
            "install.index",
            "https://${GITHUB_TOKEN}@pypi.data.vanoord.com/"
        )
        .is_ok());
        assert!(validate_url_template("install.index", "http://example.com").is_ok());
        assert!(validate_url_template("install.index", "").is_err());
        assert!(validate_url_template("install.index", "not a url").is_err());
        assert!(validate_url_template("install.index", "ftp://example.com").is_err());
    }

    #[test]
    fn test_validate_pinned_image() {
        assert!(validate_pinned_image("image.base", "python:3.10-slim").is_ok());
        assert!(validate_pinned_image("image.base", "registry:5000/python:3.10-slim").is_ok());
        assert!(validate_pinned_image("image.base", "python@sha256:abcd").is_ok());
        assert!(validate_pinned_image("image.base", "python").is_err());
        assert!(validate_pinned_image("image.base", "python:latest").is_err());
        assert!(validate_pinned_image("image.base", "registry:5000/python").is_err());
    }

    #[test]
    fn test_validate_arg_name_and_packages() {
        assert!(validate_arg_name("args.name", "GITHUB_TOKEN").is_ok());
        assert!(validate_arg_name("args.name", "1TOKEN").is_err());
        assert!(validate_arg_name("args.name", "PYPI-URL").is_err());

        let ok = vec!["git".to_string(), "procps".to_string(), "libpq-dev=15.4".to_string()];
        assert!(validate_package_names("system.packages", &ok).is_ok());
        let bad = vec!["git; rm -rf /".to_string()];
        assert!(validate_package_names("system.packages", &bad).is_err());
    }

    #[test]
    fn test_validate_range_and_unique() {
        assert!(validate_range("image.expose", 8888u32, 1, 65535).is_ok());
        assert!(validate_range("image.expose", 0u32, 1, 65535).is_err());
        assert!(validate_unique("args.name", ["A", "B"]).is_ok());
        assert!(validate_unique("args.name", ["A", "A"]).is_err());
    }

    #[test]
    fn test_validate_container_path() {
        assert!(validate_absolute_container_path("image.workdir", "/breakwater").is_ok());
        assert!(validate_absolute_container_path("image.workdir", "breakwater").is_err());
        assert!(validate_absolute_container_path("image.workdir", "/bad path").is_err());
    }
}
