use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Missing configuration field: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid value for '{field}': '{value}' ({reason})")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing build argument: {name}")]
    MissingBuildArgError { name: String },

    #[error("Build context error at {path}: {message}")]
    ContextError { path: String, message: String },

    #[error("Command `{program}` failed (exit code {code:?}): {stderr}")]
    CommandError {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Stage '{stage}' failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: Box<BuildError>,
    },

    #[error("Image verification failed: {message}")]
    VerificationError { message: String },

    #[error("Secret value leaked into {location}")]
    SecretLeakError { location: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Environment,
    ExternalTool,
    Verification,
    Security,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Medium,
    High,
    Critical,
}

impl BuildError {
    /// 取得最內層的錯誤（展開 StageFailed）
    pub fn root(&self) -> &BuildError {
        match self {
            BuildError::StageFailed { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self.root() {
            BuildError::ConfigError { .. }
            | BuildError::MissingConfigError { .. }
            | BuildError::InvalidConfigValueError { .. }
            | BuildError::MissingBuildArgError { .. }
            | BuildError::TomlError(_) => ErrorCategory::Configuration,
            BuildError::IoError(_)
            | BuildError::SerializationError(_)
            | BuildError::ContextError { .. } => ErrorCategory::Environment,
            BuildError::CommandError { .. } => ErrorCategory::ExternalTool,
            BuildError::VerificationError { .. } => ErrorCategory::Verification,
            BuildError::SecretLeakError { .. } => ErrorCategory::Security,
            BuildError::StageFailed { .. } => ErrorCategory::Environment,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Configuration => ErrorSeverity::Medium,
            ErrorCategory::ExternalTool | ErrorCategory::Verification => ErrorSeverity::High,
            ErrorCategory::Environment | ErrorCategory::Security => ErrorSeverity::Critical,
        }
    }

    /// Tool failures keep the tool's own exit status; everything else maps by severity.
    pub fn exit_code(&self) -> i32 {
        if let BuildError::CommandError {
            code: Some(code), ..
        } = self.root()
        {
            if *code != 0 {
                return *code;
            }
        }

        match self.severity() {
            ErrorSeverity::High => 1,
            ErrorSeverity::Medium => 2,
            ErrorSeverity::Critical => 3,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.root() {
            BuildError::MissingBuildArgError { .. } => {
                "Pass the value with --build-arg NAME=VALUE or export the environment variable named in the recipe"
            }
            BuildError::ConfigError { .. }
            | BuildError::MissingConfigError { .. }
            | BuildError::InvalidConfigValueError { .. }
            | BuildError::TomlError(_) => "Check breakwater.toml against the documented recipe tables",
            BuildError::ContextError { .. } => {
                "Make sure the build context is readable and contains pyproject.toml, setup.py or setup.cfg"
            }
            BuildError::CommandError { .. } => {
                "Inspect the tool output above; an expired GITHUB_TOKEN or an unreachable package index is the usual cause"
            }
            BuildError::VerificationError { .. } => {
                "Rebuild the image with --no-cache and compare the rendered Dockerfile with the recipe"
            }
            BuildError::SecretLeakError { .. } => {
                "Rotate the leaked token and rebuild with --secret-mode mount"
            }
            BuildError::IoError(_) | BuildError::SerializationError(_) => {
                "Check file permissions and free disk space in the output directory"
            }
            BuildError::StageFailed { .. } => "Re-run with --verbose for details",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            BuildError::StageFailed { stage, source } => {
                format!("Build stopped at stage '{}': {}", stage, source.user_friendly_message())
            }
            BuildError::CommandError { program, code, .. } => match code {
                Some(code) => format!("`{}` exited with status {}", program, code),
                None => format!("`{}` was terminated by a signal", program),
            },
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_failure_keeps_tool_exit_code() {
        let err = BuildError::StageFailed {
            stage: "build-image".to_string(),
            source: Box::new(BuildError::CommandError {
                program: "docker".to_string(),
                code: Some(17),
                stderr: "denied".to_string(),
            }),
        };

        assert_eq!(err.category(), ErrorCategory::ExternalTool);
        assert_eq!(err.exit_code(), 17);
        assert!(err.user_friendly_message().contains("build-image"));
    }

    #[test]
    fn test_exit_code_by_severity() {
        let missing = BuildError::MissingBuildArgError {
            name: "GITHUB_TOKEN".to_string(),
        };
        assert_eq!(missing.severity(), ErrorSeverity::Medium);
        assert_eq!(missing.exit_code(), 2);

        let leak = BuildError::SecretLeakError {
            location: "image history".to_string(),
        };
        assert_eq!(leak.category(), ErrorCategory::Security);
        assert_eq!(leak.exit_code(), 3);

        let killed = BuildError::CommandError {
            program: "docker".to_string(),
            code: None,
            stderr: String::new(),
        };
        assert_eq!(killed.exit_code(), 1);
    }
}
