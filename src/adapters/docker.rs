//! Docker CLI adapter.
//!
//! Secret values are handed to `docker` through its environment only:
//! build arguments as `--build-arg NAME` (value read from the env var of the
//! same name) and BuildKit secrets as `--secret id=...,env=...`. The command
//! line therefore never carries a token.

use crate::domain::model::{CommandOutput, ExposedPort, ImageMetadata, Invocation, Secret};
use crate::domain::ports::CommandRunner;
use crate::utils::error::{BuildError, Result};
use crate::utils::redact::Redactor;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

const STDERR_TAIL_LINES: usize = 30;

/// 以 tokio::process 執行外部程式
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let mut command = tokio::process::Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &invocation.env {
            command.env(key, value.expose());
        }
        if let Some(dir) = &invocation.current_dir {
            command.current_dir(dir);
        }

        tracing::debug!("Running: {}", invocation.display_command());

        let Some(redactor) = &invocation.stream else {
            let output = command.output().await?;
            return Ok(CommandOutput {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        };

        let mut child = command.spawn()?;
        let (stdout, stderr) = tokio::try_join!(
            stream_lines(child.stdout.take(), redactor),
            stream_lines(child.stderr.take(), redactor)
        )?;
        let status = child.wait().await?;

        Ok(CommandOutput {
            status: status.code(),
            stdout,
            stderr,
        })
    }
}

/// 逐行讀取並即時記錄（已遮蔽），同時保留完整輸出
async fn stream_lines<T: AsyncRead + Unpin>(reader: Option<T>, redactor: &Redactor) -> Result<String> {
    let mut collected = String::new();
    let Some(reader) = reader else {
        return Ok(collected);
    };

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        tracing::info!("│ {}", redactor.redact(&line));
        collected.push_str(&line);
        collected.push('\n');
    }
    Ok(collected)
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub dockerfile: PathBuf,
    pub context_dir: PathBuf,
    pub tag: String,
    pub build_args: Vec<(String, Secret)>,
    /// `(secret id, value)` pairs exposed through BuildKit secret mounts.
    pub secrets: Vec<(String, Secret)>,
    pub no_cache: bool,
}

pub fn secret_env_var(id: &str) -> String {
    format!(
        "BREAKWATER_SECRET_{}",
        id.to_ascii_uppercase().replace(|c: char| !c.is_ascii_alphanumeric(), "_")
    )
}

pub struct DockerCli<R: CommandRunner> {
    runner: R,
    program: String,
}

impl<R: CommandRunner> DockerCli<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            program: "docker".to_string(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn build_invocation(&self, request: &BuildRequest) -> Invocation {
        let mut invocation = Invocation::new(&self.program)
            .args(["build", "--progress=plain"])
            .arg("--file")
            .arg(request.dockerfile.display().to_string())
            .arg("--tag")
            .arg(&request.tag)
            .env("DOCKER_BUILDKIT", Secret::new("1"));

        if request.no_cache {
            invocation = invocation.arg("--no-cache");
        }

        for (name, value) in &request.build_args {
            invocation = invocation
                .arg("--build-arg")
                .arg(name)
                .env(name, value.clone());
        }

        for (id, value) in &request.secrets {
            let var = secret_env_var(id);
            invocation = invocation
                .arg("--secret")
                .arg(format!("id={},env={}", id, var))
                .env(var, value.clone());
        }

        invocation.arg(request.context_dir.display().to_string())
    }

    /// Single attempt; a non-zero exit becomes [`BuildError::CommandError`]
    /// carrying the tool's status and the redacted tail of its output.
    pub async fn build(&self, request: &BuildRequest, redactor: &Redactor) -> Result<CommandOutput> {
        let invocation = self.build_invocation(request).stream_output(redactor.clone());
        tracing::info!("🐳 {}", invocation.display_command());

        let output = self.runner.run(&invocation).await?;
        self.check(&output, redactor)?;
        Ok(output)
    }

    pub async fn inspect(&self, tag: &str) -> Result<(ImageMetadata, String)> {
        let invocation = Invocation::new(&self.program).args(["image", "inspect", tag]);
        let output = self.runner.run(&invocation).await?;
        self.check(&output, &Redactor::default())?;

        let metadata = parse_inspect(&output.stdout)?;
        Ok((metadata, output.stdout))
    }

    /// `CreatedBy` of every layer, newest first.
    pub async fn history(&self, tag: &str) -> Result<Vec<String>> {
        let invocation = Invocation::new(&self.program).args([
            "history",
            "--no-trunc",
            "--format",
            "{{.CreatedBy}}",
            tag,
        ]);
        let output = self.runner.run(&invocation).await?;
        self.check(&output, &Redactor::default())?;

        Ok(output
            .stdout
            .lines()
            .map(str::to_string)
            .filter(|l| !l.trim().is_empty())
            .collect())
    }

    fn check(&self, output: &CommandOutput, redactor: &Redactor) -> Result<()> {
        if output.success() {
            return Ok(());
        }

        let stderr = redactor.redact(&output.stderr);
        for line in stderr.lines() {
            tracing::error!("{}", line);
        }

        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");

        Err(BuildError::CommandError {
            program: self.program.clone(),
            code: output.status,
            stderr: tail,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawImage {
    id: String,
    #[serde(default)]
    config: RawConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawConfig {
    #[serde(default)]
    exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    cmd: Option<Vec<String>>,
    #[serde(default)]
    entrypoint: Option<Vec<String>>,
    #[serde(default)]
    working_dir: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

/// Parses `docker image inspect` output (array or single object).
pub fn parse_inspect(raw: &str) -> Result<ImageMetadata> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let image = match value {
        serde_json::Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        serde_json::Value::Array(_) => {
            return Err(BuildError::VerificationError {
                message: "docker image inspect returned no images".to_string(),
            })
        }
        other => other,
    };
    let image: RawImage = serde_json::from_value(image)?;

    let exposed_ports = image
        .config
        .exposed_ports
        .unwrap_or_default()
        .keys()
        .filter_map(|raw| ExposedPort::parse(raw))
        .collect();

    Ok(ImageMetadata {
        id: image.id,
        exposed_ports,
        cmd: image.config.cmd.unwrap_or_default(),
        entrypoint: image.config.entrypoint.unwrap_or_default(),
        working_dir: image.config.working_dir,
        labels: image.config.labels.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingRunner {
        invocations: Arc<Mutex<Vec<Invocation>>>,
        status: i32,
        stdout: String,
        stderr: String,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
            self.invocations.lock().unwrap().push(invocation.clone());
            Ok(CommandOutput {
                status: Some(self.status),
                stdout: self.stdout.clone(),
                stderr: self.stderr.clone(),
            })
        }
    }

    fn request() -> BuildRequest {
        BuildRequest {
            dockerfile: PathBuf::from("build/Dockerfile"),
            context_dir: PathBuf::from("."),
            tag: "breakwater:dev".to_string(),
            build_args: vec![],
            secrets: vec![("pypi_url".to_string(), Secret::new("https://tok@host/"))],
            no_cache: true,
        }
    }

    #[test]
    fn test_build_invocation_keeps_secrets_off_command_line() {
        let docker = DockerCli::new(RecordingRunner::default());
        let invocation = docker.build_invocation(&request());

        assert_eq!(
            invocation.args,
            vec![
                "build",
                "--progress=plain",
                "--file",
                "build/Dockerfile",
                "--tag",
                "breakwater:dev",
                "--no-cache",
                "--secret",
                "id=pypi_url,env=BREAKWATER_SECRET_PYPI_URL",
                "."
            ]
        );
        assert!(!invocation.display_command().contains("tok"));
        assert!(invocation
            .env
            .iter()
            .any(|(k, v)| k == "BREAKWATER_SECRET_PYPI_URL" && v.expose() == "https://tok@host/"));
    }

    #[test]
    fn test_build_args_are_passed_by_name() {
        let docker = DockerCli::new(RecordingRunner::default());
        let mut req = request();
        req.secrets.clear();
        req.build_args = vec![("GITHUB_TOKEN".to_string(), Secret::new("tok"))];

        let invocation = docker.build_invocation(&req);
        let position = invocation.args.iter().position(|a| a == "--build-arg").unwrap();
        assert_eq!(invocation.args[position + 1], "GITHUB_TOKEN");
        assert!(invocation.env.iter().any(|(k, _)| k == "GITHUB_TOKEN"));
    }

    #[tokio::test]
    async fn test_failed_build_reports_redacted_stderr_and_status() {
        let runner = RecordingRunner {
            status: 17,
            stderr: "ERROR: 401 for https://tok@pypi.data.vanoord.com/simple/".to_string(),
            ..Default::default()
        };
        let docker = DockerCli::new(runner);
        let redactor = Redactor::new(["tok"]);

        let err = docker.build(&request(), &redactor).await.unwrap_err();
        match err {
            BuildError::CommandError { program, code, stderr } => {
                assert_eq!(program, "docker");
                assert_eq!(code, Some(17));
                assert!(!stderr.contains("tok"));
                assert!(stderr.contains("401"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_inspect_array() {
        let raw = r#"[{
            "Id": "sha256:abc",
            "Config": {
                "ExposedPorts": {"8888/tcp": {}},
                "Cmd": ["tail", "-f", "/dev/null"],
                "Entrypoint": null,
                "WorkingDir": "/breakwater",
                "Labels": {"org.breakwater.entrypoint": "placeholder"}
            }
        }]"#;

        let metadata = parse_inspect(raw).unwrap();
        assert_eq!(metadata.id, "sha256:abc");
        assert_eq!(metadata.exposed_ports.len(), 1);
        assert!(metadata.exposed_ports.contains(&ExposedPort::tcp(8888)));
        assert_eq!(metadata.cmd, vec!["tail", "-f", "/dev/null"]);
        assert!(metadata.entrypoint.is_empty());
        assert_eq!(metadata.working_dir, "/breakwater");
        assert_eq!(metadata.labels["org.breakwater.entrypoint"], "placeholder");
    }

    #[test]
    fn test_parse_inspect_without_ports() {
        let metadata = parse_inspect(r#"{"Id": "sha256:def", "Config": {"Labels": null}}"#).unwrap();
        assert!(metadata.exposed_ports.is_empty());
        assert!(metadata.labels.is_empty());
        assert!(parse_inspect("[]").is_err());
    }

    #[tokio::test]
    async fn test_history_lines() {
        let runner = RecordingRunner {
            status: 0,
            stdout: "CMD [\"tail\"]\n\nRUN pip install -e .\n".to_string(),
            ..Default::default()
        };
        let docker = DockerCli::new(runner.clone());

        let history = docker.history("breakwater:dev").await.unwrap();
        assert_eq!(history, vec!["CMD [\"tail\"]", "RUN pip install -e ."]);
        let recorded = runner.invocations.lock().unwrap();
        assert_eq!(recorded[0].args[0], "history");
        assert!(recorded[0].stream.is_none());
    }

    #[tokio::test]
    async fn test_build_streams_output() {
        let runner = RecordingRunner::default();
        let docker = DockerCli::new(runner.clone());

        docker.build(&request(), &Redactor::new(["tok"])).await.unwrap();

        let recorded = runner.invocations.lock().unwrap();
        let stream = recorded[0].stream.as_ref().expect("build output is streamed");
        assert!(!stream.redact("ERROR: 401 for https://tok@host/").contains("tok"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streamed_output_is_collected_per_stream() {
        let invocation = Invocation::new("sh")
            .args(["-c", "echo 'step 1/3' >&2; echo done; echo 'step 2/3' >&2"])
            .stream_output(Redactor::default());

        let output = ProcessRunner.run(&invocation).await.unwrap();
        assert_eq!(output.status, Some(0));
        assert_eq!(output.stdout, "done\n");
        assert_eq!(output.stderr, "step 1/3\nstep 2/3\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streamed_failure_keeps_exit_code() {
        let invocation = Invocation::new("sh")
            .args(["-c", "echo 'no space left' >&2; exit 4"])
            .stream_output(Redactor::default());

        let output = ProcessRunner.run(&invocation).await.unwrap();
        assert_eq!(output.status, Some(4));
        assert_eq!(output.stderr, "no space left\n");
    }
}
