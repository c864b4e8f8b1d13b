//! `docker` CLI implementation of [`ContainerRuntime`].
//!
//! Every operation shells out to the docker client with captured output
//! and a deadline. Spawned clients are killed if their future is dropped,
//! so a cancelled run never leaves a dangling `docker exec` behind.

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use super::{truncate_output, ContainerRuntime, ExecOutput, ExecRequest, IsolationPolicy};
use crate::error::RuntimeError;

/// Label put on every sandbox container so strays can be found with
/// `docker ps -a --filter label=secure-analyzer.managed`.
pub const MANAGED_LABEL: &str = "secure-analyzer.managed";

/// Deadline for short client calls (inspect, run, cp, rm).
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime backed by the `docker` command-line client.
pub struct DockerCli {
    binary: String,
    command_timeout: Duration,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    /// `binary` may point to any docker-compatible client (e.g. `podman`).
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Deadline for every call except `build` and `exec`, which carry
    /// their own.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn describe(&self, args: &[String]) -> String {
        let verb = args.first().map(String::as_str).unwrap_or_default();
        format!("{} {verb}", self.binary)
    }

    async fn run(&self, args: &[String]) -> Result<Output, RuntimeError> {
        self.run_with_timeout(args, self.command_timeout).await
    }

    async fn run_with_timeout(
        &self,
        args: &[String],
        timeout: Duration,
    ) -> Result<Output, RuntimeError> {
        debug!("Running {} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        tokio::time::timeout(timeout, output)
            .await
            .map_err(|_| RuntimeError::Timeout {
                command: self.describe(args),
                seconds: timeout.as_secs(),
            })?
            .map_err(|source| RuntimeError::Spawn {
                command: self.describe(args),
                source,
            })
    }

    fn failed(&self, args: &[String], output: &Output) -> RuntimeError {
        RuntimeError::Failed {
            command: self.describe(args),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

/// Docker says "No such container/image", podman "no such container" or
/// "image not known".
fn is_missing(output: &Output) -> bool {
    let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
    stderr.contains("no such") || stderr.contains("not known") || stderr.contains("not found")
}

/// Reads at most `max` bytes of `pipe` and discards the rest, so the
/// program never blocks on a full pipe and the host never holds more than
/// the cap.
async fn read_capped<R>(pipe: Option<R>, max: usize) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return Ok(String::new());
    };
    let mut kept = Vec::new();
    (&mut pipe).take(max as u64 + 1).read_to_end(&mut kept).await?;
    tokio::io::copy(&mut pipe, &mut tokio::io::sink()).await?;
    Ok(truncate_output(String::from_utf8_lossy(&kept).into_owned(), max))
}

/// Arguments for `docker run` starting an idle sandbox.
pub(crate) fn run_args(
    name: &str,
    image: &str,
    policy: &IsolationPolicy,
    command: &[&str],
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--label".to_string(),
        format!("{MANAGED_LABEL}=true"),
    ];
    args.extend(policy.to_docker_args());
    args.push(image.to_string());
    args.extend(command.iter().map(|c| c.to_string()));
    args
}

/// Arguments for `docker cp`. `-L` copies the file a symlink points to
/// rather than the link itself.
pub(crate) fn cp_args(name: &str, source: &Path, target: &str) -> Vec<String> {
    vec![
        "cp".to_string(),
        "-L".to_string(),
        source.display().to_string(),
        format!("{name}:{target}"),
    ]
}

/// Arguments for `docker exec` feeding the program on stdin.
pub(crate) fn exec_args(name: &str, request: &ExecRequest) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if request.stdin.is_some() {
        args.push("-i".to_string());
    }
    if let Some(ref dir) = request.workdir {
        args.extend(["-w".to_string(), dir.clone()]);
    }
    args.push(name.to_string());
    args.extend(request.command.iter().cloned());
    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn image_label(&self, image: &str, label: &str) -> Result<Option<String>, RuntimeError> {
        let args = vec![
            "image".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            format!("{{{{ index .Config.Labels \"{label}\" }}}}"),
            image.to_string(),
        ];
        let output = self.run(&args).await?;
        if !output.status.success() {
            if is_missing(&output) {
                return Ok(None);
            }
            return Err(self.failed(&args, &output));
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if value == "<no value>" {
            return Ok(Some(String::new()));
        }
        Ok(Some(value))
    }

    async fn build_image(
        &self,
        image: &str,
        context: &Path,
        labels: &[(String, String)],
        timeout: Duration,
    ) -> Result<(), RuntimeError> {
        let mut args = vec!["build".to_string(), "-t".to_string(), image.to_string()];
        for (key, value) in labels {
            args.extend(["--label".to_string(), format!("{key}={value}")]);
        }
        args.push(context.display().to_string());

        let output = self.run_with_timeout(&args, timeout).await?;
        if !output.status.success() {
            return Err(self.failed(&args, &output));
        }
        Ok(())
    }

    async fn container_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        let args = vec![
            "container".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Name}}".to_string(),
            name.to_string(),
        ];
        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(true);
        }
        if is_missing(&output) {
            return Ok(false);
        }
        Err(self.failed(&args, &output))
    }

    async fn start_container(
        &self,
        name: &str,
        image: &str,
        policy: &IsolationPolicy,
        command: &[&str],
    ) -> Result<(), RuntimeError> {
        let args = run_args(name, image, policy, command);
        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(self.failed(&args, &output));
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<bool, RuntimeError> {
        let args = vec!["rm".to_string(), "-f".to_string(), name.to_string()];
        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(true);
        }
        if is_missing(&output) {
            return Ok(false);
        }
        Err(self.failed(&args, &output))
    }

    fn remove_container_blocking(&self, name: &str) -> Result<bool, RuntimeError> {
        let args = vec!["rm".to_string(), "-f".to_string(), name.to_string()];
        let output = std::process::Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| RuntimeError::Spawn {
                command: self.describe(&args),
                source,
            })?;
        if output.status.success() {
            return Ok(true);
        }
        if is_missing(&output) {
            return Ok(false);
        }
        Err(self.failed(&args, &output))
    }

    async fn copy_into(&self, name: &str, source: &Path, target: &str) -> Result<(), RuntimeError> {
        let args = cp_args(name, source, target);
        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(self.failed(&args, &output));
        }
        Ok(())
    }

    async fn exec(&self, name: &str, request: &ExecRequest) -> Result<ExecOutput, RuntimeError> {
        let args = exec_args(name, request);
        debug!("Running {} {}", self.binary, args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                command: self.describe(&args),
                source,
            })?;

        let input = request.stdin.clone();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let max = request.max_output_bytes;
        let run = async move {
            let feed = async move {
                if let (Some(mut pipe), Some(input)) = (stdin, input) {
                    pipe.write_all(input.as_bytes()).await?;
                    // Dropping the pipe closes stdin so the program sees EOF
                }
                Ok::<_, std::io::Error>(())
            };
            let (_, stdout, stderr, status) = tokio::try_join!(
                feed,
                read_capped(stdout, max),
                read_capped(stderr, max),
                child.wait()
            )?;
            Ok::<_, std::io::Error>((stdout, stderr, status))
        };

        let (stdout, stderr, status) = match tokio::time::timeout(request.timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(RuntimeError::Spawn {
                    command: self.describe(&args),
                    source,
                })
            }
            Err(_) => {
                return Err(RuntimeError::Timeout {
                    command: self.describe(&args),
                    seconds: request.timeout.as_secs(),
                })
            }
        };

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: status.code(),
        })
    }
}
