//! Execution sandbox: Docker-backed isolation for untrusted programs.
//!
//! The security model is layered:
//!
//! 1. Image provisioning: the execution image is built from a fixed
//!    definition and cached by build-context hash
//! 2. Isolation policy: no network, no capabilities, pids ceiling,
//!    size-bounded tmpfs scratch, optional CPU/memory limits
//! 3. Sandbox handle: one idle container per run, removed on every
//!    exit path (including interrupts and unwinding)
//! 4. In-sandbox execution: generated programs only ever run through
//!    `docker exec`, never on the host
//!
//! All container operations go through the [`ContainerRuntime`] trait so
//! the lifecycle can be driven by the `docker` CLI in production and by an
//! in-memory fake in tests.

pub mod docker;
pub mod handle;
pub mod image;
pub mod policy;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RuntimeError;

pub use docker::DockerCli;
pub use handle::{ConflictPolicy, SandboxHandle, SandboxSpec, SandboxState};
pub use image::{ImageProvisioner, ImageReference};
pub use policy::{IsolationPolicy, ScratchSpace};

/// A command to run inside a live container.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    /// Written to the process stdin, which is then closed
    pub stdin: Option<String>,
    pub workdir: Option<String>,
    pub timeout: Duration,
    /// Per-stream cap on captured output
    pub max_output_bytes: usize,
}

/// Captured result of an in-container command.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Container engine operations used by the sandbox lifecycle.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Value of `label` on a local image. `None` if the image does not exist,
    /// `Some("")` if it exists without that label.
    async fn image_label(&self, image: &str, label: &str) -> Result<Option<String>, RuntimeError>;

    /// Builds `image` from `context`, attaching the given labels.
    async fn build_image(
        &self,
        image: &str,
        context: &Path,
        labels: &[(String, String)],
        timeout: Duration,
    ) -> Result<(), RuntimeError>;

    async fn container_exists(&self, name: &str) -> Result<bool, RuntimeError>;

    /// Starts a detached container running `command` under `policy`.
    async fn start_container(
        &self,
        name: &str,
        image: &str,
        policy: &IsolationPolicy,
        command: &[&str],
    ) -> Result<(), RuntimeError>;

    /// Force-removes a container. Returns `false` if it was already gone.
    async fn remove_container(&self, name: &str) -> Result<bool, RuntimeError>;

    /// Blocking variant of [`remove_container`](Self::remove_container),
    /// for use from `Drop` where no executor is available.
    fn remove_container_blocking(&self, name: &str) -> Result<bool, RuntimeError>;

    /// Copies a host file into the container.
    async fn copy_into(&self, name: &str, source: &Path, target: &str) -> Result<(), RuntimeError>;

    /// Runs a command inside the container. A non-zero exit is not an error
    /// here; only spawn failures and timeouts are.
    async fn exec(&self, name: &str, request: &ExecRequest) -> Result<ExecOutput, RuntimeError>;
}

/// Truncates `text` to at most `max` bytes on a char boundary.
pub fn truncate_output(mut text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("\n... [output truncated]");
    text
}
