//! One live sandbox container and its lifecycle.
//!
//! A `SandboxHandle` is the scoped resource for the container: removal is
//! registered the moment `create` succeeds. The orchestrator calls
//! [`SandboxHandle::destroy`] on every normal and error path; if the handle
//! is dropped without that (panic unwinding, a future cancelled mid-run),
//! `Drop` removes the container synchronously.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::{ContainerRuntime, ExecOutput, ExecRequest, ImageReference, IsolationPolicy};
use crate::error::{RuntimeError, SandboxError};

/// Idle command keeping the container alive between exec requests.
const IDLE_COMMAND: [&str; 2] = ["sleep", "infinity"];

/// Lifecycle of the run's sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Absent,
    BuildingImage,
    Starting,
    Running,
    Stopping,
    Removed,
}

impl SandboxState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: SandboxState) -> bool {
        use SandboxState::*;
        matches!(
            (self, next),
            (Absent, BuildingImage)
                | (Absent, Starting)
                | (BuildingImage, Starting)
                | (Starting, Running)
                | (Starting, Removed)
                | (Running, Stopping)
                | (Stopping, Removed)
        )
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxState::Absent => "absent",
            SandboxState::BuildingImage => "building_image",
            SandboxState::Starting => "starting",
            SandboxState::Running => "running",
            SandboxState::Stopping => "stopping",
            SandboxState::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// What `create` does when a container with the same name already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Force-remove the stale container, then start a fresh one
    #[default]
    Replace,
    /// Fail with `SandboxError::NameConflict`
    Fail,
}

/// Everything needed to start a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub name: String,
    pub image: ImageReference,
    pub policy: IsolationPolicy,
    /// Working directory for artifacts and programs inside the container
    pub workdir: String,
    pub on_conflict: ConflictPolicy,
}

/// A running sandbox container, owned by exactly one run.
pub struct SandboxHandle {
    runtime: Arc<dyn ContainerRuntime>,
    name: String,
    image: ImageReference,
    policy: IsolationPolicy,
    workdir: String,
    state: SandboxState,
    /// Set once removal has been attempted, successful or not
    released: bool,
}

impl fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("name", &self.name)
            .field("image", &self.image.to_string())
            .field("state", &self.state)
            .finish()
    }
}

impl SandboxHandle {
    /// Starts an idle container under the requested isolation policy.
    ///
    /// A stale container with the same name is force-removed or reported as
    /// a conflict depending on `spec.on_conflict`; it is never reused. If
    /// `docker run` fails, the name is removed once so a half-created
    /// container does not leak.
    pub async fn create(
        runtime: Arc<dyn ContainerRuntime>,
        spec: SandboxSpec,
    ) -> Result<SandboxHandle, SandboxError> {
        let SandboxSpec {
            name,
            image,
            policy,
            workdir,
            on_conflict,
        } = spec;
        debug!("Sandbox {name}: {} -> {}", SandboxState::Absent, SandboxState::Starting);

        let start_failed = |reason: String| SandboxError::StartFailed {
            name: name.clone(),
            reason,
        };

        let exists = runtime
            .container_exists(&name)
            .await
            .map_err(|e| start_failed(e.to_string()))?;
        if exists {
            match on_conflict {
                ConflictPolicy::Fail => {
                    return Err(SandboxError::NameConflict { name: name.clone() });
                }
                ConflictPolicy::Replace => {
                    warn!("Removing stale container {name} before starting a new sandbox");
                    runtime
                        .remove_container(&name)
                        .await
                        .map_err(|e| start_failed(format!("cannot remove stale container: {e}")))?;
                }
            }
        }

        let image_ref = image.to_string();
        if let Err(e) = runtime
            .start_container(&name, &image_ref, &policy, &IDLE_COMMAND)
            .await
        {
            error!("Sandbox {name} failed to start: {e}");
            if let Err(cleanup) = runtime.remove_container(&name).await {
                warn!("Cleanup after failed start of {name} also failed: {cleanup}");
            }
            return Err(start_failed(reason_of(e)));
        }

        debug!("Sandbox {name}: {} -> {}", SandboxState::Starting, SandboxState::Running);
        Ok(SandboxHandle {
            runtime,
            name,
            image,
            policy,
            workdir,
            state: SandboxState::Running,
            released: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &ImageReference {
        &self.image
    }

    pub fn policy(&self) -> &IsolationPolicy {
        &self.policy
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    fn advance(&mut self, next: SandboxState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal sandbox transition {} -> {next}",
            self.state
        );
        debug!("Sandbox {}: {} -> {next}", self.name, self.state);
        self.state = next;
    }

    /// Copies a host file into the sandbox work directory.
    /// Returns the path of the copy inside the container.
    pub async fn copy_in(&self, source: &Path, file_name: &str) -> Result<String, RuntimeError> {
        let target = format!("{}/{file_name}", self.workdir.trim_end_matches('/'));
        self.runtime.copy_into(&self.name, source, &target).await?;
        debug!("Copied {} to {}:{target}", source.display(), self.name);
        Ok(target)
    }

    /// Runs a command inside the sandbox.
    pub async fn exec(&self, request: &ExecRequest) -> Result<ExecOutput, RuntimeError> {
        self.runtime.exec(&self.name, request).await
    }

    /// Removes the container. Idempotent: a second call, or a container that
    /// is already gone, is not an error. Failures are returned for the caller
    /// to report; the removal is never retried.
    pub async fn destroy(&mut self) -> Result<(), SandboxError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.advance(SandboxState::Stopping);

        match self.runtime.remove_container(&self.name).await {
            Ok(removed) => {
                self.advance(SandboxState::Removed);
                if removed {
                    info!("Sandbox {} removed", self.name);
                } else {
                    debug!("Sandbox {} was already absent", self.name);
                }
                Ok(())
            }
            Err(e) => Err(SandboxError::RemoveFailed {
                name: self.name.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        warn!(
            "Sandbox {} dropped without teardown, removing it now",
            self.name
        );
        self.advance(SandboxState::Stopping);
        match self.runtime.remove_container_blocking(&self.name) {
            Ok(_) => self.advance(SandboxState::Removed),
            Err(e) => error!("Sandbox {} may have leaked: {e}", self.name),
        }
    }
}

fn reason_of(e: RuntimeError) -> String {
    match e {
        RuntimeError::Failed { stderr, .. } => stderr,
        other => other.to_string(),
    }
}
