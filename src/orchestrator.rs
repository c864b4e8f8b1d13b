use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::Credential;
use crate::error::{ConfigError, RunError};
use crate::pipeline::{AnalysisRequest, ExecutionResult, PipelineStages};
use crate::sandbox::{ContainerRuntime, ImageProvisioner, SandboxHandle, SandboxSpec, SandboxState};

/// Progress of one analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    ImageReady,
    SandboxRunning,
    ContextReady,
    Completed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Init => "init",
            RunState::ImageReady => "image_ready",
            RunState::SandboxRunning => "sandbox_running",
            RunState::ContextReady => "context_ready",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything the orchestrator needs besides the stages.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub credential: Option<Credential>,
    /// Where the credential was expected, for the error message
    pub credential_env_var: String,
    pub sandbox: SandboxSpec,
    pub build_timeout: Duration,
}

/// Drives one run end to end: image, sandbox, ingestion, execution,
/// teardown.
///
/// Once the sandbox exists it is destroyed exactly once on every exit
/// path: success, stage failure, or interruption.
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    provisioner: ImageProvisioner,
    sandbox: SandboxSpec,
    stages: PipelineStages,
}

impl Orchestrator {
    /// Fails with [`ConfigError::MissingCredential`] before any stage is
    /// built or any container operation is issued.
    pub fn new<F>(
        settings: RunSettings,
        runtime: Arc<dyn ContainerRuntime>,
        build_stages: F,
    ) -> Result<Self, ConfigError>
    where
        F: FnOnce(&Credential) -> Result<PipelineStages, ConfigError>,
    {
        let credential = settings
            .credential
            .ok_or(ConfigError::MissingCredential {
                env_var: settings.credential_env_var,
            })?;
        let stages = build_stages(&credential)?;

        Ok(Self {
            provisioner: ImageProvisioner::new(runtime.clone(), settings.build_timeout),
            runtime,
            sandbox: settings.sandbox,
            stages,
        })
    }

    /// Runs the analysis. Resolving `shutdown` interrupts the run; the
    /// sandbox is still torn down before this returns.
    pub async fn run<S>(&self, request: &AnalysisRequest, shutdown: S) -> Result<ExecutionResult, RunError>
    where
        S: Future<Output = ()>,
    {
        let state = Cell::new(RunState::Init);
        let outcome = self.run_inner(request, shutdown, &state).await;
        match outcome {
            Ok(ref result) => {
                advance(&state, RunState::Completed);
                debug!("Result: {} bytes", result.text.len());
            }
            Err(ref e) => {
                advance(&state, RunState::Failed);
                report(e);
                if e.is_precondition() {
                    info!("Nothing was sent to the generation service");
                }
            }
        }
        outcome
    }

    async fn run_inner<S>(
        &self,
        request: &AnalysisRequest,
        shutdown: S,
        state: &Cell<RunState>,
    ) -> Result<ExecutionResult, RunError>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let artifact = &request.artifact;
        if !artifact.path.is_file() {
            return Err(RunError::ArtifactMissing {
                path: artifact.path.clone(),
            });
        }

        debug!(
            "Sandbox {}: {} -> {}",
            self.sandbox.name,
            SandboxState::Absent,
            SandboxState::BuildingImage
        );
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                return Err(RunError::Interrupted { state: state.get() });
            }
            provisioned = self.provisioner.ensure_image(&self.sandbox.image) => provisioned?,
        }
        advance(state, RunState::ImageReady);

        let created = tokio::select! {
            biased;
            _ = &mut shutdown => None,
            created = SandboxHandle::create(self.runtime.clone(), self.sandbox.clone()) => Some(created),
        };
        let Some(created) = created else {
            // `docker run` may have gone through before its client was killed
            warn!("Interrupted while starting {}, removing it", self.sandbox.name);
            if let Err(e) = self.runtime.remove_container(&self.sandbox.name).await {
                error!("Teardown failed: {e}");
            }
            return Err(RunError::Interrupted { state: state.get() });
        };
        let mut sandbox = created?;
        info!(
            "Sandbox {} {} from {} ({})",
            sandbox.name(),
            sandbox.state(),
            sandbox.image(),
            sandbox.policy()
        );
        advance(state, RunState::SandboxRunning);

        let outcome = tokio::select! {
            biased;
            _ = &mut shutdown => {
                warn!("Interrupted in state {}, tearing down", state.get());
                Err(RunError::Interrupted { state: state.get() })
            }
            outcome = self.pipeline(&sandbox, request, state) => outcome,
        };

        // Teardown failures are reported, never escalated over the outcome.
        if let Err(e) = sandbox.destroy().await {
            error!("Teardown failed: {e}");
        }
        outcome
    }

    async fn pipeline(
        &self,
        sandbox: &SandboxHandle,
        request: &AnalysisRequest,
        state: &Cell<RunState>,
    ) -> Result<ExecutionResult, RunError> {
        let description = request.artifact.file_prompt();
        info!("Ingesting {}", request.artifact.path.display());
        let context = self
            .stages
            .ingestion
            .ingest(sandbox, &request.artifact, &description)
            .await?;
        let kinds: Vec<String> = context.blocks().iter().map(|b| b.kind.to_string()).collect();
        debug!(
            "Context: {} blocks [{}], {} bytes",
            context.len(),
            kinds.join(", "),
            context.total_bytes()
        );
        advance(state, RunState::ContextReady);

        info!("Answering: {}", request.question);
        let result = self
            .stages
            .execution
            .execute(sandbox, context, &request.question)
            .await?;
        Ok(result)
    }
}

fn advance(state: &Cell<RunState>, next: RunState) {
    info!("Run: {} -> {next}", state.get());
    state.set(next);
}

/// Logs a failed run. Every variant is listed so a new failure kind has to
/// decide how it is reported.
fn report(e: &RunError) {
    match e {
        RunError::ArtifactMissing { .. } => error!("{e}"),
        RunError::Provision(_) => error!("Image provisioning failed: {e}"),
        RunError::Sandbox(_) => error!("Sandbox setup failed: {e}"),
        RunError::Ingest(_) => error!("Context ingestion failed: {e}"),
        RunError::Exec(_) => error!("Execution failed: {e}"),
        RunError::Interrupted { .. } => warn!("Run {e}"),
    }
}
