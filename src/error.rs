//! Error types for every stage of an analysis run.
//!
//! Each layer has its own enum so the orchestrator can decide, with one
//! exhaustive match, which failures are fatal preconditions and which are
//! pipeline failures that still go through teardown.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::orchestrator::RunState;

/// Configuration and credential errors, raised before any sandbox action.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing credential: set {env_var} (or llm.api_key in the config file)")]
    MissingCredential { env_var: String },

    #[error("cannot read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot expand environment variables in {}: {reason}", .path.display())]
    Expand { path: PathBuf, reason: String },

    #[error("invalid config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("unsupported LLM provider: {0}")]
    UnsupportedProvider(String),
}

/// Failure of a single `docker` CLI invocation.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("cannot spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {}: {stderr}", describe_status(.code))]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("`{command}` timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },
}

fn describe_status(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| format!("status {c}"))
}

fn describe_exit(code: &Option<i32>) -> String {
    code.map_or_else(|| "no exit code".to_string(), |c| format!("exit code {c}"))
}

/// Image provisioning errors. Always fatal to the run.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("build context {} is missing or unreadable: {reason}", .path.display())]
    ContextMissing { path: PathBuf, reason: String },

    #[error("image build failed: {stderr}")]
    BuildFailed { stderr: String },
}

/// Sandbox lifecycle errors.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("sandbox {name} failed to start: {reason}")]
    StartFailed { name: String, reason: String },

    #[error("a container named {name} already exists")]
    NameConflict { name: String },

    #[error("sandbox {name} could not be removed: {reason}")]
    RemoveFailed { name: String, reason: String },
}

/// Errors returned by the generation service boundary.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("generation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("{0}")]
    Failed(String),

    #[error("generation returned an empty response")]
    Empty,
}

/// Context accumulation errors.
#[derive(Error, Debug, PartialEq)]
pub enum ContextError {
    #[error("context is full ({limit} blocks)")]
    TooManyBlocks { limit: usize },
}

/// Context ingestion errors. Recoverable: the run ends, teardown still runs.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("artifact {} is unavailable: {reason}", .path.display())]
    ArtifactUnavailable { path: PathBuf, reason: String },

    #[error("context generation failed: {cause}")]
    GenerationFailed {
        #[source]
        cause: GenerationError,
    },

    #[error(transparent)]
    ContextOverflow(#[from] ContextError),
}

/// Which half of the execution stage a timeout hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecPhase {
    Generation,
    Execution,
}

impl fmt::Display for ExecPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecPhase::Generation => f.write_str("program generation"),
            ExecPhase::Execution => f.write_str("sandbox execution"),
        }
    }
}

/// Execution stage errors. Generation and in-sandbox failures stay distinct
/// because only the latter means the sandbox side misbehaved.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("program generation failed: {cause}")]
    GenerationFailed {
        #[source]
        cause: GenerationError,
    },

    #[error("program failed inside the sandbox ({}): {stderr}", describe_exit(.exit_code))]
    SandboxExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{phase} timed out after {seconds}s")]
    Timeout { phase: ExecPhase, seconds: u64 },
}

/// Terminal failure of one orchestrated run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("input file not found: {}", .path.display())]
    ArtifactMissing { path: PathBuf },

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("interrupted while in state {state}")]
    Interrupted { state: RunState },
}

impl RunError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::ArtifactMissing { .. }
            | RunError::Provision(_)
            | RunError::Sandbox(_)
            | RunError::Ingest(_)
            | RunError::Exec(_) => 1,
            RunError::Interrupted { .. } => 130,
        }
    }

    /// True for failures that happen before any data leaves the host.
    pub fn is_precondition(&self) -> bool {
        match self {
            RunError::ArtifactMissing { .. } | RunError::Provision(_) | RunError::Sandbox(_) => {
                true
            }
            RunError::Ingest(_) | RunError::Exec(_) | RunError::Interrupted { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let missing = RunError::ArtifactMissing {
            path: PathBuf::from("data.csv"),
        };
        assert_eq!(missing.exit_code(), 1);
        assert!(missing.is_precondition());

        let exec = RunError::Exec(ExecError::Timeout {
            phase: ExecPhase::Execution,
            seconds: 60,
        });
        assert_eq!(exec.exit_code(), 1);
        assert!(!exec.is_precondition());

        let interrupted = RunError::Interrupted {
            state: RunState::SandboxRunning,
        };
        assert_eq!(interrupted.exit_code(), 130);
    }

    #[test]
    fn test_generation_and_execution_failures_render_differently() {
        let generation = ExecError::GenerationFailed {
            cause: GenerationError::Empty,
        };
        let execution = ExecError::SandboxExecutionFailed {
            exit_code: Some(1),
            stderr: "NameError: df".to_string(),
        };
        assert!(generation.to_string().starts_with("program generation failed"));
        assert!(execution.to_string().contains("exit code 1"));
        assert!(execution.to_string().contains("NameError"));
    }

    #[test]
    fn test_timeout_names_phase() {
        let err = ExecError::Timeout {
            phase: ExecPhase::Generation,
            seconds: 120,
        };
        assert_eq!(err.to_string(), "program generation timed out after 120s");
    }

    #[test]
    fn test_runtime_error_signal_exit() {
        let err = RuntimeError::Failed {
            command: "docker exec".to_string(),
            code: None,
            stderr: "killed".to_string(),
        };
        assert_eq!(err.to_string(), "`docker exec` exited with signal: killed");
    }
}
