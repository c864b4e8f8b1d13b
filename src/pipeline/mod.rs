//! Two-stage analysis pipeline.
//!
//! 1. Context ingestion: reads the artifact, copies it into the sandbox
//!    and asks the context model for a description
//! 2. Execution: asks the code model for a program answering the
//!    question and runs it inside the sandbox
//!
//! The stages share nothing mutable: ingestion returns a [`Context`] value
//! that is moved into the execution stage.

pub mod context;
pub mod execute;
pub mod generate;
pub mod ingest;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::config::{Config, Credential};
use crate::error::{ConfigError, ExecError, IngestError};
use crate::llm;
use crate::sandbox::SandboxHandle;

pub use context::{Context, ContextLimits};
pub use execute::CodeExecutor;
pub use generate::Generator;
pub use ingest::FileAccessIngestor;

/// The user-supplied data file. Only ever read.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactReference {
    pub path: PathBuf,
    /// Declared column names; empty when the caller gave none
    pub columns: Vec<String>,
}

impl ArtifactReference {
    pub fn new(path: impl Into<PathBuf>, columns: Vec<String>) -> Self {
        let columns = columns
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        Self {
            path: path.into(),
            columns,
        }
    }

    /// File name used inside the sandbox.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data.csv".to_string())
    }

    /// Natural-language description handed to the ingestion stage.
    pub fn file_prompt(&self) -> String {
        let name = self.file_name();
        if self.columns.is_empty() {
            format!(
                "Use the file {name} for your analysis. \
                 Its column names are given by the header row."
            )
        } else {
            format!(
                "Use the file {name} for your analysis. \
                 The file data includes the following columns:\n{}.",
                self.columns.join(", ")
            )
        }
    }
}

/// One question about one artifact.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub artifact: ArtifactReference,
    pub question: String,
}

/// Text result of one successful execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub text: String,
    /// The program that produced it
    pub program: String,
}

/// Builds a bounded context describing the artifact.
#[async_trait]
pub trait ContextIngestion: Send + Sync {
    async fn ingest(
        &self,
        sandbox: &SandboxHandle,
        artifact: &ArtifactReference,
        description: &str,
    ) -> Result<Context, IngestError>;
}

/// Synthesizes a program from the context and question and runs it in the
/// sandbox. At most one execution attempt per call.
#[async_trait]
pub trait ExecutionStage: Send + Sync {
    async fn execute(
        &self,
        sandbox: &SandboxHandle,
        context: Context,
        question: &str,
    ) -> Result<ExecutionResult, ExecError>;
}

pub struct PipelineStages {
    pub ingestion: Box<dyn ContextIngestion>,
    pub execution: Box<dyn ExecutionStage>,
}

impl PipelineStages {
    /// Wires both stages to their configured models.
    pub fn from_config(config: &Config, credential: &Credential) -> Result<Self, ConfigError> {
        let limits = &config.limits;
        let context_client =
            llm::build_client(&config.llm, &config.llm.context_model, credential, None)?;
        let code_client = llm::build_client(
            &config.llm,
            &config.llm.code_model,
            credential,
            config.llm.reasoning_effort.clone(),
        )?;

        let ingestion = FileAccessIngestor::new(
            Generator::new(context_client, limits.generation_timeout()),
            ContextLimits {
                max_blocks: limits.max_context_blocks,
                max_block_bytes: limits.max_block_bytes,
            },
            limits.inline_artifact_bytes,
            limits.preview_rows,
        );
        let execution = CodeExecutor::new(
            Generator::new(code_client, limits.generation_timeout()),
            limits.execution_timeout(),
            limits.max_output_bytes,
        );

        Ok(Self {
            ingestion: Box::new(ingestion),
            execution: Box::new(execution),
        })
    }
}
