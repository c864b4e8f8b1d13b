//! Context ingestion stage.
//!
//! Reads a bounded preview of the artifact on the host, copies the file
//! into the sandbox work directory, and asks the context model to describe
//! it. Small files are sent whole; larger ones as header plus the first
//! rows, with the total row count.

use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use super::context::{BlockKind, Context, ContextLimits};
use super::generate::Generator;
use super::{ArtifactReference, ContextIngestion};
use crate::error::IngestError;
use crate::sandbox::SandboxHandle;

const SYSTEM_PROMPT: &str = "\
You describe data files for a programmer who will analyze them with pandas.
You are given the file name, its declared columns and a preview of its content.
Describe: each column with its inferred type and typical values or range, \
the number of rows, the delimiter, and anything that needs care when loading \
(missing values, mixed types, units). Be factual and concise. Do not write code.";

const DESCRIBE_INSTRUCTION: &str = "Describe this data file.";

/// Head of the artifact as seen from the host.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactPreview {
    pub size_bytes: u64,
    /// Non-empty lines after the header
    pub data_rows: usize,
    /// Lines shown, header first
    pub lines: Vec<String>,
    /// True when `lines` is the whole file
    pub complete: bool,
}

impl ArtifactPreview {
    /// Text block for the context, pointing at the copy inside the sandbox.
    pub fn render(&self, sandbox_path: &str) -> String {
        let scope = if self.complete {
            "Full content".to_string()
        } else {
            format!("First {} lines", self.lines.len())
        };
        format!(
            "Path inside the sandbox: {sandbox_path}\n\
             Size: {} bytes, {} data rows\n\
             {scope}:\n```\n{}\n```",
            self.size_bytes,
            self.data_rows,
            self.lines.join("\n")
        )
    }
}

/// Reads the artifact, keeping at most `preview_rows` data rows unless the
/// file is no larger than `inline_bytes`. The whole file is streamed once
/// to count rows; only the shown lines are kept in memory. Bytes that are
/// not UTF-8 are shown as replacement characters.
pub async fn read_preview(
    path: &Path,
    inline_bytes: u64,
    preview_rows: usize,
) -> std::io::Result<ArtifactPreview> {
    let size_bytes = tokio::fs::metadata(path).await?.len();
    let complete = size_bytes <= inline_bytes;
    let file = tokio::fs::File::open(path).await?;
    let mut reader = BufReader::new(file);

    let mut lines = Vec::new();
    let mut seen = 0usize;
    let mut raw = Vec::new();
    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw).await? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
        if line.trim().is_empty() {
            continue;
        }
        // index 0 is the header
        if complete || seen <= preview_rows {
            lines.push(line.to_string());
        }
        seen += 1;
    }

    Ok(ArtifactPreview {
        size_bytes,
        data_rows: seen.saturating_sub(1),
        complete: complete || lines.len() == seen,
        lines,
    })
}

/// Ingestion stage backed by a host-side file read and the context model.
pub struct FileAccessIngestor {
    generator: Generator,
    limits: ContextLimits,
    inline_bytes: u64,
    preview_rows: usize,
}

impl FileAccessIngestor {
    pub fn new(
        generator: Generator,
        limits: ContextLimits,
        inline_bytes: u64,
        preview_rows: usize,
    ) -> Self {
        Self {
            generator,
            limits,
            inline_bytes,
            preview_rows,
        }
    }
}

#[async_trait]
impl ContextIngestion for FileAccessIngestor {
    async fn ingest(
        &self,
        sandbox: &SandboxHandle,
        artifact: &ArtifactReference,
        description: &str,
    ) -> Result<Context, IngestError> {
        let unavailable = |reason: String| IngestError::ArtifactUnavailable {
            path: artifact.path.clone(),
            reason,
        };

        let preview = read_preview(&artifact.path, self.inline_bytes, self.preview_rows)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        debug!(
            "Artifact {}: {} bytes, {} rows, {} preview lines",
            artifact.path.display(),
            preview.size_bytes,
            preview.data_rows,
            preview.lines.len()
        );

        let sandbox_path = sandbox
            .copy_in(&artifact.path, &artifact.file_name())
            .await
            .map_err(|e| unavailable(format!("copy into sandbox failed: {e}")))?;

        let context = Context::new(self.limits)
            .with_block(BlockKind::FilePrompt, description)?
            .with_block(BlockKind::ArtifactPreview, preview.render(&sandbox_path))?;

        info!(
            "Describing {} with {}",
            artifact.file_name(),
            self.generator.description()
        );
        let summary = self
            .generator
            .generate(SYSTEM_PROMPT, &context, DESCRIBE_INSTRUCTION)
            .await
            .map_err(|cause| IngestError::GenerationFailed { cause })?;

        Ok(context.with_block(BlockKind::ArtifactDescription, summary)?)
    }
}
