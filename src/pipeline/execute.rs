//! Execution stage: program synthesis plus a single in-sandbox run.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::context::Context;
use super::generate::Generator;
use super::{ExecutionResult, ExecutionStage};
use crate::error::{ExecError, ExecPhase, GenerationError, RuntimeError};
use crate::sandbox::{ExecRequest, SandboxHandle};

const SYSTEM_PROMPT: &str = "\
You write Python 3 programs that answer questions about a data file.
The program runs in an isolated container with no network access. \
Only the standard library, pandas, numpy and scipy are installed. \
The data file is in the current working directory; use the file name given \
in the context. Write temporary files only under /tmp.
Print the final answer to stdout as plain text, including the numbers that \
support it. Reply with exactly one ```python code block and nothing else.";

/// Placeholder result when the program succeeds silently.
const NO_OUTPUT: &str = "(the analysis program completed without printing a result)";

/// Extracts the program from a model reply: the first ```python block,
/// else the first fenced block, else the whole reply.
pub fn extract_program(reply: &str) -> Option<String> {
    let fenced = reply
        .find("```python")
        .or_else(|| reply.find("```py"))
        .or_else(|| reply.find("```"))
        .map(|start| {
            let after = &reply[start + 3..];
            let first_line = after.split('\n').next().unwrap_or_default();
            if let Some(end) = first_line.find("```") {
                // One-line block, e.g. ```python print(1)```
                let inline = &first_line[..end];
                return match inline.split_once(char::is_whitespace) {
                    Some((tag, rest)) if is_python_tag(tag) => rest,
                    _ => inline,
                };
            }
            // Skip the language tag line
            let body = after.find('\n').map_or("", |nl| &after[nl + 1..]);
            body.find("```").map_or(body, |end| &body[..end])
        });
    let program = fenced.unwrap_or(reply).trim();
    (!program.is_empty()).then(|| program.to_string())
}

fn is_python_tag(tag: &str) -> bool {
    matches!(tag.to_ascii_lowercase().as_str(), "" | "py" | "python" | "python3")
}

/// Execution stage that runs generated Python with `python3 -` in the
/// sandbox work directory.
pub struct CodeExecutor {
    generator: Generator,
    timeout: Duration,
    max_output_bytes: usize,
}

impl CodeExecutor {
    pub fn new(generator: Generator, timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            generator,
            timeout,
            max_output_bytes,
        }
    }
}

#[async_trait]
impl ExecutionStage for CodeExecutor {
    async fn execute(
        &self,
        sandbox: &SandboxHandle,
        context: Context,
        question: &str,
    ) -> Result<ExecutionResult, ExecError> {
        info!("Generating program with {}", self.generator.description());
        let reply = self
            .generator
            .generate(SYSTEM_PROMPT, &context, question)
            .await
            .map_err(|cause| match cause {
                GenerationError::Timeout { seconds } => ExecError::Timeout {
                    phase: ExecPhase::Generation,
                    seconds,
                },
                cause => ExecError::GenerationFailed { cause },
            })?;

        let program = extract_program(&reply).ok_or(ExecError::GenerationFailed {
            cause: GenerationError::Empty,
        })?;
        debug!("Generated program:\n{program}");

        let request = ExecRequest {
            command: vec!["python3".to_string(), "-".to_string()],
            stdin: Some(program.clone()),
            workdir: Some(sandbox.workdir().to_string()),
            timeout: self.timeout,
            max_output_bytes: self.max_output_bytes,
        };

        info!(
            "Running program ({} lines) in sandbox {}",
            program.lines().count(),
            sandbox.name()
        );
        let output = sandbox.exec(&request).await.map_err(|e| match e {
            RuntimeError::Timeout { seconds, .. } => ExecError::Timeout {
                phase: ExecPhase::Execution,
                seconds,
            },
            other => ExecError::SandboxExecutionFailed {
                exit_code: None,
                stderr: other.to_string(),
            },
        })?;

        if !output.success() {
            warn!(
                "Program exited with {:?} in sandbox {}",
                output.exit_code,
                sandbox.name()
            );
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            return Err(ExecError::SandboxExecutionFailed {
                exit_code: output.exit_code,
                stderr: detail,
            });
        }

        let text = match output.stdout.trim() {
            "" => NO_OUTPUT.to_string(),
            text => text.to_string(),
        };
        Ok(ExecutionResult { text, program })
    }
}
