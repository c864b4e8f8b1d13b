//! In-memory doubles for the container runtime and the generation service.
//!
//! `FakeRuntime` keeps just enough state (images with labels, live
//! containers) for the lifecycle logic to behave as it would against the
//! `docker` CLI, and counts every call so tests can assert on side effects.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::llm::{LlmClient, LlmResponse, Message};
use crate::sandbox::{ContainerRuntime, ExecOutput, ExecRequest, IsolationPolicy};

/// Number of calls per runtime operation.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct RuntimeCalls {
    pub image_inspects: usize,
    pub builds: usize,
    pub exists_checks: usize,
    pub starts: usize,
    pub removes: usize,
    pub blocking_removes: usize,
    pub copies: usize,
    pub execs: usize,
}

impl RuntimeCalls {
    pub fn total(&self) -> usize {
        self.image_inspects
            + self.builds
            + self.exists_checks
            + self.starts
            + self.removes
            + self.blocking_removes
            + self.copies
            + self.execs
    }
}

enum ExecBehavior {
    Output(ExecOutput),
    Timeout,
    Hang,
}

#[derive(Default)]
struct State {
    calls: RuntimeCalls,
    images: HashMap<String, HashMap<String, String>>,
    containers: HashSet<String>,
    last_start_command: Vec<String>,
    copied_targets: Vec<String>,
    exec_stdins: Vec<String>,
}

pub struct FakeRuntime {
    state: Mutex<State>,
    build_error: Option<String>,
    start_error: Option<String>,
    remove_error: Option<String>,
    copy_error: Option<String>,
    start_hangs: bool,
    exec: ExecBehavior,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            build_error: None,
            start_error: None,
            remove_error: None,
            copy_error: None,
            start_hangs: false,
            exec: ExecBehavior::Output(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: Some(0),
            }),
        }
    }

    pub fn with_existing_container(self, name: &str) -> Self {
        self.state.lock().unwrap().containers.insert(name.to_string());
        self
    }

    pub fn fail_build(mut self, stderr: &str) -> Self {
        self.build_error = Some(stderr.to_string());
        self
    }

    pub fn fail_start(mut self, stderr: &str) -> Self {
        self.start_error = Some(stderr.to_string());
        self
    }

    pub fn fail_remove(mut self, stderr: &str) -> Self {
        self.remove_error = Some(stderr.to_string());
        self
    }

    pub fn fail_copy(mut self, stderr: &str) -> Self {
        self.copy_error = Some(stderr.to_string());
        self
    }

    pub fn with_exec_output(mut self, stdout: &str) -> Self {
        self.exec = ExecBehavior::Output(ExecOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        });
        self
    }

    pub fn with_exec_failure(mut self, exit_code: i32, stderr: &str) -> Self {
        self.exec = ExecBehavior::Output(ExecOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: Some(exit_code),
        });
        self
    }

    pub fn exec_times_out(mut self) -> Self {
        self.exec = ExecBehavior::Timeout;
        self
    }

    /// Exec never returns; used to interrupt a run mid-flight.
    /// `docker run` never returns, as with a wedged daemon.
    pub fn start_hangs(mut self) -> Self {
        self.start_hangs = true;
        self
    }

    pub fn exec_hangs(mut self) -> Self {
        self.exec = ExecBehavior::Hang;
        self
    }

    pub fn calls(&self) -> RuntimeCalls {
        self.state.lock().unwrap().calls
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state.lock().unwrap().containers.contains(name)
    }

    /// Simulates a container disappearing behind our back.
    pub fn forget_container(&self, name: &str) {
        self.state.lock().unwrap().containers.remove(name);
    }

    pub fn last_start_command(&self) -> Vec<String> {
        self.state.lock().unwrap().last_start_command.clone()
    }

    pub fn copied_targets(&self) -> Vec<String> {
        self.state.lock().unwrap().copied_targets.clone()
    }

    pub fn exec_stdins(&self) -> Vec<String> {
        self.state.lock().unwrap().exec_stdins.clone()
    }

    fn failed(command: &str, stderr: &str) -> RuntimeError {
        RuntimeError::Failed {
            command: command.to_string(),
            code: Some(1),
            stderr: stderr.to_string(),
        }
    }

    fn remove(&self, name: &str) -> Result<bool, RuntimeError> {
        if let Some(ref stderr) = self.remove_error {
            return Err(Self::failed("docker rm", stderr));
        }
        Ok(self.state.lock().unwrap().containers.remove(name))
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_label(&self, image: &str, label: &str) -> Result<Option<String>, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.image_inspects += 1;
        Ok(state
            .images
            .get(image)
            .map(|labels| labels.get(label).cloned().unwrap_or_default()))
    }

    async fn build_image(
        &self,
        image: &str,
        _context: &Path,
        labels: &[(String, String)],
        _timeout: Duration,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.builds += 1;
        if let Some(ref stderr) = self.build_error {
            return Err(Self::failed("docker build", stderr));
        }
        state
            .images
            .insert(image.to_string(), labels.iter().cloned().collect());
        Ok(())
    }

    async fn container_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.exists_checks += 1;
        Ok(state.containers.contains(name))
    }

    async fn start_container(
        &self,
        name: &str,
        _image: &str,
        _policy: &IsolationPolicy,
        command: &[&str],
    ) -> Result<(), RuntimeError> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.starts += 1;
            state.last_start_command = command.iter().map(|s| s.to_string()).collect();
        }
        if self.start_hangs {
            std::future::pending::<()>().await;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(ref stderr) = self.start_error {
            return Err(Self::failed("docker run", stderr));
        }
        state.containers.insert(name.to_string());
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<bool, RuntimeError> {
        self.state.lock().unwrap().calls.removes += 1;
        self.remove(name)
    }

    fn remove_container_blocking(&self, name: &str) -> Result<bool, RuntimeError> {
        self.state.lock().unwrap().calls.blocking_removes += 1;
        self.remove(name)
    }

    async fn copy_into(&self, name: &str, _source: &Path, target: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.copies += 1;
        if let Some(ref stderr) = self.copy_error {
            return Err(Self::failed("docker cp", stderr));
        }
        if !state.containers.contains(name) {
            return Err(Self::failed("docker cp", "No such container"));
        }
        state.copied_targets.push(target.to_string());
        Ok(())
    }

    async fn exec(&self, _name: &str, request: &ExecRequest) -> Result<ExecOutput, RuntimeError> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.execs += 1;
            if let Some(ref stdin) = request.stdin {
                state.exec_stdins.push(stdin.clone());
            }
        }
        match self.exec {
            ExecBehavior::Output(ref output) => Ok(output.clone()),
            ExecBehavior::Timeout => Err(RuntimeError::Timeout {
                command: "docker exec".to_string(),
                seconds: request.timeout.as_secs(),
            }),
            ExecBehavior::Hang => std::future::pending().await,
        }
    }
}

/// One request seen by [`ScriptedLlm`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub system: String,
    pub prompt: String,
}

/// Generation service double that replays canned responses in order.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    delay: Option<Duration>,
}

impl ScriptedLlm {
    pub fn new<'a>(responses: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(|r| Ok(r.to_string())).collect()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Every call fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from([Err(message.to_string())])),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, system_prompt: &str, messages: &[Message]) -> anyhow::Result<LlmResponse> {
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.requests.lock().unwrap().push(RecordedRequest {
            system: system_prompt.to_string(),
            prompt,
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = {
            let mut responses = self.responses.lock().unwrap();
            // failures repeat
            if matches!(responses.front(), Some(Err(_))) {
                responses.front().cloned()
            } else {
                responses.pop_front()
            }
        };
        match next {
            Some(Ok(text)) => Ok(LlmResponse {
                text,
                input_tokens: 0,
                output_tokens: 0,
            }),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted response left")),
        }
    }

    fn description(&self) -> String {
        "scripted".to_string()
    }
}

/// Writes a minimal image build context into a fresh temp dir.
pub fn build_context() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("Dockerfile"), "FROM python:3.11-slim\n").unwrap();
    dir
}

/// Writes the ten-row traffic CSV used across run tests.
pub fn traffic_csv(dir: &Path) -> PathBuf {
    let path = dir.join("traffic.csv");
    let mut content = "accidents,traffic_density\n".to_string();
    for i in 0..10 {
        content.push_str(&format!("{},{}\n", 3 + i * 2, 40 + i * 15));
    }
    std::fs::write(&path, content).unwrap();
    path
}
