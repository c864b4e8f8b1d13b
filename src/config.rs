use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::sandbox::{ConflictPolicy, ImageReference, IsolationPolicy, SandboxSpec, ScratchSpace};

/// Config file picked up when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "config/analyzer.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `openai` or `anthropic`
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model used to describe the artifact
    #[serde(default = "default_context_model")]
    pub context_model: String,
    /// Model used to write the analysis program
    #[serde(default = "default_code_model")]
    pub code_model: String,
    /// Supports ${ENV_VAR} substitution. Falls back to `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the credential
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Override for the provider's API base URL
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens_per_request: u32,
    /// Reasoning effort for the code model (OpenAI reasoning models only)
    #[serde(default = "default_reasoning_effort")]
    pub reasoning_effort: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default = "default_image_name")]
    pub name: String,
    #[serde(default = "default_image_tag")]
    pub tag: String,
    /// Directory holding the Dockerfile
    #[serde(default = "default_build_context")]
    pub build_context: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container engine CLI
    pub docker_binary: String,
    /// Fixed container name. A unique name is generated per run when unset.
    pub name: Option<String>,
    pub name_prefix: String,
    /// What to do when a container with the same name already exists
    pub on_conflict: ConflictPolicy,
    /// Directory inside the container where the artifact is copied
    pub workdir: String,
    pub process_limit: u32,
    pub scratch_mount: String,
    /// tmpfs size, e.g. "64m"
    pub scratch_size: String,
    /// e.g. "512m", "1g"
    pub memory_limit: Option<String>,
    pub cpus: Option<f64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    pub generation_timeout_secs: u64,
    pub execution_timeout_secs: u64,
    pub build_timeout_secs: u64,
    /// Deadline for short docker calls (inspect, run, cp, rm)
    pub command_timeout_secs: u64,
    pub max_context_blocks: usize,
    pub max_block_bytes: usize,
    /// Artifacts up to this size are sent to the context model whole
    pub inline_artifact_bytes: u64,
    /// Data rows included in the preview of larger artifacts
    pub preview_rows: usize,
    pub max_output_bytes: usize,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_context_model() -> String {
    "gpt-4o".to_string()
}

fn default_code_model() -> String {
    "o3-mini".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_reasoning_effort() -> Option<String> {
    Some("high".to_string())
}

fn default_image_name() -> String {
    "python_sandbox".to_string()
}

fn default_image_tag() -> String {
    "latest".to_string()
}

fn default_build_context() -> PathBuf {
    PathBuf::from("resources/docker")
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            context_model: default_context_model(),
            code_model: default_code_model(),
            api_key: None,
            api_key_env: None,
            base_url: None,
            max_tokens_per_request: default_max_tokens(),
            reasoning_effort: default_reasoning_effort(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            name: default_image_name(),
            tag: default_image_tag(),
            build_context: default_build_context(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            name: None,
            name_prefix: "analyzer-sandbox".to_string(),
            on_conflict: ConflictPolicy::Replace,
            workdir: "/home/sandboxuser".to_string(),
            process_limit: 64,
            scratch_mount: "/tmp".to_string(),
            scratch_size: "64m".to_string(),
            memory_limit: None,
            cpus: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            generation_timeout_secs: 120,
            execution_timeout_secs: 60,
            build_timeout_secs: 600,
            command_timeout_secs: 30,
            max_context_blocks: 8,
            max_block_bytes: 16 * 1024,
            inline_artifact_bytes: 8 * 1024,
            preview_rows: 10,
            max_output_bytes: 64 * 1024,
        }
    }
}

/// API credential for the generation service. Never printed.
#[derive(Clone, PartialEq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl LlmConfig {
    /// Environment variable consulted when `api_key` is not set.
    pub fn credential_env_var(&self) -> String {
        if let Some(ref var) = self.api_key_env {
            return var.clone();
        }
        match self.provider.as_str() {
            "anthropic" => "ANTHROPIC_API_KEY".to_string(),
            _ => "OPENAI_API_KEY".to_string(),
        }
    }

    /// Resolves the credential from the config value or the environment.
    /// Blank values count as absent.
    pub fn resolve_credential(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Option<Credential> {
        self.api_key
            .clone()
            .or_else(|| lookup(&self.credential_env_var()))
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .map(Credential::new)
    }
}

impl ImageConfig {
    pub fn reference(&self) -> ImageReference {
        ImageReference {
            name: self.name.clone(),
            tag: self.tag.clone(),
            build_context: self.build_context.clone(),
        }
    }
}

impl SandboxConfig {
    /// Container name for this run: the fixed name if configured,
    /// otherwise the prefix plus a random suffix.
    pub fn container_name(&self) -> String {
        match self.name {
            Some(ref name) => name.clone(),
            None => {
                let id = uuid::Uuid::new_v4().simple().to_string();
                format!("{}-{}", self.name_prefix, &id[..12])
            }
        }
    }

    pub fn policy(&self) -> IsolationPolicy {
        let mut policy = IsolationPolicy::new(
            self.process_limit,
            ScratchSpace {
                mount_point: self.scratch_mount.clone(),
                size: self.scratch_size.clone(),
            },
        );
        if let Some(ref memory) = self.memory_limit {
            policy = policy.with_memory_limit(memory.clone());
        }
        if let Some(cpus) = self.cpus {
            policy = policy.with_cpus(cpus);
        }
        policy
    }
}

impl LimitsConfig {
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        // Expand environment variables like ${OPENAI_API_KEY}
        let expanded = shellexpand::env(&content).map_err(|e| ConfigError::Expand {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        toml::from_str(&expanded).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads the given file, or the default path if it exists,
    /// or falls back to built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.is_file() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Everything needed to start this run's sandbox.
    pub fn sandbox_spec(&self) -> SandboxSpec {
        SandboxSpec {
            name: self.sandbox.container_name(),
            image: self.image.reference(),
            policy: self.sandbox.policy(),
            workdir: self.sandbox.workdir.clone(),
            on_conflict: self.sandbox.on_conflict,
        }
    }
}
