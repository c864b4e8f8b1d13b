//! Declarative isolation policy for the sandbox container.
//!
//! Network access and added capabilities are not configurable: the
//! container always runs with `--network none` and `--cap-drop ALL`.
//! Only the resource ceilings can be tuned.

use std::fmt;

/// Ephemeral writable area mounted as tmpfs.
#[derive(Debug, Clone, PartialEq)]
pub struct ScratchSpace {
    /// Mount point inside the container, e.g. `/tmp`
    pub mount_point: String,
    /// tmpfs size bound, e.g. `64m`
    pub size: String,
}

/// Restrictions enforced on a sandbox. There are no setters: a policy is
/// frozen once built and each `SandboxHandle` keeps its own copy.
#[derive(Debug, Clone, PartialEq)]
pub struct IsolationPolicy {
    process_limit: u32,
    scratch: ScratchSpace,
    memory_limit: Option<String>,
    cpus: Option<f64>,
}

impl Default for IsolationPolicy {
    fn default() -> Self {
        Self::new(
            64,
            ScratchSpace {
                mount_point: "/tmp".to_string(),
                size: "64m".to_string(),
            },
        )
    }
}

/// One-line summary for logs, e.g.
/// `network none, caps none, pids<=64, scratch /tmp:64m, memory 512m, cpus 1`.
impl fmt::Display for IsolationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let network = if self.network_disabled() { "none" } else { "bridge" };
        let caps = if self.added_capabilities().is_empty() {
            "none".to_string()
        } else {
            self.added_capabilities().join(",")
        };
        write!(
            f,
            "network {network}, caps {caps}, pids<={}, scratch {}:{}",
            self.process_limit(),
            self.scratch().mount_point,
            self.scratch().size
        )?;
        if let Some(memory) = self.memory_limit() {
            write!(f, ", memory {memory}")?;
        }
        if let Some(cpus) = self.cpus() {
            write!(f, ", cpus {cpus}")?;
        }
        Ok(())
    }
}

impl IsolationPolicy {
    pub fn new(process_limit: u32, scratch: ScratchSpace) -> Self {
        Self {
            process_limit,
            scratch,
            memory_limit: None,
            cpus: None,
        }
    }

    #[must_use]
    pub fn with_memory_limit(mut self, limit: impl Into<String>) -> Self {
        self.memory_limit = Some(limit.into());
        self
    }

    #[must_use]
    pub fn with_cpus(mut self, cpus: f64) -> Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn network_disabled(&self) -> bool {
        true
    }

    /// Capabilities added on top of the empty set. Always empty.
    pub fn added_capabilities(&self) -> &[String] {
        &[]
    }

    pub fn process_limit(&self) -> u32 {
        self.process_limit
    }

    pub fn scratch(&self) -> &ScratchSpace {
        &self.scratch
    }

    pub fn memory_limit(&self) -> Option<&str> {
        self.memory_limit.as_deref()
    }

    pub fn cpus(&self) -> Option<f64> {
        self.cpus
    }

    /// `docker run` flags enforcing this policy.
    pub fn to_docker_args(&self) -> Vec<String> {
        let mut args = vec![
            "--network".to_string(),
            "none".to_string(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--pids-limit".to_string(),
            self.process_limit.to_string(),
            "--tmpfs".to_string(),
            format!("{}:rw,size={}", self.scratch.mount_point, self.scratch.size),
        ];
        if let Some(ref memory) = self.memory_limit {
            // Same value for swap so the container cannot swap past the limit
            args.extend([
                "--memory".to_string(),
                memory.clone(),
                "--memory-swap".to_string(),
                memory.clone(),
            ]);
        }
        if let Some(cpus) = self.cpus {
            args.extend(["--cpus".to_string(), cpus.to_string()]);
        }
        args
    }
}
