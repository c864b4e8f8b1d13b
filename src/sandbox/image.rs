//! Execution image provisioning.
//!
//! The image is cached on the host across runs. Its build context is
//! hashed and the digest stored as an image label; a rebuild happens only
//! when the image is missing or the label no longer matches.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::ContainerRuntime;
use crate::error::{ProvisionError, RuntimeError};

/// Image label carrying the build context digest.
pub const CONTEXT_HASH_LABEL: &str = "secure-analyzer.context-hash";

/// Build definition expected at the root of the build context.
const BUILD_DEFINITION: &str = "Dockerfile";

#[derive(Debug, Clone, PartialEq)]
pub struct ImageReference {
    pub name: String,
    pub tag: String,
    pub build_context: PathBuf,
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// Ensures the execution image exists and matches its build context.
pub struct ImageProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    build_timeout: Duration,
}

impl ImageProvisioner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, build_timeout: Duration) -> Self {
        Self {
            runtime,
            build_timeout,
        }
    }

    /// Builds the image unless an up-to-date one is already present.
    ///
    /// Idempotent: with an unchanged build context, repeated calls do not
    /// rebuild.
    pub async fn ensure_image(&self, image: &ImageReference) -> Result<(), ProvisionError> {
        let context = image.build_context.clone();
        let digest = tokio::task::spawn_blocking(move || context_digest(&context))
            .await
            .map_err(|e| ProvisionError::ContextMissing {
                path: image.build_context.clone(),
                reason: format!("hashing task failed: {e}"),
            })??;

        let reference = image.to_string();
        match self.runtime.image_label(&reference, CONTEXT_HASH_LABEL).await {
            Ok(Some(existing)) if existing == digest => {
                info!("Image {reference} is up to date");
                return Ok(());
            }
            Ok(Some(_)) => info!("Image {reference} is stale, rebuilding"),
            Ok(None) => info!("Image {reference} not found, building"),
            Err(e) => warn!("Cannot inspect image {reference} ({e}), building"),
        }

        debug!(
            "Building {reference} from {} (context digest {digest})",
            image.build_context.display()
        );
        let labels = [(CONTEXT_HASH_LABEL.to_string(), digest)];
        self.runtime
            .build_image(&reference, &image.build_context, &labels, self.build_timeout)
            .await
            .map_err(|e| ProvisionError::BuildFailed {
                stderr: match e {
                    RuntimeError::Failed { stderr, .. } => stderr,
                    other => other.to_string(),
                },
            })?;

        info!("Image {reference} built successfully");
        Ok(())
    }
}

/// SHA-256 over every file in the build context (relative path and
/// contents, in sorted order).
pub fn context_digest(context: &Path) -> Result<String, ProvisionError> {
    let missing = |reason: String| ProvisionError::ContextMissing {
        path: context.to_path_buf(),
        reason,
    };

    if !context.is_dir() {
        return Err(missing("not a directory".to_string()));
    }
    if !context.join(BUILD_DEFINITION).is_file() {
        return Err(missing(format!("no {BUILD_DEFINITION} found")));
    }

    let mut hasher = Sha256::new();
    for entry in WalkDir::new(context).sort_by_file_name() {
        let entry = entry.map_err(|e| missing(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(context)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        let contents = std::fs::read(entry.path())
            .map_err(|e| missing(format!("{}: {e}", entry.path().display())))?;
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        hasher.update(&contents);
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRuntime;

    fn build_context() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM python:3.11-slim\n").unwrap();
        dir
    }

    fn reference(dir: &Path) -> ImageReference {
        ImageReference {
            name: "python_sandbox".to_string(),
            tag: "latest".to_string(),
            build_context: dir.to_path_buf(),
        }
    }

    // ── context_digest ──────────────────────────────────

    #[test]
    fn test_digest_is_stable() {
        let dir = build_context();
        assert_eq!(
            context_digest(dir.path()).unwrap(),
            context_digest(dir.path()).unwrap()
        );
    }

    #[test]
    fn test_digest_changes_with_content() {
        let dir = build_context();
        let before = context_digest(dir.path()).unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "pandas\n").unwrap();
        assert_ne!(before, context_digest(dir.path()).unwrap());
    }

    #[test]
    fn test_digest_missing_directory() {
        let err = context_digest(Path::new("/nonexistent/docker")).unwrap_err();
        assert!(matches!(err, ProvisionError::ContextMissing { .. }));
    }

    #[test]
    fn test_digest_requires_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README"), "no build here").unwrap();
        let err = context_digest(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Dockerfile"));
    }

    // ── ensure_image ────────────────────────────────────

    #[tokio::test]
    async fn test_ensure_image_is_idempotent() {
        let dir = build_context();
        let runtime = Arc::new(FakeRuntime::new());
        let provisioner = ImageProvisioner::new(runtime.clone(), Duration::from_secs(60));
        let image = reference(dir.path());

        provisioner.ensure_image(&image).await.unwrap();
        provisioner.ensure_image(&image).await.unwrap();
        assert_eq!(runtime.calls().builds, 1);
    }

    #[tokio::test]
    async fn test_ensure_image_rebuilds_when_context_changes() {
        let dir = build_context();
        let runtime = Arc::new(FakeRuntime::new());
        let provisioner = ImageProvisioner::new(runtime.clone(), Duration::from_secs(60));
        let image = reference(dir.path());

        provisioner.ensure_image(&image).await.unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM python:3.12-slim\n").unwrap();
        provisioner.ensure_image(&image).await.unwrap();
        assert_eq!(runtime.calls().builds, 2);
    }

    #[tokio::test]
    async fn test_ensure_image_missing_context_never_builds() {
        let runtime = Arc::new(FakeRuntime::new());
        let provisioner = ImageProvisioner::new(runtime.clone(), Duration::from_secs(60));
        let image = reference(Path::new("/nonexistent/docker"));

        let err = provisioner.ensure_image(&image).await.unwrap_err();
        assert!(matches!(err, ProvisionError::ContextMissing { .. }));
        assert_eq!(runtime.calls().builds, 0);
    }

    #[tokio::test]
    async fn test_build_failure_carries_stderr() {
        let dir = build_context();
        let runtime = Arc::new(FakeRuntime::new().fail_build("pip: command not found"));
        let provisioner = ImageProvisioner::new(runtime.clone(), Duration::from_secs(60));

        let err = provisioner
            .ensure_image(&reference(dir.path()))
            .await
            .unwrap_err();
        match err {
            ProvisionError::BuildFailed { stderr } => {
                assert_eq!(stderr, "pip: command not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
