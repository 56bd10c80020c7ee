//! Container runtime access.
//!
//! All Docker interactions go through the [`ContainerRuntime`] trait so the
//! deployer and reconciler can be exercised against an in-memory fake. The
//! production implementation, [`DockerCli`], shells out to the `docker`
//! binary with bounded timeouts.

mod client;
mod error;

pub use client::DockerCli;
pub use error::DockerError;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

/// A locally stored image, as reported by `docker images`.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub tag: String,
    pub id: String,
    /// Raw creation timestamp string from Docker (e.g.
    /// `2024-01-02 15:04:05 -0700 MST`).
    pub created_at: String,
}

/// Operations the deployer needs from a container runtime.
///
/// Every method is a single bounded operation; the trait carries no
/// deployment logic. Stop is idempotent on missing containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build an image from a Dockerfile. Errors carry build output.
    async fn build_image(
        &self,
        context: &Path,
        dockerfile: &Path,
        image_tag: &str,
    ) -> Result<(), DockerError>;

    /// Start a detached container publishing `host_port` -> `container_port`.
    /// Returns the container id.
    async fn run_container(
        &self,
        name: &str,
        image_tag: &str,
        host_port: u16,
        container_port: u16,
        env: &HashMap<String, String>,
    ) -> Result<String, DockerError>;

    /// SIGTERM with a 10 s grace window, then force-remove. `Ok(())` when the
    /// container doesn't exist.
    async fn stop_container(&self, name: &str) -> Result<(), DockerError>;

    async fn rename_container(&self, old: &str, new: &str) -> Result<(), DockerError>;

    /// Container state string ("running", "exited", ...); "stopped" when the
    /// container doesn't exist.
    async fn container_status(&self, name: &str) -> Result<String, DockerError>;

    async fn container_exists(&self, name: &str) -> bool;

    /// Host port published for `container_port`, if any.
    async fn mapped_host_port(
        &self,
        name: &str,
        container_port: u16,
    ) -> Result<Option<u16>, DockerError>;

    /// Images whose `repository:tag` starts with `tag_prefix`.
    async fn list_images(&self, tag_prefix: &str) -> Result<Vec<ImageInfo>, DockerError>;

    async fn remove_image(&self, image_id: &str) -> Result<(), DockerError>;

    /// Spawn a `docker logs --follow` child with piped stdout/stderr for log
    /// capture. Runtimes that cannot stream return `Ok(None)`.
    async fn follow_logs(
        &self,
        _container: &str,
    ) -> Result<Option<tokio::process::Child>, DockerError> {
        Ok(None)
    }
}
