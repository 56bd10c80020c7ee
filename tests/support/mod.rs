//! Shared fakes for deployer and reconciler integration tests.
//!
//! The mock runtime keeps a container/image table in memory and records
//! every operation in order, so tests can assert on sequencing (green starts
//! before blue stops, router flips before drain, etc.) without Docker.

#![allow(dead_code)]

use async_trait::async_trait;
use buildvigil_agent::api::{ControlPlane, DesiredState, HeartbeatRequest, Service};
use buildvigil_agent::docker::{ContainerRuntime, DockerError, ImageInfo};
use buildvigil_agent::error::{Error, Result};
use buildvigil_agent::vcs::Vcs;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub image_tag: String,
    pub host_port: u16,
    pub container_port: u16,
    pub env: HashMap<String, String>,
    pub status: String,
}

#[derive(Default)]
pub struct MockRuntime {
    pub containers: Mutex<HashMap<String, MockContainer>>,
    pub images: Mutex<Vec<ImageInfo>>,
    pub events: Mutex<Vec<String>>,
    /// Next build fails when set.
    pub fail_build: AtomicBool,
    /// Next run fails when set.
    pub fail_run: AtomicBool,
    /// Containers start as "exited" instead of "running" when set.
    pub start_exited: AtomicBool,
    counter: AtomicU64,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn container(&self, name: &str) -> Option<MockContainer> {
        self.containers.lock().get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.containers.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record(&self, event: String) {
        self.events.lock().push(event);
    }

    fn command_failed(message: &str) -> DockerError {
        DockerError::Failed {
            command: "docker (mock)".to_string(),
            exit_code: Some(1),
            stderr: message.to_string(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn build_image(
        &self,
        _context: &Path,
        _dockerfile: &Path,
        image_tag: &str,
    ) -> std::result::Result<(), DockerError> {
        if self.fail_build.load(Ordering::SeqCst) {
            return Err(Self::command_failed("mock build failure"));
        }
        let n = self.next();
        self.record(format!("build:{}", image_tag));
        self.images.lock().push(ImageInfo {
            tag: image_tag.to_string(),
            id: format!("img-{}", n),
            created_at: format!("2024-01-01 00:{:02}:{:02} +0000 UTC", n / 60, n % 60),
        });
        Ok(())
    }

    async fn run_container(
        &self,
        name: &str,
        image_tag: &str,
        host_port: u16,
        container_port: u16,
        env: &HashMap<String, String>,
    ) -> std::result::Result<String, DockerError> {
        if self.fail_run.load(Ordering::SeqCst) {
            return Err(Self::command_failed("mock run failure"));
        }
        let id = format!("ctr-{}", self.next());
        self.record(format!("run:{}:{}", name, host_port));
        let status = if self.start_exited.load(Ordering::SeqCst) {
            "exited"
        } else {
            "running"
        };
        self.containers.lock().insert(
            name.to_string(),
            MockContainer {
                id: id.clone(),
                image_tag: image_tag.to_string(),
                host_port,
                container_port,
                env: env.clone(),
                status: status.to_string(),
            },
        );
        Ok(id)
    }

    async fn stop_container(&self, name: &str) -> std::result::Result<(), DockerError> {
        self.record(format!("stop:{}", name));
        self.containers.lock().remove(name);
        Ok(())
    }

    async fn rename_container(&self, old: &str, new: &str) -> std::result::Result<(), DockerError> {
        self.record(format!("rename:{}:{}", old, new));
        let mut containers = self.containers.lock();
        match containers.remove(old) {
            Some(container) => {
                containers.insert(new.to_string(), container);
                Ok(())
            }
            None => Err(Self::command_failed("no such container")),
        }
    }

    async fn container_status(&self, name: &str) -> std::result::Result<String, DockerError> {
        Ok(self
            .containers
            .lock()
            .get(name)
            .map(|c| c.status.clone())
            .unwrap_or_else(|| "stopped".to_string()))
    }

    async fn container_exists(&self, name: &str) -> bool {
        self.containers.lock().contains_key(name)
    }

    async fn mapped_host_port(
        &self,
        name: &str,
        _container_port: u16,
    ) -> std::result::Result<Option<u16>, DockerError> {
        Ok(self.containers.lock().get(name).map(|c| c.host_port))
    }

    async fn list_images(&self, tag_prefix: &str) -> std::result::Result<Vec<ImageInfo>, DockerError> {
        Ok(self
            .images
            .lock()
            .iter()
            .filter(|image| image.tag.starts_with(tag_prefix))
            .cloned()
            .collect())
    }

    async fn remove_image(&self, image_id: &str) -> std::result::Result<(), DockerError> {
        self.record(format!("rmi:{}", image_id));
        self.images.lock().retain(|image| image.id != image_id);
        Ok(())
    }
}

/// Fake VCS: hands out a configured commit per service and records removals.
#[derive(Default)]
pub struct MockVcs {
    pub commits: Mutex<HashMap<String, String>>,
    pub removed: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl MockVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_commit(&self, service_id: &str, commit: &str) {
        self.commits
            .lock()
            .insert(service_id.to_string(), commit.to_string());
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }
}

#[async_trait]
impl Vcs for MockVcs {
    async fn clone_or_pull(&self, service: &Service) -> Result<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Config("mock vcs failure".to_string()));
        }
        Ok(self
            .commits
            .lock()
            .get(&service.id)
            .cloned()
            .unwrap_or_else(|| "commit-0".to_string()))
    }

    async fn remove_repo(&self, service_id: &str) -> Result<()> {
        self.removed.lock().push(service_id.to_string());
        Ok(())
    }

    fn repo_path(&self, service_id: &str) -> PathBuf {
        PathBuf::from("/tmp/mock-repos").join(service_id)
    }
}

/// Fake control plane: serves a configurable desired state and records
/// heartbeats.
#[derive(Default)]
pub struct MockControlPlane {
    pub desired: Mutex<DesiredState>,
    pub heartbeats: Mutex<Vec<HeartbeatRequest>>,
    pub fail_fetch: AtomicBool,
}

impl MockControlPlane {
    pub fn new(desired: DesiredState) -> Self {
        Self {
            desired: Mutex::new(desired),
            heartbeats: Mutex::new(Vec::new()),
            fail_fetch: AtomicBool::new(false),
        }
    }

    pub fn set_desired(&self, desired: DesiredState) {
        *self.desired.lock() = desired;
    }

    pub fn heartbeats(&self) -> Vec<HeartbeatRequest> {
        self.heartbeats.lock().clone()
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn get_desired_state(&self, _stack_id: &str) -> Result<DesiredState> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Error::ControlPlane("mock fetch failure".to_string()));
        }
        Ok(self.desired.lock().clone())
    }

    async fn send_heartbeat(&self, req: &HeartbeatRequest) -> Result<()> {
        self.heartbeats.lock().push(req.clone());
        Ok(())
    }
}
