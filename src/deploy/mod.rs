//! Blue/green deployment engine.
//!
//! One deployer instance owns the in-memory container table for every
//! managed service. Deploys are strictly sequential per service:
//! build < start < health < promote < drain < retire. The router is updated
//! only after the replacement container has passed its health check, and the
//! previous container is stopped only after the router switch plus a bounded
//! drain window. A health failure on the replacement leaves the router and
//! the running container untouched (rollback by inaction).

use crate::api::Service;
use crate::docker::{ContainerRuntime, ImageInfo};
use crate::dockerfile::DockerfileGenerator;
use crate::error::{Error, Result};
use crate::lifecycle::{LifecycleMap, LifecycleStatus};
use crate::ports::{PortAllocator, PortPair};
use crate::secrets::SecretStore;
use crate::state::{ProcessStatus, ServiceProcess, StateStore};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const CONTAINER_PREFIX: &str = "buildvigil";
pub const IMAGE_PREFIX: &str = "buildvigil";
pub const IMAGE_RETAIN_DEFAULT: u32 = 5;

/// Callback used to promote a freshly health-checked port into the router.
pub type ProxyUpdater = Arc<dyn Fn(&str, u16) + Send + Sync>;

/// Deployment timing knobs. Defaults are the production constants; tests
/// shrink them.
#[derive(Debug, Clone)]
pub struct DeployTimeouts {
    /// Overall health-check deadline.
    pub health_check_timeout: Duration,
    /// Default delay between health probes when the service doesn't set one.
    pub health_check_interval: Duration,
    /// Per-attempt HTTP probe timeout.
    pub health_probe_timeout: Duration,
    /// Wait between router switch and stopping the old container.
    pub connection_drain: Duration,
}

impl Default for DeployTimeouts {
    fn default() -> Self {
        Self {
            health_check_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
            health_probe_timeout: Duration::from_secs(5),
            connection_drain: Duration::from_secs(30),
        }
    }
}

/// In-memory record of the active container for one service.
#[derive(Debug, Clone)]
struct ContainerInfo {
    container_name: String,
    image_tag: String,
    active_port: u16,
    pair: PortPair,
}

/// Result of [`Deployer::status`].
#[derive(Debug, Clone, Serialize)]
pub struct DeployedStatus {
    pub running: bool,
    pub container_name: Option<String>,
    pub image_tag: Option<String>,
    pub port: Option<u16>,
    pub status: String,
}

/// Shared HTTP client for health probes; per-request timeouts override the
/// pool default.
fn probe_client() -> &'static Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build health probe client")
    })
}

pub struct Deployer {
    repos_dir: PathBuf,
    state: Arc<StateStore>,
    secrets: Arc<SecretStore>,
    runtime: Arc<dyn ContainerRuntime>,
    ports: Arc<PortAllocator>,
    generator: DockerfileGenerator,
    lifecycle: LifecycleMap,
    containers: RwLock<HashMap<String, ContainerInfo>>,
    proxy_updater: RwLock<Option<ProxyUpdater>>,
    log_tasks: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
    log_retention: u32,
    timeouts: DeployTimeouts,
}

impl Deployer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repos_dir: impl Into<PathBuf>,
        state: Arc<StateStore>,
        secrets: Arc<SecretStore>,
        runtime: Arc<dyn ContainerRuntime>,
        ports: Arc<PortAllocator>,
        lifecycle: LifecycleMap,
        log_retention: u32,
    ) -> Self {
        Self {
            repos_dir: repos_dir.into(),
            state,
            secrets,
            runtime,
            ports,
            generator: DockerfileGenerator::new(),
            lifecycle,
            containers: RwLock::new(HashMap::new()),
            proxy_updater: RwLock::new(None),
            log_tasks: Mutex::new(HashMap::new()),
            log_retention,
            timeouts: DeployTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: DeployTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Install the router promotion callback. The reconciler wires this once
    /// at startup; the deployer never references the router directly.
    pub fn set_proxy_updater(&self, updater: ProxyUpdater) {
        *self.proxy_updater.write() = Some(updater);
    }

    pub fn container_name(service_id: &str) -> String {
        format!("{}-{}", CONTAINER_PREFIX, service_id)
    }

    pub fn image_tag(service_id: &str) -> String {
        format!("{}-{}:latest", IMAGE_PREFIX, service_id)
    }

    /// Whether the deployer currently tracks a container for the service.
    pub fn is_tracked(&self, service_id: &str) -> bool {
        self.containers.read().contains_key(service_id)
    }

    /// The port currently receiving traffic for the service.
    pub fn active_port(&self, service_id: &str) -> Option<u16> {
        self.containers
            .read()
            .get(service_id)
            .map(|info| info.active_port)
    }

    /// Deploy a service at `resolved_commit`: initial deploy when no
    /// container is tracked, blue/green otherwise.
    pub async fn deploy(&self, service: &Service, resolved_commit: &str) -> Result<()> {
        let existing = self.containers.read().get(&service.id).cloned();
        info!(
            service_id = %service.id,
            mode = if existing.is_some() { "blue_green" } else { "initial" },
            commit = %resolved_commit,
            "Deploy start"
        );

        let result = match existing {
            Some(current) if current.active_port != 0 => {
                self.blue_green_deploy(service, current, resolved_commit).await
            }
            _ => self.initial_deploy(service, resolved_commit).await,
        };

        if let Err(e) = &result {
            self.record_failure(service, resolved_commit, &e.to_string())
                .await;
        }
        result
    }

    async fn initial_deploy(&self, service: &Service, resolved_commit: &str) -> Result<()> {
        let start = std::time::Instant::now();
        let container_name = Self::container_name(&service.id);
        let image_tag = Self::image_tag(&service.id);

        self.lifecycle
            .set_status(&service.id, LifecycleStatus::Building);
        self.persist_transition(service, resolved_commit, ProcessStatus::Building, None)
            .await?;

        self.build_image(service, &image_tag).await?;

        let pair = self.ports.allocate(&service.id)?;
        let active_port = pair.blue_port;
        debug!(service_id = %service.id, port = active_port, "Port allocated");

        self.lifecycle
            .set_status(&service.id, LifecycleStatus::Deploying);
        let env = self.assemble_env(service)?;
        let container_port = service.resolved_container_port();

        // A stale container with the target name blocks `docker run`.
        if self.runtime.container_exists(&container_name).await {
            debug!(service_id = %service.id, "Removing stale container {}", container_name);
            self.runtime.stop_container(&container_name).await?;
        }
        let container_id = self
            .runtime
            .run_container(&container_name, &image_tag, active_port, container_port, &env)
            .await
            .map_err(|e| {
                self.ports.release(&service.id);
                Error::DeployFailed(service.id.clone(), format!("container start failed: {}", e))
            })?;

        self.lifecycle
            .set_status(&service.id, LifecycleStatus::HealthCheck);
        if let Err(e) = self.health_check(service, &container_name, active_port).await {
            let _ = self.runtime.stop_container(&container_name).await;
            self.ports.release(&service.id);
            return Err(e);
        }

        if let Some(updater) = self.proxy_updater.read().clone() {
            updater(&service.id, active_port);
        }

        let mut process = self
            .state
            .get_service_process(&service.id)
            .await?
            .unwrap_or_else(|| ServiceProcess::new(&service.id, &service.name));
        process.service_name = service.name.clone();
        process.git_commit = resolved_commit.to_string();
        process.container_id = Some(container_id);
        process.container_name = Some(container_name.clone());
        process.image_tag = Some(image_tag.clone());
        process.status = ProcessStatus::Running;
        process.last_error = None;
        process.blue_port = Some(pair.blue_port);
        process.green_port = Some(pair.green_port);
        process.active_port = Some(active_port);
        process.started_at = Some(Utc::now());
        self.state.save_service_process(&process).await?;

        self.containers.write().insert(
            service.id.clone(),
            ContainerInfo {
                container_name: container_name.clone(),
                image_tag,
                active_port,
                pair,
            },
        );
        self.lifecycle.clear(&service.id);
        self.spawn_log_capture(&service.id, &container_name).await;

        info!(
            service_id = %service.id,
            port = active_port,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Initial deploy complete"
        );
        Ok(())
    }

    async fn blue_green_deploy(
        &self,
        service: &Service,
        current: ContainerInfo,
        resolved_commit: &str,
    ) -> Result<()> {
        let start = std::time::Instant::now();
        let container_name = Self::container_name(&service.id);
        let image_tag = Self::image_tag(&service.id);

        self.lifecycle
            .set_status(&service.id, LifecycleStatus::Building);
        self.persist_transition(service, resolved_commit, ProcessStatus::Building, None)
            .await?;

        self.build_image(service, &image_tag).await?;

        let pair = self
            .ports
            .get(&service.id)
            .ok_or_else(|| Error::InvalidState(format!("no port pair for '{}'", service.id)))?;
        let target_port = select_target_port(current.active_port, pair)?;
        debug!(service_id = %service.id, target_port, "Blue/green target selected");

        self.lifecycle
            .set_status(&service.id, LifecycleStatus::Deploying);
        let green_name = format!("{}-green", container_name);
        let env = self.assemble_env(service)?;
        let container_port = service.resolved_container_port();

        if self.runtime.container_exists(&green_name).await {
            debug!(service_id = %service.id, "Removing stale container {}", green_name);
            self.runtime.stop_container(&green_name).await?;
        }
        let green_id = self
            .runtime
            .run_container(&green_name, &image_tag, target_port, container_port, &env)
            .await
            .map_err(|e| {
                Error::DeployFailed(
                    service.id.clone(),
                    format!("green container start failed: {}", e),
                )
            })?;

        self.lifecycle
            .set_status(&service.id, LifecycleStatus::HealthCheck);
        if let Err(e) = self.health_check(service, &green_name, target_port).await {
            // Rollback by inaction: the router and the blue container are
            // untouched; only the failed green is removed.
            let _ = self.runtime.stop_container(&green_name).await;
            return Err(e);
        }

        if let Some(updater) = self.proxy_updater.read().clone() {
            updater(&service.id, target_port);
        }

        // Let in-flight requests against blue complete.
        tokio::time::sleep(self.timeouts.connection_drain).await;

        if let Err(e) = self.runtime.stop_container(&current.container_name).await {
            warn!(service_id = %service.id, "Failed to stop previous container: {}", e);
        }

        let mut active_name = green_name.clone();
        match self
            .runtime
            .rename_container(&green_name, &container_name)
            .await
        {
            Ok(()) => active_name = container_name.clone(),
            Err(e) => {
                warn!(
                    service_id = %service.id,
                    "Rename {} -> {} failed, keeping green name: {}",
                    green_name, container_name, e
                );
            }
        }

        let mut process = self
            .state
            .get_service_process(&service.id)
            .await?
            .unwrap_or_else(|| ServiceProcess::new(&service.id, &service.name));
        process.service_name = service.name.clone();
        process.git_commit = resolved_commit.to_string();
        process.container_id = Some(green_id);
        process.container_name = Some(active_name.clone());
        process.image_tag = Some(image_tag.clone());
        process.status = ProcessStatus::Running;
        process.last_error = None;
        process.blue_port = Some(pair.blue_port);
        process.green_port = Some(pair.green_port);
        process.active_port = Some(target_port);
        process.started_at = Some(Utc::now());
        self.state.save_service_process(&process).await?;

        self.containers.write().insert(
            service.id.clone(),
            ContainerInfo {
                container_name: active_name.clone(),
                image_tag: image_tag.clone(),
                active_port: target_port,
                pair,
            },
        );
        self.lifecycle.clear(&service.id);
        self.spawn_log_capture(&service.id, &active_name).await;

        self.run_image_retention(service, &image_tag).await;

        info!(
            service_id = %service.id,
            port = target_port,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Blue/green deploy complete"
        );
        Ok(())
    }

    /// Locate or generate the Dockerfile, build the image, and clean up any
    /// generated file.
    async fn build_image(&self, service: &Service, image_tag: &str) -> Result<()> {
        let repo_path = self.repos_dir.join(&service.id);
        let context = if service.docker_context.trim().is_empty() {
            repo_path.clone()
        } else if Path::new(&service.docker_context).is_absolute() {
            PathBuf::from(&service.docker_context)
        } else {
            repo_path.join(service.docker_context.trim())
        };

        let mut generated = false;
        let dockerfile = if !service.dockerfile_path.trim().is_empty() {
            let explicit = if Path::new(&service.dockerfile_path).is_absolute() {
                PathBuf::from(service.dockerfile_path.trim())
            } else {
                context.join(service.dockerfile_path.trim())
            };
            if !explicit.exists() {
                return Err(Error::DeployFailed(
                    service.id.clone(),
                    format!("dockerfile_path not found: {:?}", explicit),
                ));
            }
            explicit
        } else if let Some(existing) = self.generator.existing_dockerfile(&context) {
            existing
        } else {
            let content = self.generator.generate(
                &service.language,
                &service.base_image,
                service.resolved_container_port(),
                &service.environment_vars,
                &service.build_command,
                &service.run_command,
                &context,
            )?;
            generated = true;
            self.generator.write(&content, &context)?
        };

        debug!(
            service_id = %service.id,
            dockerfile = %dockerfile.display(),
            generated,
            "Building image"
        );
        let result = self
            .runtime
            .build_image(&context, &dockerfile, image_tag)
            .await
            .map_err(|e| {
                Error::DeployFailed(service.id.clone(), format!("image build failed: {}", e))
            });

        if generated {
            let _ = std::fs::remove_file(&dockerfile);
        }
        result
    }

    /// Health check per the promotion protocol.
    ///
    /// Empty `health_check_path` polls container status until `running`;
    /// otherwise HTTP GETs the probe port until a 2xx, each attempt bounded
    /// by the probe timeout, the whole check by the overall deadline.
    async fn health_check(&self, service: &Service, container_name: &str, port: u16) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.timeouts.health_check_timeout;
        let start = std::time::Instant::now();

        if service.health_check_path.trim().is_empty() {
            let mut attempts = 0u32;
            loop {
                attempts += 1;
                match self.runtime.container_status(container_name).await {
                    Ok(status) if status == "running" => return Ok(()),
                    Ok(status) => {
                        debug!(service_id = %service.id, %status, attempts, "Waiting for container");
                    }
                    Err(e) => {
                        return Err(Error::HealthCheckFailed(
                            service.id.clone(),
                            format!("failed to read container status: {}", e),
                        ))
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(Error::HealthCheckFailed(
                        service.id.clone(),
                        format!(
                            "container never reached running after {} attempts in {:.0}s",
                            attempts,
                            start.elapsed().as_secs_f64()
                        ),
                    ));
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        let mut path = service.health_check_path.trim().to_string();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        let url = format!("http://localhost:{}{}", port, path);

        let interval = match service.health_check_interval {
            0 => self.timeouts.health_check_interval,
            secs => Duration::from_secs(secs).max(Duration::from_secs(1)),
        };

        let mut attempts = 0u32;
        debug!(service_id = %service.id, %url, ?interval, "Health check start");
        loop {
            attempts += 1;
            let response = probe_client()
                .get(&url)
                .timeout(self.timeouts.health_probe_timeout)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    debug!(
                        service_id = %service.id,
                        attempts,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Health check passed"
                    );
                    return Ok(());
                }
                Ok(resp) => {
                    debug!(service_id = %service.id, attempts, status = %resp.status(), "Health probe failed");
                }
                Err(e) => {
                    debug!(service_id = %service.id, attempts, "Health probe error: {}", e);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::HealthCheckFailed(
                    service.id.clone(),
                    format!(
                        "health check timeout for {} after {} attempts in {:.1}s",
                        url,
                        attempts,
                        start.elapsed().as_secs_f64()
                    ),
                ));
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Stop a service: container down, port pair released, in-memory entry
    /// dropped, `stopped` persisted. Idempotent when nothing is running.
    pub async fn stop(&self, service_id: &str) -> Result<()> {
        self.abort_log_capture(service_id);

        let tracked = self.containers.write().remove(service_id);
        let container_name = match &tracked {
            Some(info) => info.container_name.clone(),
            None => match self.state.get_service_process(service_id).await? {
                Some(process) => process
                    .container_name
                    .unwrap_or_else(|| Self::container_name(service_id)),
                None => Self::container_name(service_id),
            },
        };

        self.runtime.stop_container(&container_name).await?;
        self.ports.release(service_id);
        self.lifecycle.clear(service_id);

        if let Some(mut process) = self.state.get_service_process(service_id).await? {
            process.status = ProcessStatus::Stopped;
            self.state.save_service_process(&process).await?;
        }
        info!(service_id, "Service stopped");
        Ok(())
    }

    /// Rebuild in-memory tracking after an agent restart.
    ///
    /// Reserves the persisted port pair, confirms the container is running
    /// and restores the container table. Returns `false` (service needs a
    /// fresh deploy) when the pair is unknown, conflicted, or the container
    /// is gone; a successfully reserved pair stays reserved either way so the
    /// pair remains stable across the redeploy.
    pub async fn recover(&self, service: &Service, process: &ServiceProcess) -> Result<bool> {
        let Some(pair) = derive_pair(process) else {
            return Ok(false);
        };

        if let Err(e) = self.ports.reserve(&service.id, pair) {
            warn!(
                service_id = %service.id,
                "Persisted port pair unusable, redeploying fresh: {}",
                e
            );
            return Ok(false);
        }

        let container_name = process
            .container_name
            .clone()
            .unwrap_or_else(|| Self::container_name(&service.id));
        let status = self
            .runtime
            .container_status(&container_name)
            .await
            .unwrap_or_else(|_| "error".to_string());
        if status != "running" {
            debug!(
                service_id = %service.id,
                %status,
                "Container not running, recovery falls through to deploy"
            );
            return Ok(false);
        }

        // The persisted pair wins over whatever Docker reports; the next
        // deploy corrects any drift via its -p binding.
        let active_port = process
            .active_port
            .filter(|p| pair.contains(*p))
            .unwrap_or(pair.blue_port);
        if let Ok(Some(mapped)) = self
            .runtime
            .mapped_host_port(&container_name, service.resolved_container_port())
            .await
        {
            if mapped != active_port {
                warn!(
                    service_id = %service.id,
                    mapped, active_port,
                    "Docker port mapping disagrees with persisted pair; persisted pair wins"
                );
            }
        }

        self.containers.write().insert(
            service.id.clone(),
            ContainerInfo {
                container_name: container_name.clone(),
                image_tag: process
                    .image_tag
                    .clone()
                    .unwrap_or_else(|| Self::image_tag(&service.id)),
                active_port,
                pair,
            },
        );
        self.spawn_log_capture(&service.id, &container_name).await;
        info!(service_id = %service.id, active_port, "Recovered running service");
        Ok(true)
    }

    /// Live status of a service's container, for heartbeats and the CLI.
    pub async fn status(&self, service_id: &str) -> DeployedStatus {
        let info = self.containers.read().get(service_id).cloned();
        let Some(info) = info else {
            return DeployedStatus {
                running: false,
                container_name: None,
                image_tag: None,
                port: None,
                status: "stopped".to_string(),
            };
        };

        let status = self
            .runtime
            .container_status(&info.container_name)
            .await
            .unwrap_or_else(|_| "error".to_string());
        DeployedStatus {
            running: status == "running",
            container_name: Some(info.container_name),
            image_tag: Some(info.image_tag),
            port: Some(info.active_port),
            status,
        }
    }

    fn assemble_env(&self, service: &Service) -> Result<HashMap<String, String>> {
        let mut env = service.environment_vars.clone();
        for (name, value) in self.secrets.all_for_service(&service.id)? {
            env.insert(name, value);
        }
        Ok(env)
    }

    /// Keep the newest `image_retain_count` images for the service, never
    /// deleting the tag in use.
    async fn run_image_retention(&self, service: &Service, in_use_tag: &str) {
        let keep = match service.image_retain_count {
            0 => IMAGE_RETAIN_DEFAULT,
            n => n,
        } as usize;

        let prefix = format!("{}-{}", IMAGE_PREFIX, service.id);
        let mut images = match self.runtime.list_images(&prefix).await {
            Ok(images) => images,
            Err(e) => {
                warn!(service_id = %service.id, "Image listing failed: {}", e);
                return;
            }
        };
        sort_newest_first(&mut images);

        for image in images.iter().skip(keep) {
            if image.tag == in_use_tag {
                continue;
            }
            debug!(service_id = %service.id, tag = %image.tag, "Removing old image");
            if let Err(e) = self.runtime.remove_image(&image.id).await {
                warn!(service_id = %service.id, "Failed to remove image {}: {}", image.id, e);
            }
        }
    }

    async fn record_failure(&self, service: &Service, resolved_commit: &str, message: &str) {
        let mut process = match self.state.get_service_process(&service.id).await {
            Ok(Some(process)) => process,
            _ => ServiceProcess::new(&service.id, &service.name),
        };
        process.service_name = service.name.clone();
        process.git_commit = resolved_commit.to_string();
        process.status = ProcessStatus::Error;
        process.last_error = Some(message.to_string());
        if let Err(e) = self.state.save_service_process(&process).await {
            warn!(service_id = %service.id, "Failed to persist deploy error: {}", e);
        }
        let _ = self.state.log(&service.id, "error", message).await;
    }

    async fn persist_transition(
        &self,
        service: &Service,
        resolved_commit: &str,
        status: ProcessStatus,
        last_error: Option<String>,
    ) -> Result<()> {
        let mut process = match self.state.get_service_process(&service.id).await? {
            Some(process) => process,
            None => ServiceProcess::new(&service.id, &service.name),
        };
        process.service_name = service.name.clone();
        process.git_commit = resolved_commit.to_string();
        process.status = status;
        process.last_error = last_error;
        self.state.save_service_process(&process).await
    }

    // ========================================================================
    // Container log capture
    // ========================================================================

    /// Tail the container's output into service_logs from two background
    /// tasks (stdout -> info, stderr -> error). Replaces any capture running
    /// for the service.
    async fn spawn_log_capture(&self, service_id: &str, container_name: &str) {
        self.abort_log_capture(service_id);

        let child = match self.runtime.follow_logs(container_name).await {
            Ok(Some(child)) => child,
            Ok(None) => return,
            Err(e) => {
                debug!(service_id, "Log capture unavailable: {}", e);
                return;
            }
        };

        let mut child = child;
        let mut handles = Vec::new();

        if let Some(stdout) = child.stdout.take() {
            handles.push(tokio::spawn(capture_stream(
                self.state.clone(),
                service_id.to_string(),
                "info",
                stdout,
                self.log_retention,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            handles.push(tokio::spawn(capture_stream(
                self.state.clone(),
                service_id.to_string(),
                "error",
                stderr,
                self.log_retention,
            )));
        }
        // Reap the child when the stream ends.
        handles.push(tokio::spawn(async move {
            let _ = child.wait().await;
        }));

        self.log_tasks
            .lock()
            .insert(service_id.to_string(), handles);
    }

    fn abort_log_capture(&self, service_id: &str) {
        if let Some(handles) = self.log_tasks.lock().remove(service_id) {
            for handle in handles {
                handle.abort();
            }
        }
    }
}

async fn capture_stream<R>(
    state: Arc<StateStore>,
    service_id: String,
    level: &'static str,
    stream: R,
    retention: u32,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let reader = BufReader::new(stream);
    let mut lines = reader.lines();
    let mut since_prune = 0u32;
    while let Ok(Some(line)) = lines.next_line().await {
        if state.log(&service_id, level, &line).await.is_err() {
            break;
        }
        since_prune += 1;
        if since_prune >= 500 {
            let _ = state.prune_logs(&service_id, retention).await;
            since_prune = 0;
        }
    }
}

/// The next deploy target is a pure function of the active port and the pair.
/// An active port matching neither member signals corrupted state (typically
/// post-restart) and is rejected rather than guessed around.
pub fn select_target_port(active_port: u16, pair: PortPair) -> Result<u16> {
    if pair.blue_port == 0 {
        return Err(Error::InvalidState("port pair is unset".to_string()));
    }
    if active_port == pair.blue_port {
        Ok(pair.green_port)
    } else if active_port == pair.green_port {
        Ok(pair.blue_port)
    } else {
        Err(Error::InvalidState(format!(
            "active port {} is not a member of pair ({}, {})",
            active_port, pair.blue_port, pair.green_port
        )))
    }
}

/// Reconstruct a port pair from a persisted row: prefer the stored pair,
/// derive the missing member as blue + 1, and fall back to deriving both
/// from the active port's parity.
pub fn derive_pair(process: &ServiceProcess) -> Option<PortPair> {
    if let Some(blue) = process.blue_port {
        return Some(PortPair {
            blue_port: blue,
            green_port: process.green_port.unwrap_or(blue + 1),
        });
    }
    let active = process.active_port?;
    if active == 0 {
        return None;
    }
    Some(if active % 2 == 0 {
        PortPair::new(active)
    } else {
        PortPair::new(active - 1)
    })
}

/// Sort images newest-first by Docker's CreatedAt string, tolerating
/// unparseable timestamps by falling back to lexicographic order.
fn sort_newest_first(images: &mut [ImageInfo]) {
    images.sort_by(|a, b| {
        let ta = parse_docker_time(&a.created_at);
        let tb = parse_docker_time(&b.created_at);
        match (ta, tb) {
            (Some(ta), Some(tb)) => tb.cmp(&ta),
            _ => b.created_at.cmp(&a.created_at),
        }
    });
}

fn parse_docker_time(s: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    // Docker prints e.g. "2024-01-02 15:04:05 -0700 MST"; the trailing zone
    // name is redundant with the numeric offset.
    let trimmed = s.rsplitn(2, ' ').nth(1).unwrap_or(s);
    chrono::DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S %z").ok()
}
