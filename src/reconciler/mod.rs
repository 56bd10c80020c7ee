//! The reconciliation loop.
//!
//! Pulls desired state from the control plane, diffs it against what the
//! agent is running, drives the deployer per service, swaps the router
//! tables, and reports lifecycle status upstream via heartbeats. Per-service
//! failures never abort a cycle; they only block the applied-state write,
//! which is what makes the next tick retry.

use crate::api::{ControlPlane, DesiredState, HeartbeatRequest, Service, ServiceStatusReport};
use crate::config::{clamp_heartbeat_interval, Config};
use crate::deploy::Deployer;
use crate::error::Result;
use crate::firewall::{FirewallManager, SecurityMode};
use crate::lifecycle::{LifecycleMap, LifecycleStatus};
use crate::proxy::{ExternalProxy, HostsDns, InternalProxy, Router, ServiceKeys, SHUTDOWN_GRACE};
use crate::state::{ProcessStatus, StateStore};
use crate::vcs::Vcs;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Copy)]
pub struct SyncReport {
    /// Clamped heartbeat interval requested by the server.
    pub heartbeat_secs: u64,
    /// True when any per-service action failed this cycle.
    pub had_errors: bool,
}

pub struct Reconciler {
    config: Config,
    state: Arc<StateStore>,
    vcs: Arc<dyn Vcs>,
    deployer: Arc<Deployer>,
    router: Router,
    api: Arc<dyn ControlPlane>,
    lifecycle: LifecycleMap,
    dns: Option<HostsDns>,
    apply_firewall: bool,
    firewall: tokio::sync::Mutex<Option<FirewallManager>>,
    current_security_mode: parking_lot::Mutex<Option<String>>,
    external_bind: String,
    internal_bind: (String, u16),
    shutdown: CancellationToken,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        state: Arc<StateStore>,
        vcs: Arc<dyn Vcs>,
        deployer: Arc<Deployer>,
        router: Router,
        api: Arc<dyn ControlPlane>,
        lifecycle: LifecycleMap,
        dns: Option<HostsDns>,
        apply_firewall: bool,
    ) -> Self {
        // The deployer promotes ports through this narrow callback; it never
        // sees the router itself.
        let promote_router = router.clone();
        deployer.set_proxy_updater(Arc::new(move |service_id: &str, port: u16| {
            promote_router.set_route(service_id, port);
        }));

        Self {
            config,
            state,
            vcs,
            deployer,
            router,
            api,
            lifecycle,
            dns,
            apply_firewall,
            firewall: tokio::sync::Mutex::new(None),
            current_security_mode: parking_lot::Mutex::new(None),
            external_bind: "0.0.0.0".to_string(),
            internal_bind: ("127.0.0.1".to_string(), 80),
            shutdown: CancellationToken::new(),
        }
    }

    /// Override listener bind targets (tests bind ephemeral loopback ports).
    pub fn with_binds(mut self, external_bind: impl Into<String>, internal: (String, u16)) -> Self {
        self.external_bind = external_bind.into();
        self.internal_bind = internal;
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request loop exit; `run` returns after graceful listener shutdown.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Main loop. Blocks until [`Reconciler::stop`].
    pub async fn run(&self) -> Result<()> {
        let external = ExternalProxy::new(
            self.router.clone(),
            self.external_bind.clone(),
            self.config.external_proxy_port,
        );
        let external_task = tokio::spawn({
            let token = self.shutdown.clone();
            async move {
                if let Err(e) = external.serve(token).await {
                    warn!("External proxy exited: {}", e);
                }
            }
        });

        let internal = InternalProxy::new(self.router.clone())
            .with_bind(self.internal_bind.0.clone(), self.internal_bind.1);
        let internal_task = tokio::spawn({
            let token = self.shutdown.clone();
            async move {
                if let Err(e) = internal.serve(token).await {
                    warn!("Internal proxy exited: {}", e);
                }
            }
        });

        let mut heartbeat_secs = crate::config::HEARTBEAT_MIN_SECS;
        match self.sync().await {
            Ok(report) => heartbeat_secs = report.heartbeat_secs,
            Err(e) => warn!("Initial sync failed: {}", e),
        }
        if let Err(e) = self.heartbeat().await {
            warn!("Initial heartbeat failed: {}", e);
        }

        let poll = Duration::from_secs(self.config.poll_interval.max(1));
        let mut sync_ticker = tokio::time::interval_at(tokio::time::Instant::now() + poll, poll);
        let hb = Duration::from_secs(heartbeat_secs);
        let mut heartbeat_ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + hb, hb);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sync_ticker.tick() => {
                    match self.sync().await {
                        Ok(report) => {
                            if report.had_errors {
                                warn!("Reconciliation completed with per-service errors; will retry");
                            }
                            // Reset the heartbeat ticker only when the value
                            // actually changed. Resetting every sync starves
                            // heartbeats whenever poll < heartbeat.
                            if report.heartbeat_secs != heartbeat_secs {
                                info!(
                                    "Heartbeat interval changed {}s -> {}s",
                                    heartbeat_secs, report.heartbeat_secs
                                );
                                heartbeat_secs = report.heartbeat_secs;
                                let hb = Duration::from_secs(heartbeat_secs);
                                heartbeat_ticker =
                                    tokio::time::interval_at(tokio::time::Instant::now() + hb, hb);
                            }
                        }
                        Err(e) => warn!("Sync failed: {}", e),
                    }
                }
                _ = heartbeat_ticker.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!("Heartbeat failed: {}", e);
                    }
                }
            }
        }

        // Bounded graceful shutdown of both listeners.
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
            let _ = external_task.await;
            let _ = internal_task.await;
        })
        .await;

        if let Some(dns) = &self.dns {
            if let Err(e) = dns.cleanup() {
                warn!("DNS cleanup failed: {}", e);
            }
        }
        if self.apply_firewall {
            if let Some(firewall) = self.firewall.lock().await.as_ref() {
                if let Err(e) = firewall.revert().await {
                    warn!("Firewall revert failed: {}", e);
                }
            }
        }
        info!("Reconciler stopped");
        Ok(())
    }

    /// One reconciliation cycle.
    pub async fn sync(&self) -> Result<SyncReport> {
        // 1. Fetch. Failure leaves routes and state untouched.
        let desired = self.api.get_desired_state(&self.config.stack_id).await?;
        let heartbeat_secs = clamp_heartbeat_interval(desired.heartbeat_interval);

        let applied = self.state.get_applied_state().await?;
        let state_changed = match &applied {
            None => true,
            Some(applied) => applied.state_hash != desired.hash,
        };
        if state_changed {
            info!(
                version = desired.version,
                hash = %desired.hash,
                "Applying desired state"
            );
        }

        let mut desired_by_id: HashMap<String, Service> = HashMap::new();
        for svc in &desired.services {
            let mut svc = svc.clone();
            if svc.git_ref.trim().is_empty() {
                svc.git_ref = "main".to_string();
            }
            desired_by_id.insert(svc.id.clone(), svc);
        }

        let mut had_errors = false;

        // 2. Deletions: anything persisted but no longer desired.
        match self.state.list_service_processes().await {
            Ok(existing) => {
                for process in existing {
                    if desired_by_id.contains_key(&process.service_id) {
                        continue;
                    }
                    info!(service_id = %process.service_id, "Removing service");
                    if let Err(e) = self.deployer.stop(&process.service_id).await {
                        warn!(service_id = %process.service_id, "Stop failed: {}", e);
                        had_errors = true;
                    }
                    if let Err(e) = self.state.delete_service_process(&process.service_id).await {
                        warn!(service_id = %process.service_id, "State delete failed: {}", e);
                        had_errors = true;
                    }
                    if let Err(e) = self.vcs.remove_repo(&process.service_id).await {
                        warn!(service_id = %process.service_id, "Repo removal failed: {}", e);
                        had_errors = true;
                    }
                }
            }
            Err(e) => {
                warn!("Failed to list existing services: {}", e);
                had_errors = true;
            }
        }

        // 3. Upserts, in desired order.
        let mut external_routes: HashMap<String, u16> = HashMap::new();
        let mut internal_routes: HashMap<String, u16> = HashMap::new();
        let mut service_keys: HashMap<String, ServiceKeys> = HashMap::new();
        let mut service_names: Vec<String> = Vec::new();

        for declared in &desired.services {
            let svc = desired_by_id
                .get(&declared.id)
                .expect("desired_by_id covers every declared service");

            let persisted = match self.state.get_service_process(&svc.id).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(service_id = %svc.id, "State read failed: {}", e);
                    had_errors = true;
                    continue;
                }
            };

            // Restart recovery: reserve the persisted pair and re-adopt the
            // running container before deciding whether to deploy.
            if !self.deployer.is_tracked(&svc.id) {
                if let Some(process) = &persisted {
                    match self.deployer.recover(svc, process).await {
                        Ok(true) => debug!(service_id = %svc.id, "Recovered from persisted state"),
                        Ok(false) => {}
                        Err(e) => warn!(service_id = %svc.id, "Recovery failed: {}", e),
                    }
                }
            }

            let in_memory = self.deployer.is_tracked(&svc.id);
            let needs_deploy = !in_memory
                || persisted.is_none()
                || persisted
                    .as_ref()
                    .map(|p| p.status != ProcessStatus::Running)
                    .unwrap_or(true);

            if state_changed || needs_deploy {
                let resolved_commit = match self.vcs.clone_or_pull(svc).await {
                    Ok(commit) => commit,
                    Err(e) => {
                        warn!(service_id = %svc.id, "Source sync failed: {}", e);
                        self.lifecycle.set_error(&svc.id, e.to_string());
                        had_errors = true;
                        continue;
                    }
                };

                let commit_changed = persisted
                    .as_ref()
                    .map(|p| p.git_commit != resolved_commit)
                    .unwrap_or(true);
                if commit_changed || needs_deploy {
                    if let Err(e) = self.deployer.deploy(svc, &resolved_commit).await {
                        warn!(service_id = %svc.id, "Deploy failed: {}", e);
                        self.lifecycle.set_error(&svc.id, e.to_string());
                        had_errors = true;
                        continue;
                    }
                }
            }

            service_names.push(svc.name.clone());
            service_keys.insert(
                svc.id.clone(),
                ServiceKeys {
                    hostname: if svc.hostname.trim().is_empty() {
                        None
                    } else {
                        Some(svc.hostname.clone())
                    },
                    name: svc.name.clone(),
                },
            );

            let Some(active_port) = self.deployer.active_port(&svc.id) else {
                warn!(service_id = %svc.id, "No active port; skipping routes");
                continue;
            };
            if !svc.hostname.trim().is_empty() {
                external_routes.insert(svc.hostname.clone(), active_port);
            }
            internal_routes.insert(svc.name.clone(), active_port);
        }

        // 4. Security mode transitions.
        self.apply_security_mode(&desired).await;

        // 5. Atomic route swap, then DNS refresh.
        self.router.update_service_keys(service_keys);
        self.router.update_external(&external_routes);
        self.router.update_internal(&internal_routes);

        if let Some(dns) = &self.dns {
            if let Err(e) = dns.update_services(&service_names) {
                warn!("DNS update failed: {}", e);
            }
        }

        let desired_ids: Vec<String> = desired_by_id.keys().cloned().collect();
        self.lifecycle.retain_services(&desired_ids);

        // 6. Record the applied state only for fully clean cycles.
        if !had_errors && state_changed {
            self.state
                .set_applied_state(desired.version, &desired.hash)
                .await?;
        }

        Ok(SyncReport {
            heartbeat_secs,
            had_errors,
        })
    }

    async fn apply_security_mode(&self, desired: &DesiredState) {
        let changed = {
            let mut current = self.current_security_mode.lock();
            if current.as_deref() == Some(desired.security_mode.as_str()) {
                false
            } else {
                *current = Some(desired.security_mode.clone());
                true
            }
        };
        if !changed || !self.apply_firewall {
            return;
        }

        let mode = match desired.security_mode.parse::<SecurityMode>() {
            Ok(mode) => mode,
            Err(e) => {
                warn!("Ignoring firewall update: {}", e);
                return;
            }
        };
        let manager = FirewallManager::new(mode, desired.external_proxy_port);
        if mode != SecurityMode::None && !manager.is_available().await {
            warn!("ufw not available; firewall rules not applied");
            return;
        }
        if let Err(e) = manager.apply().await {
            warn!("Firewall apply failed: {}", e);
            return;
        }
        *self.firewall.lock().await = Some(manager);
    }

    /// Push one heartbeat with per-service lifecycle status. In-flight
    /// lifecycle entries dominate the persisted status.
    pub async fn heartbeat(&self) -> Result<()> {
        let processes = self.state.list_service_processes().await?;
        let lifecycle = self.lifecycle.snapshot();

        let mut services_status = Vec::with_capacity(processes.len());
        for process in &processes {
            let (status, last_error) = match lifecycle.get(&process.service_id) {
                Some(entry) => (
                    entry.status.to_string(),
                    entry.last_error.clone().or_else(|| process.last_error.clone()),
                ),
                None => {
                    let mut status = process.status.to_string();
                    // A row that claims running but whose container is gone
                    // reports crashed until the next sync redeploys it.
                    if process.status == ProcessStatus::Running
                        && self.deployer.is_tracked(&process.service_id)
                    {
                        let live = self.deployer.status(&process.service_id).await;
                        if !live.running {
                            status = LifecycleStatus::Crashed.to_string();
                        }
                    }
                    (status, process.last_error.clone())
                }
            };

            services_status.push(ServiceStatusReport {
                service_id: process.service_id.clone(),
                name: process.service_name.clone(),
                status,
                pid: None,
                restart_count: process.restart_count,
                last_error,
                health_status: None,
            });
        }

        let stack_version = self
            .state
            .get_applied_state()
            .await?
            .map(|applied| applied.stack_version)
            .unwrap_or(0);

        let mode = self
            .current_security_mode
            .lock()
            .clone()
            .unwrap_or_else(|| self.config.security_mode.clone());
        let firewall_status = match self.firewall.lock().await.as_ref() {
            Some(firewall) => Some(firewall.status().await),
            None => None,
        };

        let request = HeartbeatRequest {
            stack_version,
            agent_status: "healthy".to_string(),
            services_status,
            security_state: serde_json::json!({
                "mode": mode,
                "external_exposure": external_exposure(&mode),
                "firewall_status": firewall_status,
            }),
            system_info: serde_json::json!({
                "hostname": hostname(),
            }),
        };

        self.api.send_heartbeat(&request).await
    }
}

fn external_exposure(mode: &str) -> &'static str {
    match mode {
        "blocked" => "none",
        "daemon-port" => "daemon-port",
        _ => "unrestricted",
    }
}

fn hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}
