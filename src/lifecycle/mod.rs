//! In-memory deployment lifecycle tracking.
//!
//! Ephemeral per-service transition state, shared between the reconciler
//! (which owns and reports it) and the deployer (which advances it while a
//! deployment runs). Entries dominate the persisted `ServiceProcess.status`
//! in heartbeats and are cleared once a service reaches `running`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    Building,
    Deploying,
    HealthCheck,
    Running,
    Crashed,
    Error,
    Stopped,
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleStatus::Building => "building",
            LifecycleStatus::Deploying => "deploying",
            LifecycleStatus::HealthCheck => "health_check",
            LifecycleStatus::Running => "running",
            LifecycleStatus::Crashed => "crashed",
            LifecycleStatus::Error => "error",
            LifecycleStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleEntry {
    pub status: LifecycleStatus,
    pub health: Option<String>,
    pub last_error: Option<String>,
}

/// Shared map of in-flight lifecycle state, keyed by service id.
#[derive(Clone, Default)]
pub struct LifecycleMap {
    inner: Arc<RwLock<HashMap<String, LifecycleEntry>>>,
}

impl LifecycleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, service_id: &str, status: LifecycleStatus) {
        let mut map = self.inner.write();
        let entry = map.entry(service_id.to_string()).or_insert(LifecycleEntry {
            status,
            health: None,
            last_error: None,
        });
        entry.status = status;
    }

    pub fn set_error(&self, service_id: &str, message: impl Into<String>) {
        let mut map = self.inner.write();
        map.insert(
            service_id.to_string(),
            LifecycleEntry {
                status: LifecycleStatus::Error,
                health: None,
                last_error: Some(message.into()),
            },
        );
    }

    /// Entry removal on reaching `running`.
    pub fn clear(&self, service_id: &str) {
        self.inner.write().remove(service_id);
    }

    pub fn get(&self, service_id: &str) -> Option<LifecycleEntry> {
        self.inner.read().get(service_id).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, LifecycleEntry> {
        self.inner.read().clone()
    }

    /// Drop entries for services no longer in the desired state.
    pub fn retain_services(&self, keep: &[String]) {
        self.inner.write().retain(|id, _| keep.contains(id));
    }
}
