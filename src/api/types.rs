use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A service as declared in the desired state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    pub id: String,
    pub name: String,

    pub git_url: String,
    pub git_ref: String,
    /// Optional commit pin; when set it wins over `git_ref`.
    pub git_commit: String,
    /// Name of an SSH key under the agent's ssh directory.
    pub git_ssh_key: String,

    /// One of auto, nodejs, golang, python, rust, java, generic.
    pub language: String,
    pub base_image: String,
    pub build_command: String,
    pub run_command: String,
    pub dockerfile_path: String,
    pub docker_context: String,
    pub docker_container_port: u16,
    pub port: u16,

    /// External hostname for Host-header routing; empty means internal-only.
    pub hostname: String,
    pub health_check_path: String,
    /// Seconds between health probes; 0 means the default.
    pub health_check_interval: u64,
    pub environment_vars: HashMap<String, String>,
    /// Images kept per service after a deploy; 0 means the default (5).
    pub image_retain_count: u32,
}

impl Service {
    /// The container port the service listens on inside the image.
    pub fn resolved_container_port(&self) -> u16 {
        if self.docker_container_port != 0 {
            self.docker_container_port
        } else if self.port != 0 {
            self.port
        } else {
            8000
        }
    }
}

/// Full desired state for one stack, as served by the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DesiredState {
    pub stack_id: String,
    pub version: u64,
    pub hash: String,
    pub poll_interval: u64,
    pub heartbeat_interval: u64,
    pub security_mode: String,
    pub external_proxy_port: u16,
    pub services: Vec<Service>,
}

/// Per-service entry in a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusReport {
    pub service_id: String,
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_status: Option<String>,
}

/// Heartbeat payload pushed to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub stack_version: u64,
    pub agent_status: String,
    pub services_status: Vec<ServiceStatusReport>,
    pub security_state: serde_json::Value,
    pub system_info: serde_json::Value,
}
