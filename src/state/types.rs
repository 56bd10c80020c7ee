use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The last desired-state version the agent fully reconciled.
///
/// Singleton row; written only when a reconciliation cycle completes without
/// per-service errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedState {
    pub stack_version: u64,
    pub state_hash: String,
    pub applied_at: Option<DateTime<Utc>>,
}

/// Persisted lifecycle status of a managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Building,
    Running,
    Error,
    Stopped,
    Crashed,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessStatus::Building => "building",
            ProcessStatus::Running => "running",
            ProcessStatus::Error => "error",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

impl FromStr for ProcessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "building" => Ok(ProcessStatus::Building),
            "running" => Ok(ProcessStatus::Running),
            "error" => Ok(ProcessStatus::Error),
            "stopped" => Ok(ProcessStatus::Stopped),
            "crashed" => Ok(ProcessStatus::Crashed),
            other => Err(format!("unknown process status '{}'", other)),
        }
    }
}

/// One row per managed service, updated at every deployment and lifecycle
/// transition. The persisted port pair is what restart recovery reserves;
/// it wins over whatever host port Docker reports for the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceProcess {
    pub service_id: String,
    pub service_name: String,
    pub git_commit: String,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub image_tag: Option<String>,
    pub status: ProcessStatus,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub blue_port: Option<u16>,
    pub green_port: Option<u16>,
    pub active_port: Option<u16>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ServiceProcess {
    pub fn new(service_id: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            service_name: service_name.into(),
            git_commit: String::new(),
            container_id: None,
            container_name: None,
            image_tag: None,
            status: ProcessStatus::Stopped,
            restart_count: 0,
            last_error: None,
            blue_port: None,
            green_port: None,
            active_port: None,
            started_at: None,
            updated_at: None,
        }
    }
}

/// One line of captured service output or an agent diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceLogRow {
    pub id: i64,
    pub service_id: String,
    pub level: String,
    pub message: String,
    pub created_at: Option<DateTime<Utc>>,
}
