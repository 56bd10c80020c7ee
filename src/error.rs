use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Docker error: {0}")]
    #[diagnostic(
        code(vigil::docker::error),
        help("Check that Docker is running with `docker ps`")
    )]
    Docker(String),

    #[error("Filesystem error: {0}")]
    #[diagnostic(code(vigil::filesystem::error))]
    Filesystem(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Git error: {0}")]
    #[diagnostic(
        code(vigil::git::error),
        help("Verify the repository URL and that the SSH key for this service exists under the ssh directory")
    )]
    Git(#[from] git2::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Control plane request failed: {0}")]
    #[diagnostic(
        code(vigil::api::error),
        help("Check the control_plane URL and API credentials in the agent config")
    )]
    ControlPlane(String),

    #[error("Database error: {0}")]
    #[diagnostic(code(vigil::database::error))]
    Database(#[from] tokio_rusqlite::Error),

    #[error("Service '{0}' not found")]
    ServiceNotFound(String),

    #[error("Service '{0}' health check failed: {1}")]
    #[diagnostic(
        code(vigil::service::health_check_failed),
        help("Check the service logs with `buildvigil-agent logs <service-id>`\nVerify health_check_path is correct in the service definition")
    )]
    HealthCheckFailed(String, String),

    #[error("Service '{0}' deploy failed: {1}")]
    #[diagnostic(code(vigil::service::deploy_failed))]
    DeployFailed(String, String),

    #[error("Port allocation failed: {0}")]
    #[diagnostic(
        code(vigil::port::allocation_failed),
        help("Widen port_range_start/port_range_end in the agent config")
    )]
    PortAllocation(String),

    #[error("Port pair for '{service}' conflicts with service '{other}'")]
    #[diagnostic(code(vigil::port::reservation_conflict))]
    PortReservationConflict { service: String, other: String },

    #[error("Secret '{0}' not found")]
    SecretNotFound(String),

    #[error("Failed to decrypt secret '{0}': {1}")]
    #[diagnostic(
        code(vigil::secrets::decrypt),
        help("Secrets are bound to the agent_id that wrote them; a changed agent_id orphans old secrets")
    )]
    SecretDecrypt(String, String),

    #[error("Dockerfile generation failed: {0}")]
    DockerfileGeneration(String),

    #[error("Firewall error: {0}")]
    #[diagnostic(
        code(vigil::firewall::error),
        help("Firewall rules require ufw and root; run with --apply-firewall only as root")
    )]
    Firewall(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::Docker(_) => Some("Check that Docker is running: docker ps".to_string()),
            Error::ControlPlane(_) => Some(
                "Verify control_plane, agent_id and the access credentials in the agent config."
                    .to_string(),
            ),
            Error::PortAllocation(msg) => Some(format!(
                "{}. Widen port_range_start/port_range_end in the config and restart the agent.",
                msg
            )),
            Error::HealthCheckFailed(service, _) => Some(format!(
                "Check the service logs with: buildvigil-agent logs {}",
                service
            )),
            Error::SecretNotFound(name) => Some(format!(
                "Add the secret with: buildvigil-agent secret add --service <service-id> --name {}",
                name
            )),
            Error::Database(e) => {
                // String matching is unavoidable here: tokio_rusqlite wraps the
                // underlying rusqlite error opaquely, so we can't match on error codes.
                let err_str = e.to_string();
                if err_str.contains("database is locked") || err_str.contains("SQLITE_BUSY") {
                    Some(
                        "Another agent instance may be running against the same data_dir. \
                         Stop it, or remove a stale lock file under the data directory."
                            .to_string(),
                    )
                } else {
                    Some(
                        "State database error. If it persists, back up and remove \
                         <data_dir>/state.db; the agent rebuilds state from the container runtime."
                            .to_string(),
                    )
                }
            }
            Error::Config(_) => Some(
                "Check the agent config file (default /etc/buildvigil/config.json).".to_string(),
            ),
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}
