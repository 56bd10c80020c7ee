//! Agent configuration.
//!
//! The agent reads a single JSON config file (default
//! `/etc/buildvigil/config.json`) written at registration time. Unknown keys
//! are ignored so older agents tolerate newer config files. All persistent
//! paths derive from `data_dir`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/buildvigil/config.json";

/// Heartbeat interval bounds, seconds. Server-supplied values are clamped.
pub const HEARTBEAT_MIN_SECS: u64 = 30;
pub const HEARTBEAT_MAX_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent_id: String,
    pub api_key: String,
    pub stack_id: String,
    pub control_plane: String,

    /// Edge gatekeeper service-token pair, sent on every control-plane call.
    pub access_client_id: String,
    pub access_client_secret: String,

    /// Seconds between reconciliations.
    pub poll_interval: u64,
    /// Root for all persistent directories.
    pub data_dir: PathBuf,
    /// Bind port for the external router.
    pub external_proxy_port: u16,
    /// Firewall posture: "none", "daemon-port" or "blocked".
    pub security_mode: String,
    /// Override for the SSH keys directory (defaults to `<data_dir>/ssh`).
    pub git_ssh_key_dir: Option<PathBuf>,

    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Rows kept per service when pruning service_logs.
    pub log_retention: u32,
    pub verbose_logging: bool,

    // Tunnel credentials are parsed so registration-written configs load
    // cleanly; tunnel management itself lives outside the agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloudflare_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloudflare_api_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloudflare_tunnel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloudflare_tunnel_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            api_key: String::new(),
            stack_id: String::new(),
            control_plane: "http://localhost:8787".to_string(),
            access_client_id: String::new(),
            access_client_secret: String::new(),
            poll_interval: 30,
            data_dir: PathBuf::from("/var/lib/buildvigil"),
            external_proxy_port: 8080,
            security_mode: "none".to_string(),
            git_ssh_key_dir: None,
            port_range_start: 3000,
            port_range_end: 3100,
            log_retention: 10_000,
            verbose_logging: false,
            cloudflare_account_id: None,
            cloudflare_api_token: None,
            cloudflare_tunnel_id: None,
            cloudflare_tunnel_token: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, filling omitted keys with defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config {}: {}", path.display(), e))
        })?;
        let cfg: Config = serde_json::from_str(&data).map_err(|e| {
            Error::Config(format!("failed to parse config {}: {}", path.display(), e))
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write configuration back to disk (0600: it carries credentials).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.port_range_end <= self.port_range_start {
            return Err(Error::Config(format!(
                "port_range_end ({}) must be greater than port_range_start ({})",
                self.port_range_end, self.port_range_start
            )));
        }
        match self.security_mode.as_str() {
            "none" | "daemon-port" | "blocked" => {}
            other => {
                return Err(Error::Config(format!(
                    "unknown security_mode '{}' (expected none, daemon-port or blocked)",
                    other
                )))
            }
        }
        Ok(())
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.data_dir.join("repos")
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.data_dir.join("secrets")
    }

    pub fn ssh_key_dir(&self) -> PathBuf {
        self.git_ssh_key_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("ssh"))
    }
}

/// Clamp a server-supplied heartbeat interval into the allowed window.
pub fn clamp_heartbeat_interval(secs: u64) -> u64 {
    secs.clamp(HEARTBEAT_MIN_SECS, HEARTBEAT_MAX_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"agent_id":"agent-1","stack_id":"stack-1"}"#).unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.agent_id, "agent-1");
        assert_eq!(cfg.poll_interval, 30);
        assert_eq!(cfg.external_proxy_port, 8080);
        assert_eq!(cfg.port_range_start, 3000);
        assert_eq!(cfg.port_range_end, 3100);
        assert_eq!(cfg.security_mode, "none");
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"agent_id":"a","stack_id":"s","some_future_option":true}"#,
        )
        .unwrap();
        assert!(Config::load(&path).is_ok());
    }

    #[test]
    fn rejects_inverted_port_range() {
        let cfg = Config {
            port_range_start: 4000,
            port_range_end: 3000,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_security_mode() {
        let cfg = Config {
            security_mode: "fortress".to_string(),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ssh_dir_override() {
        let mut cfg = Config::default();
        assert_eq!(cfg.ssh_key_dir(), PathBuf::from("/var/lib/buildvigil/ssh"));
        cfg.git_ssh_key_dir = Some(PathBuf::from("/opt/keys"));
        assert_eq!(cfg.ssh_key_dir(), PathBuf::from("/opt/keys"));
    }

    #[test]
    fn heartbeat_clamping() {
        assert_eq!(clamp_heartbeat_interval(5), 30);
        assert_eq!(clamp_heartbeat_interval(45), 45);
        assert_eq!(clamp_heartbeat_interval(100_000), 300);
    }
}
