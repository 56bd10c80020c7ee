//! Firewall posture via UFW.
//!
//! Applied only when the daemon runs with `--apply-firewall` (rules require
//! root). `daemon-port` admits the external proxy port plus SSH; `blocked`
//! admits loopback only (tunnel mode). Rules are reverted on shutdown.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

const UFW_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    #[default]
    None,
    DaemonPort,
    Blocked,
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecurityMode::None => "none",
            SecurityMode::DaemonPort => "daemon-port",
            SecurityMode::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl FromStr for SecurityMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(SecurityMode::None),
            "daemon-port" => Ok(SecurityMode::DaemonPort),
            "blocked" => Ok(SecurityMode::Blocked),
            other => Err(format!("unknown security mode '{}'", other)),
        }
    }
}

pub struct FirewallManager {
    mode: SecurityMode,
    daemon_port: u16,
    ssh_port: u16,
}

impl FirewallManager {
    pub fn new(mode: SecurityMode, daemon_port: u16) -> Self {
        Self {
            mode,
            daemon_port,
            ssh_port: 22,
        }
    }

    pub async fn is_available(&self) -> bool {
        run("which", &["ufw"]).await.is_ok()
    }

    pub async fn apply(&self) -> Result<()> {
        match self.mode {
            SecurityMode::None => Ok(()),
            SecurityMode::DaemonPort => self.apply_daemon_port().await,
            SecurityMode::Blocked => self.apply_blocked().await,
        }
    }

    async fn apply_daemon_port(&self) -> Result<()> {
        self.reset().await?;
        run_ufw(&["default", "deny", "incoming"]).await?;
        run_ufw(&["default", "allow", "outgoing"]).await?;
        run_ufw(&["allow", "in", "on", "lo"]).await?;
        run_ufw(&["allow", &format!("{}/tcp", self.daemon_port)]).await?;
        run_ufw(&["allow", &format!("{}/tcp", self.ssh_port)]).await?;
        run_ufw(&["--force", "enable"]).await
    }

    async fn apply_blocked(&self) -> Result<()> {
        self.reset().await?;
        run_ufw(&["default", "deny", "incoming"]).await?;
        run_ufw(&["default", "allow", "outgoing"]).await?;
        run_ufw(&["allow", "in", "on", "lo"]).await?;
        run_ufw(&["--force", "enable"]).await
    }

    /// Remove all agent-applied rules.
    pub async fn revert(&self) -> Result<()> {
        self.reset().await
    }

    async fn reset(&self) -> Result<()> {
        // Disable first; failure is fine if ufw was never enabled.
        let _ = run("ufw", &["--force", "disable"]).await;
        match run_ufw(&["--force", "reset"]).await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("not found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn status(&self) -> serde_json::Value {
        let status = match run("ufw", &["status", "verbose"]).await {
            Ok(output) => output,
            Err(_) => "unavailable".to_string(),
        };
        serde_json::json!({
            "mode": self.mode.to_string(),
            "status": status,
        })
    }
}

async fn run_ufw(args: &[&str]) -> Result<()> {
    debug!("ufw {}", args.join(" "));
    run("ufw", args).await.map(|_| ())
}

async fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = tokio::time::timeout(
        UFW_TIMEOUT,
        tokio::process::Command::new(program).args(args).output(),
    )
    .await
    .map_err(|_| Error::Firewall(format!("{} {} timed out", program, args.join(" "))))?
    .map_err(|e| Error::Firewall(format!("{} failed to start: {}", program, e)))?;

    if !output.status.success() {
        return Err(Error::Firewall(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
