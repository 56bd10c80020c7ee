mod cli;

use buildvigil_agent::api::ControlPlaneClient;
use buildvigil_agent::docker::DockerCli;
use buildvigil_agent::lifecycle::LifecycleMap;
use buildvigil_agent::proxy::HostsDns;
use buildvigil_agent::vcs::GitFetcher;
use buildvigil_agent::{
    Config, Deployer, Error as AgentError, PortAllocator, Reconciler, Router, SecretStore,
    StateStore,
};
use clap::Parser;
use cli::{Cli, Commands, SecretCommands};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(agent_error) = e.downcast_ref::<AgentError>() {
            eprintln!("Error: {}", agent_error);
            if let Some(suggestion) = agent_error.suggestion() {
                eprintln!("\nHint: {}", suggestion);
            }
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(buildvigil_agent::config::DEFAULT_CONFIG_PATH));
    let config = Config::load(&config_path)?;
    init_tracing(cli.verbose || config.verbose_logging)?;

    match cli.command {
        Commands::Run { apply_firewall } => run_daemon(config, apply_firewall).await,
        Commands::Status { json } => run_status(config, json).await,
        Commands::Logs {
            service,
            tail,
            follow,
        } => run_logs(config, &service, tail, follow).await,
        Commands::Secret(secret_command) => run_secret(config, secret_command),
    }
}

async fn run_daemon(config: Config, apply_firewall: bool) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(config.repos_dir())?;

    let state = Arc::new(StateStore::open(&config.state_db_path()).await?);
    let secrets = Arc::new(SecretStore::new(config.secrets_dir(), &config.agent_id)?);
    let vcs = Arc::new(GitFetcher::new(config.repos_dir(), config.ssh_key_dir()));
    let ports = Arc::new(PortAllocator::new(
        config.port_range_start,
        config.port_range_end,
    ));
    let lifecycle = LifecycleMap::new();
    let deployer = Arc::new(Deployer::new(
        config.repos_dir(),
        state.clone(),
        secrets,
        Arc::new(DockerCli::new()),
        ports,
        lifecycle.clone(),
        config.log_retention,
    ));
    let api = Arc::new(ControlPlaneClient::new(
        config.control_plane.as_str(),
        config.agent_id.as_str(),
        config.access_client_id.as_str(),
        config.access_client_secret.as_str(),
    )?);
    let router = Router::new();

    let reconciler = Arc::new(Reconciler::new(
        config,
        state,
        vcs,
        deployer,
        router,
        api,
        lifecycle,
        Some(HostsDns::default()),
        apply_firewall,
    ));

    let signal_target = reconciler.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        signal_target.stop();
    });

    reconciler.run().await?;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run_status(config: Config, json: bool) -> anyhow::Result<()> {
    let state = StateStore::open(&config.state_db_path()).await?;
    let processes = state.list_service_processes().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&processes)?);
        return Ok(());
    }

    if processes.is_empty() {
        println!("No services configured");
        return Ok(());
    }

    println!(
        "{:<20} {:<12} {:<8} {:<12} {:<20}",
        "SERVICE", "STATUS", "PORT", "COMMIT", "LAST ERROR"
    );
    for process in processes {
        let port = process
            .active_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut commit = process.git_commit.clone();
        commit.truncate(8);
        println!(
            "{:<20} {:<12} {:<8} {:<12} {:<20}",
            truncate(&process.service_name, 20),
            process.status.to_string(),
            port,
            commit,
            process.last_error.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn run_logs(config: Config, service: &str, tail: u32, follow: bool) -> anyhow::Result<()> {
    let state = StateStore::open(&config.state_db_path()).await?;

    if follow {
        println!("Following logs for '{}' (Ctrl+C to exit)...", service);
        let mut last_id: i64 = 0;
        loop {
            for row in state.stream_logs(service, last_id).await? {
                print_log_line(&row);
                last_id = row.id;
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }

    let mut rows = state.get_logs(service, tail).await?;
    if rows.is_empty() {
        println!("No logs found for service '{}'", service);
        return Ok(());
    }
    rows.reverse(); // oldest first
    for row in rows {
        print_log_line(&row);
    }
    Ok(())
}

fn print_log_line(row: &buildvigil_agent::state::ServiceLogRow) {
    let when = row
        .created_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!("[{}] {}: {}", when, row.level, row.message);
}

fn run_secret(config: Config, command: SecretCommands) -> anyhow::Result<()> {
    let store = SecretStore::new(config.secrets_dir(), &config.agent_id)?;
    match command {
        SecretCommands::Add {
            service,
            name,
            value,
        } => {
            let value = match value {
                Some(v) => v,
                None => {
                    print!("Enter secret value: ");
                    std::io::stdout().flush()?;
                    let mut line = String::new();
                    std::io::stdin().read_line(&mut line)?;
                    line.trim().to_string()
                }
            };
            if value.is_empty() {
                anyhow::bail!("secret value cannot be empty");
            }
            store.set(&name, &service, &value)?;
            println!("Secret '{}' added for service '{}'", name, service);
            println!("The service picks up the new secret on its next deploy.");
        }
        SecretCommands::List { service } => {
            let names = store.list(&service)?;
            if names.is_empty() {
                println!("No secrets configured for service '{}'", service);
            } else {
                println!("Secrets for service '{}':", service);
                for name in names {
                    println!("  - {}", name);
                }
            }
        }
        SecretCommands::Delete { service, name } => {
            store.delete(&name, &service)?;
            println!("Secret '{}' deleted for service '{}'", name, service);
        }
    }
    Ok(())
}

/// Truncate by character count; service names come from the control plane
/// and are not guaranteed to be ASCII.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
