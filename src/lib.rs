//! # Buildvigil Agent
//!
//! A single-host deployment agent. The agent periodically reconciles a
//! locally managed set of containerized services against a desired state
//! fetched from a remote control plane: for each declared service it fetches
//! source from git, builds a container image, starts a container,
//! health-checks it, and swaps traffic to it with zero downtime. Services
//! removed from the desired state are torn down, and lifecycle events are
//! reported upstream via heartbeats.
//!
//! ## Architecture
//!
//! - **Reconciler** — the control loop: fetch desired state, diff, drive the
//!   deployer, swap router tables, persist the applied state, heartbeat.
//! - **Deployer** — per-service blue/green state machine over a
//!   [`docker::ContainerRuntime`].
//! - **PortAllocator** — paired (even, odd) host ports per service, stable
//!   across restarts via reservation.
//! - **Router** — external (Host-header) and internal (`*.svc.internal`)
//!   reverse proxies with atomically swapped route tables.
//! - **StateStore** — SQLite record of applied version, per-service process
//!   rows and append-only service logs.
//!
//! ## Concurrency model
//!
//! One process, cooperative tasks: the reconciler loop, one task per router
//! listener, and two log-capture tasks per service. Shared maps sit behind
//! their own read/write locks and are never held across await points; the
//! state store is single-writer.

pub mod api;
pub mod config;
pub mod deploy;
pub mod docker;
pub mod dockerfile;
pub mod error;
pub mod firewall;
pub mod lifecycle;
pub mod ports;
pub mod proxy;
pub mod reconciler;
pub mod secrets;
pub mod state;
pub mod vcs;

pub use config::Config;
pub use deploy::Deployer;
pub use error::{Error, Result};
pub use ports::{PortAllocator, PortPair};
pub use proxy::Router;
pub use reconciler::Reconciler;
pub use secrets::SecretStore;
pub use state::StateStore;
