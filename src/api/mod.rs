//! Control-plane API: desired-state fetch and heartbeat push.
//!
//! The agent is a pure consumer of the control plane. Both calls are
//! idempotent from the agent's perspective; at-least-once delivery is
//! acceptable and expected.

mod client;
mod types;

pub use client::ControlPlaneClient;
pub use types::{DesiredState, HeartbeatRequest, Service, ServiceStatusReport};

use crate::error::Result;
use async_trait::async_trait;

/// Narrow seam over the control plane so the reconciler can be driven by a
/// fake in tests.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_desired_state(&self, stack_id: &str) -> Result<DesiredState>;
    async fn send_heartbeat(&self, req: &HeartbeatRequest) -> Result<()>;
}
