//! HTTP routing.
//!
//! Two reverse proxies share one [`Router`]: the external listener routes by
//! Host header to the active port of the owning service, the internal
//! listener serves `<name>.svc.internal` for service-to-service calls. Route
//! tables are replaced wholesale under a write lock; lookups take a read
//! lock, so no request ever observes a half-updated table.

mod dns;
mod external;
mod internal;

pub use dns::HostsDns;
pub use external::ExternalProxy;
pub use internal::InternalProxy;

use axum::body::Body;
use axum::http::{HeaderMap, Response, StatusCode};
use parking_lot::RwLock;
use reqwest::Client;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// How long graceful listener shutdown may take before the task is abandoned.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Routing identity of one service: its external hostname (if any) and its
/// internal service name.
#[derive(Debug, Clone)]
pub struct ServiceKeys {
    pub hostname: Option<String>,
    pub name: String,
}

#[derive(Default)]
struct RouterInner {
    /// Host header -> active port.
    external: RwLock<HashMap<String, u16>>,
    /// Service name -> active port.
    internal: RwLock<HashMap<String, u16>>,
    /// service_id -> routing keys, for single-route refreshes.
    service_keys: RwLock<HashMap<String, ServiceKeys>>,
}

/// Shared route state. Clones are cheap handles onto the same tables.
#[derive(Clone, Default)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the external table with a copy of `routes`.
    pub fn update_external(&self, routes: &HashMap<String, u16>) {
        let copy = routes.clone();
        *self.inner.external.write() = copy;
    }

    /// Atomically replace the internal table with a copy of `routes`.
    pub fn update_internal(&self, routes: &HashMap<String, u16>) {
        let copy = routes.clone();
        *self.inner.internal.write() = copy;
    }

    /// Replace the service_id -> keys index used by [`Router::set_route`].
    pub fn update_service_keys(&self, keys: HashMap<String, ServiceKeys>) {
        *self.inner.service_keys.write() = keys;
    }

    /// Point one service at a new active port, producing refreshed tables.
    ///
    /// This is the deployer's promotion hook: it runs between health-check
    /// success and the drain window, so it must never tear the tables.
    pub fn set_route(&self, service_id: &str, active_port: u16) {
        let keys = self.inner.service_keys.read().get(service_id).cloned();
        let Some(keys) = keys else {
            return;
        };

        if let Some(hostname) = &keys.hostname {
            let mut refreshed = self.inner.external.read().clone();
            refreshed.insert(hostname.clone(), active_port);
            *self.inner.external.write() = refreshed;
        }

        let mut refreshed = self.inner.internal.read().clone();
        refreshed.insert(keys.name.clone(), active_port);
        *self.inner.internal.write() = refreshed;
    }

    pub fn external_port_for(&self, host: &str) -> Option<u16> {
        self.inner.external.read().get(host).copied()
    }

    pub fn internal_port_for(&self, name: &str) -> Option<u16> {
        self.inner.internal.read().get(name).copied()
    }

    /// Snapshot of the external table.
    pub fn external_routes(&self) -> HashMap<String, u16> {
        self.inner.external.read().clone()
    }

    /// Snapshot of the internal table.
    pub fn internal_routes(&self) -> HashMap<String, u16> {
        self.inner.internal.read().clone()
    }
}

/// Shared upstream client for both proxies. One pool avoids file-descriptor
/// exhaustion under many concurrent proxied requests.
fn upstream_client() -> &'static Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(16)
            .build()
            .expect("failed to build proxy upstream client")
    })
}

/// Host header value with any `:port` suffix removed.
fn host_without_port(host: &str) -> &str {
    match host.find(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}

fn host_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn text_response(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_default()
}

/// Reverse-proxy one request to `127.0.0.1:<port>`, preserving the full path
/// and query and rewriting the X-Forwarded-* headers.
async fn forward(
    port: u16,
    remote_addr: SocketAddr,
    original_host: &str,
    req: axum::extract::Request,
) -> Response<Body> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = format!("http://127.0.0.1:{}{}", port, path_and_query);

    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);

    let headers = req.headers().clone();
    let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return text_response(
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {}", e),
            )
        }
    };

    let mut upstream = upstream_client().request(method, &url);
    for (name, value) in headers.iter() {
        // Hop-by-hop and recomputed headers stay behind.
        let lower = name.as_str().to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "host" | "connection" | "content-length" | "transfer-encoding"
        ) {
            continue;
        }
        if let Ok(value_str) = value.to_str() {
            upstream = upstream.header(name.as_str(), value_str);
        }
    }
    upstream = upstream
        .header("X-Forwarded-Host", original_host)
        .header("X-Forwarded-Proto", "http")
        .header("X-Forwarded-For", remote_addr.ip().to_string())
        .body(body);

    let resp = match upstream.send().await {
        Ok(resp) => resp,
        Err(e) => {
            return text_response(StatusCode::BAD_GATEWAY, format!("upstream error: {}", e))
        }
    };

    let status =
        StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in resp.headers().iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if matches!(lower.as_str(), "connection" | "transfer-encoding") {
            continue;
        }
        if let Ok(value_str) = value.to_str() {
            builder = builder.header(name.as_str(), value_str);
        }
    }

    builder
        .body(Body::from_stream(resp.bytes_stream()))
        .unwrap_or_else(|_| text_response(StatusCode::BAD_GATEWAY, "invalid upstream response".into()))
}
