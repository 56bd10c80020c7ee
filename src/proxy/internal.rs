use super::{forward, host_header, host_without_port, text_response, Router};
use crate::error::{Error, Result};
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Response, StatusCode};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const INTERNAL_SUFFIX: &str = ".svc.internal";

/// Internal reverse proxy for service-to-service calls.
///
/// Binds loopback only. Accepts Hosts of the form `<name>.svc.internal`,
/// rejects everything else with 400, and 404s unknown service names.
pub struct InternalProxy {
    router: Router,
    bind_addr: String,
    port: u16,
}

impl InternalProxy {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            bind_addr: "127.0.0.1".to_string(),
            port: 80,
        }
    }

    /// Bind target override for tests (port 80 needs root).
    pub fn with_bind(mut self, bind_addr: impl Into<String>, port: u16) -> Self {
        self.bind_addr = bind_addr.into();
        self.port = port;
        self
    }

    /// Serve until `shutdown` fires, then drain for up to 5 s.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.bind_addr, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("internal proxy bind {} failed: {}", addr, e)))?;
        info!("Internal proxy listening on {}", addr);

        let app = axum::Router::new()
            .fallback(handle)
            .with_state(self.router.clone());

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(Error::from)
    }
}

async fn handle(
    State(router): State<Router>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response<Body> {
    let Some(raw_host) = host_header(req.headers()) else {
        return text_response(StatusCode::BAD_REQUEST, "missing Host header".to_string());
    };
    let host = host_without_port(&raw_host).to_string();

    let Some(service_name) = host.strip_suffix(INTERNAL_SUFFIX) else {
        return text_response(
            StatusCode::BAD_REQUEST,
            format!("invalid host '{}'", host),
        );
    };

    let Some(port) = router.internal_port_for(service_name) else {
        return text_response(
            StatusCode::NOT_FOUND,
            format!("service '{}' not found", service_name),
        );
    };

    forward(port, remote_addr, &raw_host, req).await
}
