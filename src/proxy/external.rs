use super::{forward, host_header, host_without_port, text_response, Router};
use crate::error::{Error, Result};
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Response, StatusCode};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// External reverse proxy: routes by Host header.
///
/// Binds `<bind_addr>:<port>` and forwards each request to the active port
/// of the service owning the request's hostname. Unknown hostnames get a 404
/// naming the host.
pub struct ExternalProxy {
    router: Router,
    bind_addr: String,
    port: u16,
}

impl ExternalProxy {
    pub fn new(router: Router, bind_addr: impl Into<String>, port: u16) -> Self {
        Self {
            router,
            bind_addr: bind_addr.into(),
            port,
        }
    }

    /// Serve until `shutdown` fires, then drain for up to 5 s.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.bind_addr, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("external proxy bind {} failed: {}", addr, e)))?;
        info!("External proxy listening on {}", addr);

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

    let Some(port) = router.external_port_for(&host) else {
        return text_response(
            StatusCode::NOT_FOUND,
            format!("no route for host '{}'", host),
        );
    };

    forward(port, remote_addr, &raw_host, req).await
}
