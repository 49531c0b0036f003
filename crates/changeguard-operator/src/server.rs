//! Network servers
//!
//! Admission webhooks are served over TLS (the API server only calls HTTPS
//! webhooks). The review-service callback and the health endpoints share a
//! plain HTTP listener. Both stop when the shutdown token fires.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Time in-flight requests get to finish after shutdown starts
const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(10);

/// Liveness and readiness endpoints
pub fn health_router() -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
}

/// Serve `router` over TLS with `tls.crt`/`tls.key` from `cert_dir`
pub async fn serve_tls(
    addr: SocketAddr,
    cert_dir: &Path,
    router: Router,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let tls_config = RustlsConfig::from_pem_file(cert_dir.join("tls.crt"), cert_dir.join("tls.key"))
        .await
        .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?;

    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        shutdown.graceful_shutdown(Some(GRACEFUL_SHUTDOWN));
    });

    info!(addr = %addr, "Starting webhook server");
    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("webhook server error: {}", e))
}

/// Serve `router` over plain HTTP
pub async fn serve_http(
    addr: SocketAddr,
    router: Router,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", addr, e))?;
    info!(addr = %addr, "Starting callback server");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| anyhow::anyhow!("callback server error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_endpoints_answer_ok() {
        for path in ["/healthz", "/readyz"] {
            let response = health_router()
                .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{path}");
        }
    }
}
