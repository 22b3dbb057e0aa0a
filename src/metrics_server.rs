//! Scrape endpoint for a VM supervised by `hyperpod run`
//!
//! `/metrics` is the registry in Prometheus text format. `/health` names the
//! VM and the driver behind it, so a scrape target left over from an earlier
//! run is easy to tell apart.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::metrics;

/// What `/health` reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmStatus {
    pub vm: String,
    pub driver: &'static str,
}

pub fn router(status: VmStatus) -> Router {
    Router::new()
        .route("/metrics", get(scrape))
        .route("/health", get(health))
        .with_state(Arc::new(status))
        .layer(TraceLayer::new_for_http())
}

/// Serve on an already bound listener until it fails.
pub async fn serve(listener: TcpListener, status: VmStatus) -> Result<()> {
    axum::serve(listener, router(status))
        .await
        .context("Metrics server error")
}

pub async fn start_metrics_server(port: u16, status: VmStatus) -> Result<()> {
    metrics::init().context("Failed to initialize metrics")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {}", addr))?;
    info!(%addr, vm = %status.vm, "serving vm metrics");
    serve(listener, status).await
}

async fn scrape() -> Response {
    match metrics::gather_metrics() {
        Ok(text) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], text).into_response(),
        Err(e) => {
            error!(error = %e, "gather metrics failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health(State(status): State<Arc<VmStatus>>) -> Json<VmStatus> {
    Json(status.as_ref().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn status() -> VmStatus {
        VmStatus {
            vm: "vm-7".to_string(),
            driver: "qemu",
        }
    }

    async fn body_text(response: Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8_lossy(&body).into_owned()
    }

    #[tokio::test]
    async fn test_health_names_vm_and_driver() {
        let response = router(status())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body, serde_json::json!({"vm": "vm-7", "driver": "qemu"}));
    }

    #[tokio::test]
    async fn test_scrape_is_prometheus_text() {
        metrics::init().unwrap();
        metrics::QMP_COMMAND_RETRIES_TOTAL.inc();
        let response = router(status())
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            prometheus::TEXT_FORMAT
        );
        assert!(body_text(response).await.contains("qmp_command_retries_total"));
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let response = router(status())
            .oneshot(Request::get("/vms").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
