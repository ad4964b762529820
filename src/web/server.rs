use std::sync::Arc;
use axum::{
    Router,
    extract::State,
    http::header,
    response::{IntoResponse, Json},
    routing::get,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Config;
use crate::metrics::render_metrics;
use crate::monitor::{MonitorHandle, MonitorSnapshot};

/// Read-only HTTP surface over a running monitor
pub struct WebServer {
    monitor: MonitorHandle,
    config: Arc<Config>,
}

#[derive(Clone)]
struct AppState {
    monitor: MonitorHandle,
}

impl WebServer {
    pub fn new(monitor: MonitorHandle, config: Arc<Config>) -> Self {
        Self { monitor, config }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        if !self.config.web.enabled {
            info!("Web API disabled");
            return Ok(());
        }

        let addr = format!("{}:{}", self.config.web.address, self.config.web.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("🌐 Web API listening on http://{}", addr);

        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    fn router(&self) -> Router {
        let state = AppState {
            monitor: self.monitor.clone(),
        };

        Router::new()
            .route("/api/snapshot", get(api_snapshot))
            .route("/api/recommendation", get(api_recommendation))
            .route("/metrics", get(metrics))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}

/// Full ranked snapshot
async fn api_snapshot(State(state): State<AppState>) -> Json<MonitorSnapshot> {
    Json(state.monitor.snapshot())
}

/// Just the recommendation part
async fn api_recommendation(State(state): State<AppState>) -> Json<serde_json::Value> {
    let view = state.monitor.recommendation();
    Json(serde_json::json!({
        "phase": view.phase,
        "recommendation": view.current.as_deref(),
        "status": view.status,
        "degraded": view.degraded,
        "excluded": view.excluded,
    }))
}

/// Prometheus text exposition
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = render_metrics(state.monitor.counters(), &state.monitor.snapshot());
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Monitor;
    use crate::prober::tests::FakeProbe;
    use crate::target::test_descriptor;
    use crate::verifier::NoVerifier;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_endpoints_serve_snapshot_and_metrics() {
        let config = Arc::new(Config::parse("[recommend]\ngrace_period_secs = 3600\n").unwrap());
        let monitor = Monitor::start(
            config.clone(),
            vec![test_descriptor("a"), test_descriptor("b")],
            Arc::new(FakeProbe::new(true)),
            Arc::new(NoVerifier),
        )
        .unwrap();
        let base = serve(WebServer::new(monitor.handle(), config).router()).await;

        let snap: serde_json::Value = reqwest::get(format!("{}/api/snapshot", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(snap["version"], 1);
        assert_eq!(snap["ranked"].as_array().unwrap().len(), 2);

        let rec: serde_json::Value = reqwest::get(format!("{}/api/recommendation", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        // Still inside the grace period
        assert!(rec["recommendation"].is_null());
        assert_eq!(rec["phase"], "none");

        let text = reqwest::get(format!("{}/metrics", base))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(text.contains("# TYPE proxywatch_probes_total counter"));
        assert!(text.contains("proxywatch_targets{state=\"live\"} 2"));

        monitor.shutdown().await;
    }
}
