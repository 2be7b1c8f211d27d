// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::args::OpenMetricsConfig;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use color_eyre::eyre;
use color_eyre::eyre::Context;
use haaukins_common::server::runtime::AppRuntime;
use std::net::SocketAddr;
use std::ops::Deref;
use tokio::net::TcpListener;
use tracing::{info, warn};

fn router(runtime: AppRuntime) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(runtime)
}

pub(crate) async fn main(runtime: AppRuntime, args: OpenMetricsConfig) -> eyre::Result<()> {
    let cancellation_token = runtime.cancellation_token.clone();
    let addr: SocketAddr = args
        .openmetrics_listen
        .parse()
        .context("unable to parse the listening address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("unable to start the metrics server, is the port taken?")?;

    info!("metrics exporter listening on {addr:?}");
    axum::serve(listener, router(runtime))
        .with_graceful_shutdown(async move {
            cancellation_token.cancelled().await;
        })
        .await
        .context("openmetrics server error")?;

    Ok(())
}

async fn metrics_handler(State(runtime): State<AppRuntime>) -> Response {
    let mut buffer = String::new();
    let res = prometheus_client::encoding::text::encode(
        &mut buffer,
        runtime.metrics_registry.read().await.deref(),
    );
    if let Err(error) = res {
        warn! {
            ?error,
            "unable to encode metrics"
        }
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use haaukins_common::server::runtime::{AppConfig, SharedConfig};
    use prometheus_client::metrics::counter::Counter;
    use prometheus_client::registry::Registry;
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    #[tokio::test]
    async fn should_export_registered_metrics() {
        let config: AppConfig = toml::from_str(r#"signing_key = "key""#).unwrap();
        let counter = Counter::<u64>::default();
        let mut registry = Registry::default();
        registry.register("haaukins_test", "A test counter", counter.clone());
        counter.inc();
        let runtime = AppRuntime {
            config: SharedConfig::new(config),
            metrics_registry: Arc::new(RwLock::new(registry)),
            cancellation_token: CancellationToken::new(),
        };

        let res = router(runtime)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("haaukins_test_total 1"));
        assert!(body.ends_with("# EOF\n"));
    }
}
