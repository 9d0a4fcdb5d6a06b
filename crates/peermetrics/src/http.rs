//! Scrape endpoint.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/metrics` | Merged exposition for the whole pool |
//! | GET | `/metrics?nodes=1,3` | Merged exposition for the listed peers |

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use tracing::warn;

use crate::PeerIndex;
use crate::hub::MetricsHub;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Debug, Default, Deserialize)]
pub struct MetricsQuery {
    /// Comma-separated peer indices.
    pub nodes: Option<String>,
}

pub fn metrics_router(hub: Arc<MetricsHub>) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics))
        .with_state(hub)
}

/// Parse `"1, 3,4"` into peer indices. Empty input means every peer.
pub fn parse_nodes(raw: &str) -> Result<Vec<PeerIndex>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<PeerIndex>().map_err(|_| format!("invalid node index: {s:?}")))
        .collect()
}

/// GET /metrics
pub async fn prometheus_metrics(
    State(hub): State<Arc<MetricsHub>>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    let targets = match query.nodes.as_deref().map(parse_nodes).transpose() {
        Ok(targets) => targets.unwrap_or_default(),
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };

    match hub.get_metrics(&targets).await {
        Ok(body) => (StatusCode::OK, [("content-type", CONTENT_TYPE)], body).into_response(),
        Err(e) if e.is_timeout() => {
            warn!(error = %e, "scrape timed out waiting for peers");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
        Err(e) => {
            warn!(error = %e, "scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use peermetrics_cluster::{ClusterConfig, MemoryHub, Message, Transport};

    use crate::hub::MetricsInit;

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn parse_nodes_lists() {
        assert_eq!(parse_nodes("1,2, 3").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_nodes("").unwrap(), Vec::<PeerIndex>::new());
        assert!(parse_nodes("1,x").is_err());
        assert!(parse_nodes("-1").is_err());
    }

    #[tokio::test]
    async fn scrape_returns_text() {
        let hub = Arc::new(MetricsHub::new());
        let resp = metrics_router(hub).oneshot(get("/metrics")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.contains("text/plain"));
        assert!(body_text(resp).await.contains("current_cluster 0"));
    }

    #[tokio::test]
    async fn bad_nodes_is_400() {
        let hub = Arc::new(MetricsHub::new());
        let resp = metrics_router(hub)
            .oneshot(get("/metrics?nodes=1,abc"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn silent_peer_is_503() {
        let bus = MemoryHub::new("t");
        let hub = Arc::new(MetricsHub::new());
        let config = ClusterConfig {
            instance: Some(1),
            request_timeout_ms: 50,
            ..Default::default()
        };
        hub.init(&config, Some(Arc::new(bus.connect())), MetricsInit::new())
            .unwrap();

        let mute = bus.connect();
        let keepalive = Message::Keepalive {
            id: "k".to_string(),
            index: 2,
        };
        mute.post(keepalive.encode().unwrap()).unwrap();
        let cluster = hub.cluster().unwrap();
        while cluster.count() < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let resp = metrics_router(hub)
            .oneshot(get("/metrics?nodes=2"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
