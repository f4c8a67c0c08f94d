//! Prometheus metrics for the gateway.
//!
//! All metrics are exported at the `GET /metrics` endpoint.
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `gateway_http_requests_total` | Counter | Requests by handler/status |
//! | `gateway_upload_bytes_total` | Counter | Bytes accepted for upload |
//! | `gateway_download_redirects_total` | Counter | Download redirects issued |
//! | `gateway_cache_hits_total` | Counter | Hash cache hits |
//! | `gateway_cache_misses_total` | Counter | Hash cache misses |
//! | `gateway_active_uploads` | Gauge | In-flight upload requests |

use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// Prometheus metrics collection for the gateway.
///
/// Uses `parking_lot::RwLock` for the registry so concurrent scrapes never
/// block metric updates.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<RwLock<Registry>>,
    pub http_requests: Family<[(String, String); 2], Counter>, // handler, status
    pub upload_bytes: Counter,
    pub download_redirects: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub active_uploads: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let http_requests = Family::<[(String, String); 2], Counter>::default();
        registry.register(
            "gateway_http_requests_total",
            "Total HTTP requests handled",
            http_requests.clone(),
        );

        let upload_bytes = Counter::default();
        registry.register(
            "gateway_upload_bytes_total",
            "Total bytes accepted for upload",
            upload_bytes.clone(),
        );

        let download_redirects = Counter::default();
        registry.register(
            "gateway_download_redirects_total",
            "Total download redirects issued",
            download_redirects.clone(),
        );

        let cache_hits = Counter::default();
        registry.register(
            "gateway_cache_hits_total",
            "Total hash cache hits",
            cache_hits.clone(),
        );

        let cache_misses = Counter::default();
        registry.register(
            "gateway_cache_misses_total",
            "Total hash cache misses",
            cache_misses.clone(),
        );

        let active_uploads = Gauge::default();
        registry.register(
            "gateway_active_uploads",
            "Number of currently active uploads",
            active_uploads.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            http_requests,
            upload_bytes,
            download_redirects,
            cache_hits,
            cache_misses,
            active_uploads,
        }
    }

    /// Count one handled request under (handler, status) labels.
    pub fn record_request(&self, handler: &str, status: &str) {
        self.http_requests
            .get_or_create(&[
                ("handler".to_string(), handler.to_string()),
                ("status".to_string(), status.to_string()),
            ])
            .inc();
    }

    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        let registry = self.registry.read();
        if let Err(e) = encode(&mut buffer, &registry) {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            return format!("# Error encoding metrics: {}", e);
        }
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
