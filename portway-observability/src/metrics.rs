use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Metrics collector for the gateway.
///
/// Prometheus pull only; the text exposition is served from the health
/// surface.
pub struct GatewayMetrics {
    registry: Registry,

    /// Total requests by endpoint kind, method, status
    pub requests_total: IntCounterVec,

    /// Request latency histogram by endpoint kind
    pub request_duration: HistogramVec,

    /// Upstream (proxy/SQL) latency histogram
    pub upstream_latency: HistogramVec,

    /// Proxy cache events by outcome (hit/miss/bypass)
    pub cache_events: IntCounterVec,

    /// Rate-limit refusals by resource (ip/token)
    pub rate_limited_total: IntCounterVec,

    /// Endpoints in the active catalog snapshot
    pub catalog_endpoints: IntGauge,
}

impl GatewayMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("portway_requests_total", "Total requests").namespace("portway"),
            &["kind", "method", "status"],
        )?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new("portway_request_duration_seconds", "Request latency")
                .namespace("portway")
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
            &["kind"],
        )?;

        let upstream_latency = HistogramVec::new(
            HistogramOpts::new("portway_upstream_latency_seconds", "Upstream response time")
                .namespace("portway")
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ]),
            &["backend"],
        )?;

        let cache_events = IntCounterVec::new(
            Opts::new("portway_cache_events_total", "Proxy cache events").namespace("portway"),
            &["outcome"],
        )?;

        let rate_limited_total = IntCounterVec::new(
            Opts::new("portway_rate_limited_total", "Rate-limit refusals").namespace("portway"),
            &["resource"],
        )?;

        let catalog_endpoints =
            IntGauge::new("portway_catalog_endpoints", "Endpoints in the active catalog")?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;
        registry.register(Box::new(cache_events.clone()))?;
        registry.register(Box::new(rate_limited_total.clone()))?;
        registry.register(Box::new(catalog_endpoints.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            upstream_latency,
            cache_events,
            rate_limited_total,
            catalog_endpoints,
        })
    }

    /// Record one completed request.
    pub fn record_request(&self, kind: &str, method: &str, status: u16, duration_secs: f64) {
        self.requests_total
            .with_label_values(&[kind, method, &status.to_string()])
            .inc();
        self.request_duration
            .with_label_values(&[kind])
            .observe(duration_secs);
    }

    /// Prometheus text exposition.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metrics = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metrics, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics collector")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_gather() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.record_request("sql", "GET", 200, 0.01);
        metrics.record_request("proxy", "GET", 502, 1.2);
        metrics.cache_events.with_label_values(&["hit"]).inc();
        metrics.rate_limited_total.with_label_values(&["ip"]).inc();
        metrics.catalog_endpoints.set(12);

        let text = metrics.gather_text();
        assert!(text.contains("portway_requests_total"));
        assert!(text.contains("portway_cache_events_total"));
        assert!(text.contains("portway_rate_limited_total"));
        assert!(text.contains("portway_catalog_endpoints 12"));
    }
}
