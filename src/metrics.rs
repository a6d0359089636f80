use crate::state::AppState;
use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

pub struct Metrics {
    registry: Registry,
    http_requests: IntCounterVec,
    http_response_bytes: IntCounterVec,
    meme_requests: IntCounterVec,
    cache_lookups: IntCounterVec,
    fetch_failures: IntCounterVec,
    render_duration: HistogramVec,
    fetch_duration: HistogramVec,
    inflight_requests: IntGauge,
    renders_in_flight: IntGauge,
    disk_bytes: IntGaugeVec,
    templates_loaded: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let http_requests = IntCounterVec::new(
            Opts::new(
                "memegen_http_requests_total",
                "HTTP request count by route group, method, and status",
            ),
            &["route_group", "method", "status"],
        )
        .expect("http_requests_total");
        let http_response_bytes = IntCounterVec::new(
            Opts::new(
                "memegen_http_response_bytes_total",
                "HTTP response bytes by route group",
            ),
            &["route_group"],
        )
        .expect("http_response_bytes_total");
        let meme_requests = IntCounterVec::new(
            Opts::new("memegen_meme_requests_total", "Meme requests by outcome"),
            &["outcome"],
        )
        .expect("meme_requests_total");
        let cache_lookups = IntCounterVec::new(
            Opts::new("memegen_cache_lookups_total", "Response cache lookups by result"),
            &["result"],
        )
        .expect("cache_lookups_total");
        let fetch_failures = IntCounterVec::new(
            Opts::new("memegen_fetch_failures_total", "Remote image failures by kind"),
            &["kind"],
        )
        .expect("fetch_failures_total");
        let render_duration = HistogramVec::new(
            HistogramOpts::new("memegen_render_duration_seconds", "Render duration by source")
                .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["source"],
        )
        .expect("render_duration_seconds");
        let fetch_duration = HistogramVec::new(
            HistogramOpts::new("memegen_fetch_duration_seconds", "Remote fetch duration by result")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["result"],
        )
        .expect("fetch_duration_seconds");
        let inflight_requests = IntGauge::new("memegen_inflight_requests", "Requests in flight")
            .expect("inflight_requests");
        let renders_in_flight =
            IntGauge::new("memegen_renders_in_flight", "Compositor permits in use")
                .expect("renders_in_flight");
        let disk_bytes = IntGaugeVec::new(
            Opts::new("memegen_disk_bytes", "Disk usage by path"),
            &["path"],
        )
        .expect("disk_bytes");
        let templates_loaded = IntGauge::new("memegen_templates_loaded", "Catalog entries loaded")
            .expect("templates_loaded");

        registry
            .register(Box::new(http_requests.clone()))
            .expect("register http_requests_total");
        registry
            .register(Box::new(http_response_bytes.clone()))
            .expect("register http_response_bytes_total");
        registry
            .register(Box::new(meme_requests.clone()))
            .expect("register meme_requests_total");
        registry
            .register(Box::new(cache_lookups.clone()))
            .expect("register cache_lookups_total");
        registry
            .register(Box::new(fetch_failures.clone()))
            .expect("register fetch_failures_total");
        registry
            .register(Box::new(render_duration.clone()))
            .expect("register render_duration_seconds");
        registry
            .register(Box::new(fetch_duration.clone()))
            .expect("register fetch_duration_seconds");
        registry
            .register(Box::new(inflight_requests.clone()))
            .expect("register inflight_requests");
        registry
            .register(Box::new(renders_in_flight.clone()))
            .expect("register renders_in_flight");
        registry
            .register(Box::new(disk_bytes.clone()))
            .expect("register disk_bytes");
        registry
            .register(Box::new(templates_loaded.clone()))
            .expect("register templates_loaded");

        Self {
            registry,
            http_requests,
            http_response_bytes,
            meme_requests,
            cache_lookups,
            fetch_failures,
            render_duration,
            fetch_duration,
            inflight_requests,
            renders_in_flight,
            disk_bytes,
            templates_loaded,
        }
    }

    pub fn gather(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    pub fn inflight_guard(self: &Arc<Self>) -> InflightGuard {
        self.inflight_requests.inc();
        InflightGuard {
            metrics: Arc::clone(self),
        }
    }

    pub fn observe_http_request(&self, route_group: &str, method: &str, status: &str) {
        self.http_requests
            .with_label_values(&[route_group, method, status])
            .inc();
    }

    pub fn add_http_response_bytes(&self, route_group: &str, bytes: u64) {
        self.http_response_bytes
            .with_label_values(&[route_group])
            .inc_by(bytes);
    }

    pub fn observe_meme_outcome(&self, outcome: &str) {
        self.meme_requests.with_label_values(&[outcome]).inc();
    }

    pub fn observe_cache_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups.with_label_values(&[result]).inc();
    }

    pub fn observe_fetch_failure(&self, kind: &str) {
        self.fetch_failures.with_label_values(&[kind]).inc();
    }

    pub fn observe_render_duration(&self, source: &str, duration: Duration) {
        self.render_duration
            .with_label_values(&[source])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_fetch_duration(&self, result: &str, duration: Duration) {
        self.fetch_duration
            .with_label_values(&[result])
            .observe(duration.as_secs_f64());
    }

    pub fn set_renders_in_flight(&self, in_use: i64) {
        self.renders_in_flight.set(in_use);
    }

    pub fn set_disk_bytes(&self, path: &str, bytes: u64) {
        self.disk_bytes.with_label_values(&[path]).set(bytes as i64);
    }

    pub fn set_templates_loaded(&self, count: usize) {
        self.templates_loaded.set(count as i64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InflightGuard {
    metrics: Arc<Metrics>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.metrics.inflight_requests.dec();
    }
}

/// Refreshes gauges that are sampled rather than counted. Called before each scrape.
pub async fn refresh_metrics(state: &AppState) {
    let metrics = &state.metrics;
    if let Ok(bytes) = state.cache.size_bytes().await {
        metrics.set_disk_bytes("response_cache", bytes);
    }
    metrics.set_renders_in_flight(state.compositor.renders_in_flight() as i64);
    metrics.set_templates_loaded(state.registry.len());
}
