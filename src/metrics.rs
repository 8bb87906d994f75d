// Prometheus Metrics Collection
//
// Registry and recording helpers for the ingest/query service: HTTP
// requests, cache and database operation latency, hits ingested, and
// webhook delivery outcomes.

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

/// AppMetrics contains all Prometheus metrics for the service.
pub struct AppMetrics {
    pub registry: Registry,

    // HTTP surface
    pub http_requests_total: IntCounterVec,
    pub http_request_duration: HistogramVec,

    // Ingest pipeline
    pub hits_ingested_total: IntCounter,
    pub hits_filtered_total: CounterVec,

    // Cache and database latency
    pub cache_operation_duration: HistogramVec,
    pub db_operation_duration: HistogramVec,

    // Webhook delivery outcomes
    pub webhook_deliveries_total: CounterVec,
    pub webhook_delivery_duration: HistogramVec,

    // Operational gauges
    pub db_connections_active: IntGauge,
}

impl AppMetrics {
    /// Create a new metrics registry with all application metrics
    pub fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests by route and status"),
            &["method", "route", "status"],
        )
        .unwrap();

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "HTTP request latency"),
            &["method", "route"],
        )
        .unwrap();

        let hits_ingested_total = IntCounter::new(
            "hits_ingested_total",
            "Total tracking hits accepted and persisted",
        )
        .unwrap();

        let hits_filtered_total = CounterVec::new(
            Opts::new("hits_filtered_total", "Hits dropped before persistence"),
            &["reason"],
        )
        .unwrap();

        let cache_operation_duration = HistogramVec::new(
            HistogramOpts::new("cache_operation_duration_seconds", "Cache operation latency"),
            &["operation", "result"],
        )
        .unwrap();

        let db_operation_duration = HistogramVec::new(
            HistogramOpts::new("db_operation_duration_seconds", "Database operation latency"),
            &["query_type", "result"],
        )
        .unwrap();

        let webhook_deliveries_total = CounterVec::new(
            Opts::new("webhook_deliveries_total", "Webhook delivery attempts by outcome"),
            &["outcome"],
        )
        .unwrap();

        let webhook_delivery_duration = HistogramVec::new(
            HistogramOpts::new("webhook_delivery_duration_seconds", "Webhook delivery latency"),
            &["outcome"],
        )
        .unwrap();

        let db_connections_active = IntGauge::new(
            "db_connections_active",
            "Number of active database connections",
        )
        .unwrap();

        // Register all metrics
        registry.register(Box::new(http_requests_total.clone())).unwrap();
        registry.register(Box::new(http_request_duration.clone())).unwrap();
        registry.register(Box::new(hits_ingested_total.clone())).unwrap();
        registry.register(Box::new(hits_filtered_total.clone())).unwrap();
        registry.register(Box::new(cache_operation_duration.clone())).unwrap();
        registry.register(Box::new(db_operation_duration.clone())).unwrap();
        registry.register(Box::new(webhook_deliveries_total.clone())).unwrap();
        registry.register(Box::new(webhook_delivery_duration.clone())).unwrap();
        registry.register(Box::new(db_connections_active.clone())).unwrap();

        Self {
            registry,
            http_requests_total,
            http_request_duration,
            hits_ingested_total,
            hits_filtered_total,
            cache_operation_duration,
            db_operation_duration,
            webhook_deliveries_total,
            webhook_delivery_duration,
            db_connections_active,
        }
    }

    pub fn record_http_request(&self, method: &str, route: &str, status: u16, duration: f64) {
        self.http_requests_total
            .with_label_values(&[method, route, &status.to_string()])
            .inc();
        self.http_request_duration
            .with_label_values(&[method, route])
            .observe(duration);
    }

    pub fn record_hit_ingested(&self) {
        self.hits_ingested_total.inc();
    }

    pub fn record_hit_filtered(&self, reason: &str) {
        self.hits_filtered_total.with_label_values(&[reason]).inc();
    }

    pub fn record_cache_operation(&self, operation: &str, result: &str, duration: f64) {
        self.cache_operation_duration
            .with_label_values(&[operation, result])
            .observe(duration);
    }

    pub fn record_db_operation(&self, query_type: &str, result: &str, duration: f64) {
        self.db_operation_duration
            .with_label_values(&[query_type, result])
            .observe(duration);
    }

    pub fn record_webhook_delivery(&self, outcome: &str, duration: f64) {
        self.webhook_deliveries_total
            .with_label_values(&[outcome])
            .inc();
        self.webhook_delivery_duration
            .with_label_values(&[outcome])
            .observe(duration);
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if encoder.encode(&families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}
