use std::net::SocketAddr;
use std::sync::LazyLock;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing;
use prometheus::{
    opts, register_histogram, register_int_counter, Histogram, IntCounter, TextEncoder,
};

use dns_resolver::metrics::MetricsSink;

pub const RESPONSE_TIME_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.0010, 0.0025, 0.0050, 0.0075, 0.0100, 0.0250, 0.0500, 0.0750, 0.1000,
    0.2500, 0.5000, 0.7500, 1.0000,
];

static DNS_RESOLVER_AUTHORITATIVE_HIT_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_resolver_authoritative_hit_total",
        "Total number of hits of local authoritative data."
    ))
    .unwrap()
});

static DNS_RESOLVER_NXDOMAIN_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_resolver_nxdomain_total",
        "Total number of NXDOMAIN responses."
    ))
    .unwrap()
});

static DNS_RESOLVER_SERVFAIL_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_resolver_servfail_total",
        "Total number of SERVFAIL responses."
    ))
    .unwrap()
});

static DNS_RESOLVER_BLOCKED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_resolver_blocked_total",
        "Total number of queries refused by the blocklist."
    ))
    .unwrap()
});

static DNS_RESOLVER_NOT_IMPLEMENTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_resolver_not_implemented_total",
        "Total number of NOTIMP responses."
    ))
    .unwrap()
});

static DNS_RESOLVER_CACHE_HIT_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_resolver_cache_hit_total",
        "Total number of response-cache hits."
    ))
    .unwrap()
});

static DNS_RESOLVER_CACHE_MISS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_resolver_cache_miss_total",
        "Total number of response-cache misses."
    ))
    .unwrap()
});

static DNS_RESOLVER_UPSTREAM_HIT_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_resolver_upstream_hit_total",
        "Total number of successful upstream resolutions."
    ))
    .unwrap()
});

static DNS_RESOLVER_UPSTREAM_MISS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_resolver_upstream_miss_total",
        "Total number of failed upstream resolutions."
    ))
    .unwrap()
});

static DNS_QUERY_LATENCY_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "dns_query_latency_seconds",
        "End-to-end time to answer a single query.",
        RESPONSE_TIME_BUCKETS.to_vec()
    )
    .unwrap()
});

/// Wires the resolver's `MetricsSink` capability to process-global
/// Prometheus counters, the concrete collaborator behind the
/// dependency-inverted trait in `dns_resolver::metrics`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetrics;

impl MetricsSink for PrometheusMetrics {
    fn record_authoritative_hit(&self) {
        DNS_RESOLVER_AUTHORITATIVE_HIT_TOTAL.inc();
    }

    fn record_nxdomain(&self) {
        DNS_RESOLVER_NXDOMAIN_TOTAL.inc();
    }

    fn record_servfail(&self) {
        DNS_RESOLVER_SERVFAIL_TOTAL.inc();
    }

    fn record_blocked(&self) {
        DNS_RESOLVER_BLOCKED_TOTAL.inc();
    }

    fn record_not_implemented(&self) {
        DNS_RESOLVER_NOT_IMPLEMENTED_TOTAL.inc();
    }

    fn record_cache_hit(&self) {
        DNS_RESOLVER_CACHE_HIT_TOTAL.inc();
    }

    fn record_cache_miss(&self) {
        DNS_RESOLVER_CACHE_MISS_TOTAL.inc();
    }

    fn record_upstream_hit(&self) {
        DNS_RESOLVER_UPSTREAM_HIT_TOTAL.inc();
    }

    fn record_upstream_miss(&self) {
        DNS_RESOLVER_UPSTREAM_MISS_TOTAL.inc();
    }

    fn record_query_latency(&self, elapsed: Duration) {
        DNS_QUERY_LATENCY_SECONDS.observe(elapsed.as_secs_f64());
    }
}

async fn get_metrics() -> (StatusCode, String) {
    match TextEncoder::new().encode_to_string(&prometheus::gather()) {
        Ok(metrics_str) => (StatusCode::OK, metrics_str),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// Serves the `/metrics` endpoint until the process exits. Run on its
/// own listener, separate from the DNS UDP port.
pub async fn serve(address: SocketAddr) -> std::io::Result<()> {
    let app = axum::Router::new().route("/metrics", routing::get(get_metrics));
    let listener = tokio::net::TcpListener::bind(address).await?;
    axum::serve(listener, app).await
}
