use std::time::Duration;

/// The metrics a resolution pass reports, independent of how they
/// are actually exposed (Prometheus, a log line, nothing at all).
/// The resolver is parameterized over this the same way it is over
/// the blocklist, zone cache, and upstream forwarder — concrete
/// sinks are wired up by the binary.
pub trait MetricsSink: Send + Sync {
    fn record_authoritative_hit(&self) {}
    fn record_nxdomain(&self) {}
    fn record_servfail(&self) {}
    fn record_blocked(&self) {}
    fn record_not_implemented(&self) {}
    fn record_cache_hit(&self) {}
    fn record_cache_miss(&self) {}
    fn record_upstream_hit(&self) {}
    fn record_upstream_miss(&self) {}
    fn record_query_latency(&self, _elapsed: Duration) {}
}

/// The default sink: every event is discarded.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_metrics_accepts_every_event() {
        let sink = NoopMetrics;
        sink.record_authoritative_hit();
        sink.record_nxdomain();
        sink.record_servfail();
        sink.record_blocked();
        sink.record_not_implemented();
        sink.record_cache_hit();
        sink.record_cache_miss();
        sink.record_upstream_hit();
        sink.record_upstream_miss();
        sink.record_query_latency(Duration::from_millis(5));
    }
}
