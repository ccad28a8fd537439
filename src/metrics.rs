//! Prometheus metrics, registered once at startup.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder,
};

pub static EVENTS_POLLED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("forgewatch_events_polled_total", "Events read from upstream pages")
        .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static EVENTS_ENQUEUED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("forgewatch_events_enqueued_total", "Events enqueued by priority"),
        &["priority"],
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static EVENTS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "forgewatch_events_dropped_total",
            "Events dropped under backpressure, by priority",
        ),
        &["priority"],
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static EVENTS_SAMPLED_OUT: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "forgewatch_events_sampled_out_total",
        "Low-priority events removed by the sampling filter",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static EVENTS_DEDUPED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "forgewatch_events_deduped_total",
        "Events discarded as recently seen",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static CORRUPT_EVENTS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "forgewatch_corrupt_events_total",
        "Events dropped for failing structural validation",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static EVENTS_PROCESSED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "forgewatch_events_processed_total",
        "Events scored by the stream processor",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static EVENTS_PREFILTERED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "forgewatch_events_prefiltered_total",
        "Low-priority events short-circuited by the pre-filter",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static ANOMALIES_DETECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("forgewatch_anomalies_total", "Anomaly records persisted, by severity"),
        &["severity"],
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static DETECTOR_TIMEOUTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("forgewatch_detector_timeouts_total", "Detector timeouts, by detector"),
        &["detector"],
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static DETECTOR_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("forgewatch_detector_errors_total", "Detector internal errors, by detector"),
        &["detector"],
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static PROCESSING_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "forgewatch_processing_duration_seconds",
        "Per-event processing latency",
    ))
    .unwrap();
    prometheus::register(Box::new(h.clone())).unwrap();
    h
});

pub static BATCHES_PROCESSED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("forgewatch_batches_total", "Batches processed").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static RESIDENT_PROFILES: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("forgewatch_resident_profiles", "Profiles resident in the cache")
        .unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

pub static BREAKER_OPEN: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "forgewatch_breaker_open",
        "Whether the upstream circuit breaker is open",
    )
    .unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

/// Touch every metric so the registry is fully populated before serving.
pub fn init() {
    let _ = &*EVENTS_POLLED;
    let _ = &*EVENTS_ENQUEUED;
    let _ = &*EVENTS_DROPPED;
    let _ = &*EVENTS_SAMPLED_OUT;
    let _ = &*EVENTS_DEDUPED;
    let _ = &*CORRUPT_EVENTS;
    let _ = &*EVENTS_PROCESSED;
    let _ = &*EVENTS_PREFILTERED;
    let _ = &*ANOMALIES_DETECTED;
    let _ = &*DETECTOR_TIMEOUTS;
    let _ = &*DETECTOR_ERRORS;
    let _ = &*PROCESSING_LATENCY;
    let _ = &*BATCHES_PROCESSED;
    let _ = &*RESIDENT_PROFILES;
    let _ = &*BREAKER_OPEN;
}

/// Render the registry in the Prometheus text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_render() {
        init();
        EVENTS_POLLED.inc();
        EVENTS_DROPPED.with_label_values(&["low"]).inc();
        ANOMALIES_DETECTED.with_label_values(&["high"]).inc();
        let text = render();
        assert!(text.contains("forgewatch_events_polled_total"));
        assert!(text.contains("forgewatch_events_dropped_total"));
    }
}
