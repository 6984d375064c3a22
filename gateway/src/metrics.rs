use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_messages_total",
        "Total telemetry messages received from MQTT"
    ))
    .unwrap();
    pub static ref VALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_valid_messages_total",
        "Total telemetry messages accepted after validation"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_invalid_messages_total",
        "Total malformed telemetry messages dropped"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_db_failures_total",
        "Total failed device/sample upserts"
    ))
    .unwrap();
    pub static ref PERSIST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "gateway_persist_latency_seconds",
            "Time taken to upsert a device and append its sample"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref BROADCAST_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_broadcast_failures_total",
        "Total failed sends to realtime subscribers"
    ))
    .unwrap();
    pub static ref SUBSCRIBERS: Gauge = Gauge::with_opts(Opts::new(
        "gateway_subscribers",
        "Currently admitted realtime subscribers"
    ))
    .unwrap();
    pub static ref COMMANDS_PUBLISHED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_commands_published_total",
        "Total commands published to devices"
    ))
    .unwrap();
    pub static ref COMMANDS_FAILED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_commands_failed_total",
        "Total commands rejected or failed at the broker"
    ))
    .unwrap();
    pub static ref MQTT_RECONNECTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_mqtt_reconnects_total",
        "Total broker transport errors followed by a reconnect attempt"
    ))
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_channel_full_total",
        "Total number of times the persistence channel was full"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(VALID_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INVALID_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DB_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PERSIST_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(BROADCAST_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(SUBSCRIBERS.clone())).unwrap();
    REGISTRY
        .register(Box::new(COMMANDS_PUBLISHED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(COMMANDS_FAILED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(MQTT_RECONNECTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CHANNEL_FULL_TOTAL.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
