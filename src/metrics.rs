use std::sync::Arc;
use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

/// Gateway metrics, rendered in Prometheus text format at `GET /metrics`.
#[derive(Clone, Debug)]
pub struct GatewayMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    requests: IntCounterVec,
    request_latency: HistogramVec,
    executor_calls: IntCounterVec,
    executor_latency: HistogramVec,
    in_flight: IntGauge,
    prefetch_wait: Histogram,
    active_streams: IntGauge,
    illegal_transitions: IntCounter,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn record_request(&self, endpoint: &str, status: &str, elapsed: Duration) {
        self.inner
            .requests
            .with_label_values(&[endpoint, status])
            .inc();
        self.inner
            .request_latency
            .with_label_values(&[endpoint])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_executor_call(&self, executor: &str, status: &str, elapsed: Duration) {
        self.inner
            .executor_calls
            .with_label_values(&[executor, status])
            .inc();
        self.inner
            .executor_latency
            .with_label_values(&[executor])
            .observe(elapsed.as_secs_f64());
    }

    pub fn in_flight_inc(&self) {
        self.inner.in_flight.inc();
    }

    pub fn in_flight_dec(&self) {
        self.inner.in_flight.dec();
    }

    pub fn in_flight(&self) -> i64 {
        self.inner.in_flight.get()
    }

    pub fn observe_prefetch_wait(&self, waited: Duration) {
        self.inner.prefetch_wait.observe(waited.as_secs_f64());
    }

    pub fn stream_opened(&self) {
        self.inner.active_streams.inc();
    }

    pub fn stream_closed(&self) {
        self.inner.active_streams.dec();
    }

    pub fn active_streams(&self) -> i64 {
        self.inner.active_streams.get()
    }

    pub fn illegal_transition(&self) {
        self.inner.illegal_transitions.inc();
    }

    pub fn illegal_transitions(&self) -> u64 {
        self.inner.illegal_transitions.get()
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let requests = counter_vec(
            &registry,
            "requests_total",
            "Requests answered by the gateway",
            &["endpoint", "status"],
        );
        let request_latency = histogram_vec(
            &registry,
            "request_latency_seconds",
            "Time from ingress to egress of a request",
            &["endpoint"],
        );
        let executor_calls = counter_vec(
            &registry,
            "executor_calls_total",
            "Calls made to executors",
            &["executor", "status"],
        );
        let executor_latency = histogram_vec(
            &registry,
            "executor_latency_seconds",
            "Executor call latency, retries included",
            &["executor"],
        );
        let in_flight = gauge(&registry, "in_flight", "Requests currently in flight");
        let prefetch_wait = histogram(
            &registry,
            "prefetch_wait_seconds",
            "Time a stream waited on its prefetch limit",
        );
        let active_streams = gauge(&registry, "active_streams", "Open client streams");
        let illegal_transitions = counter(
            &registry,
            "illegal_transitions_total",
            "Request state transitions that were dropped",
        );

        Self {
            registry,
            requests,
            request_latency,
            executor_calls,
            executor_latency,
            in_flight,
            prefetch_wait,
            active_streams,
            illegal_transitions,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("counter");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let g = IntGauge::with_opts(Opts::new(name, help)).expect("gauge");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

fn histogram(registry: &Registry, name: &str, help: &str) -> Histogram {
    let h = Histogram::with_opts(HistogramOpts::new(name, help)).expect("histogram");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}
