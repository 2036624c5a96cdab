use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0,
    ]
}

/// Installs the global OTLP meter provider. Without it every meter is a
/// no-op, which is what tests run with.
pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    service_version: &str,
) -> Result<()> {
    if !enable_metrics {
        return Ok(());
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "sparkpilot"))
        .with_attribute(KeyValue::new("service.name", "sparkpilot-server"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);
    Ok(())
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the elapsed time into `metric` when dropped.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, &[])
    }

    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub trait AutoIncrement {
    fn increment(&self, labels: &[KeyValue]);
}

impl AutoIncrement for Counter<u64> {
    fn increment(&self, labels: &[KeyValue]) {
        self.add(1, labels);
    }
}

/// Bumps `metric` by one when dropped, so early returns are still counted.
pub struct Increment<'a, T: AutoIncrement + Sync> {
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: AutoIncrement + Sync> Increment<'a, T> {
    pub fn inc(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self { metric, labels }
    }
}

impl<T: AutoIncrement + Sync> Drop for Increment<'_, T> {
    fn drop(&mut self) {
        self.metric.increment(self.labels);
    }
}

#[derive(Clone, Debug)]
pub struct StateStoreMetrics {
    pub state_write: Histogram<f64>,
    pub state_read: Histogram<f64>,
}

impl Default for StateStoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStoreMetrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("state_store");

        let state_write = meter
            .f64_histogram("sparkpilot.state_machine_write_duration")
            .with_unit("s")
            .with_boundaries(low_latency_boundaries())
            .with_description("State machine writing latency in seconds")
            .build();

        let state_read = meter
            .f64_histogram("sparkpilot.state_machine_read_duration")
            .with_unit("s")
            .with_boundaries(low_latency_boundaries())
            .with_description("State machine reading latency in seconds")
            .build();

        Self {
            state_write,
            state_read,
        }
    }
}

pub mod dispatcher {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub admitted: Counter<u64>,
        pub denied: Counter<u64>,
        pub dispatched: Counter<u64>,
        pub failed: Counter<u64>,
        pub pass_duration: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("dispatcher");
            let admitted = meter
                .u64_counter("sparkpilot.dispatcher.admitted")
                .with_description("runs that passed environment admission")
                .build();
            let denied = meter
                .u64_counter("sparkpilot.dispatcher.denied")
                .with_description("admission attempts denied for lack of capacity")
                .build();
            let dispatched = meter
                .u64_counter("sparkpilot.dispatcher.dispatched")
                .with_description("runs acknowledged by the job engine")
                .build();
            let failed = meter
                .u64_counter("sparkpilot.dispatcher.failed")
                .with_description("runs whose submission was rejected or timed out")
                .build();
            let pass_duration = meter
                .f64_histogram("sparkpilot.dispatcher.pass_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("dispatcher pass latency in seconds")
                .build();
            Metrics {
                admitted,
                denied,
                dispatched,
                failed,
                pass_duration,
            }
        }
    }
}

pub mod reconciler {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub observed: Counter<u64>,
        pub transitions: Counter<u64>,
        pub transient_failures: Counter<u64>,
        pub invalid_transitions: Counter<u64>,
        pub timeouts: Counter<u64>,
        pub pass_duration: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("reconciler");
            let observed = meter
                .u64_counter("sparkpilot.reconciler.observed")
                .with_description("engine status observations")
                .build();
            let transitions = meter
                .u64_counter("sparkpilot.reconciler.transitions")
                .with_description("run state transitions applied by the reconciler")
                .build();
            let transient_failures = meter
                .u64_counter("sparkpilot.reconciler.transient_failures")
                .with_description("engine status queries that failed or timed out")
                .build();
            let invalid_transitions = meter
                .u64_counter("sparkpilot.reconciler.invalid_transitions")
                .with_description("observations that mapped to a disallowed transition")
                .build();
            let timeouts = meter
                .u64_counter("sparkpilot.reconciler.timeouts")
                .with_description("runs failed for exceeding their timeout")
                .build();
            let pass_duration = meter
                .f64_histogram("sparkpilot.reconciler.pass_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("reconciler pass latency in seconds")
                .build();
            Metrics {
                observed,
                transitions,
                transient_failures,
                invalid_transitions,
                timeouts,
                pass_duration,
            }
        }
    }
}

pub mod engine {
    use opentelemetry::metrics::Histogram;

    use crate::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub calls: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("job-engine");
            let calls = meter
                .f64_histogram("sparkpilot.engine.call_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("job engine call latencies in seconds")
                .build();
            Metrics { calls }
        }
    }
}

pub mod api {
    use opentelemetry::metrics::Counter;

    #[derive(Debug)]
    pub struct Metrics {
        pub requests: Counter<u64>,
        pub runs_created: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("service-api");
            let requests = meter
                .u64_counter("sparkpilot.api.requests")
                .with_description("number of API requests")
                .build();
            let runs_created = meter
                .u64_counter("sparkpilot.api.runs_created")
                .with_description("number of runs created through the API")
                .build();
            Metrics {
                requests,
                runs_created,
            }
        }
    }
}
