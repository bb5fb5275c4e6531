//! Counter registry behind the `/metrics` endpoint.
//!
//! Counters are registered and incremented by name so handlers stay decoupled
//! from metric handles; typed `prometheus-client` objects live behind the map
//! and do the actual counting and exposition. Construction also registers the
//! default process gauges every scrape is expected to carry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::warn;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

const PROCESS_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Misuse of the registry. These are programmer errors: callers log them or
/// let them abort startup, nothing retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MetricsError {
    DuplicateMetricName(String),
    UnknownMetric(String),
    LabelMismatch {
        metric: String,
        expected: Vec<String>,
        supplied: Vec<String>,
    },
}

impl std::fmt::Display for MetricsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricsError::DuplicateMetricName(name) => write!(f, "metric {name} is already registered"),
            MetricsError::UnknownMetric(name) => write!(f, "metric {name} is not a registered counter"),
            MetricsError::LabelMismatch { metric, expected, supplied } => {
                write!(f, "labels for {metric} must be exactly {expected:?}, got {supplied:?}")
            }
        }
    }
}

impl std::error::Error for MetricsError {}

/// Label values keyed by label name, ordered like the declaration.
type LabelValues = Vec<(String, String)>;

enum CounterKind {
    Plain(Counter),
    Labeled {
        label_names: Vec<String>,
        family: Family<LabelValues, Counter>,
    },
}

/// Name-keyed counter registry plus the default process gauges.
///
/// Registration happens once at startup and needs `&mut self`; after that the
/// registry is shared behind an `Arc` and increments go through `&self`
/// (counters are atomic, series creation is synchronized by `Family`).
pub(crate) struct MetricsRegistry {
    registry: Registry,
    names: HashSet<String>,
    counters: HashMap<String, CounterKind>,
    process: ProcessMetrics,
}

impl MetricsRegistry {
    pub(crate) fn new() -> Self {
        let mut registry = Registry::default();
        let mut names = HashSet::new();
        let process = ProcessMetrics::register(&mut registry, &mut names);
        Self {
            registry,
            names,
            counters: HashMap::new(),
            process,
        }
    }

    /// Registers a counter. With `label_names` the counter becomes a family
    /// of independent series, created lazily on first increment.
    pub(crate) fn register_counter(&mut self, name: &str, help: &str, label_names: &[&str]) -> Result<(), MetricsError> {
        if self.names.contains(name) {
            return Err(MetricsError::DuplicateMetricName(name.to_string()));
        }
        let kind = if label_names.is_empty() {
            let counter = Counter::default();
            self.registry.register(name, help, counter.clone());
            CounterKind::Plain(counter)
        } else {
            let family = Family::<LabelValues, Counter>::default();
            self.registry.register(name, help, family.clone());
            CounterKind::Labeled {
                label_names: label_names.iter().map(|s| s.to_string()).collect(),
                family,
            }
        };
        self.names.insert(name.to_string());
        self.counters.insert(name.to_string(), kind);
        Ok(())
    }

    /// Adds 1 to a counter. `label_values` must carry exactly the declared
    /// label names, in any order.
    pub(crate) fn increment(&self, name: &str, label_values: &[(&str, &str)]) -> Result<(), MetricsError> {
        self.increment_by(name, label_values, 1)
    }

    /// Adds a positive `amount` to a counter, creating the label series on
    /// first use.
    pub(crate) fn increment_by(&self, name: &str, label_values: &[(&str, &str)], amount: u64) -> Result<(), MetricsError> {
        let counter = self
            .counters
            .get(name)
            .ok_or_else(|| MetricsError::UnknownMetric(name.to_string()))?;
        match counter {
            CounterKind::Plain(counter) => {
                if !label_values.is_empty() {
                    return Err(label_mismatch(name, &[], label_values));
                }
                counter.inc_by(amount);
            }
            CounterKind::Labeled { label_names, family } => {
                let series = canonical_labels(name, label_names, label_values)?;
                family.get_or_create(&series).inc_by(amount);
            }
        }
        Ok(())
    }

    /// Renders every registered metric in registration order, in the
    /// OpenMetrics text exposition format. Computed fresh on every call.
    pub(crate) fn serialize(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }

    /// Spawns the task keeping the process gauges current. Called once by the
    /// binary; tests skip it so scrapes stay deterministic.
    pub(crate) fn start_process_tracking(&self) {
        let process = self.process.clone();
        tokio::spawn(async move {
            process.run_refresh_loop().await;
        });
    }
}

/// Reorders `supplied` values into declared order, rejecting any key set that
/// is not exactly the declared one.
fn canonical_labels(metric: &str, declared: &[String], supplied: &[(&str, &str)]) -> Result<LabelValues, MetricsError> {
    if supplied.len() != declared.len() {
        return Err(label_mismatch(metric, declared, supplied));
    }
    let mut series = Vec::with_capacity(declared.len());
    for name in declared {
        match supplied.iter().find(|(key, _)| key == name) {
            Some((_, value)) => series.push((name.clone(), (*value).to_string())),
            None => return Err(label_mismatch(metric, declared, supplied)),
        }
    }
    Ok(series)
}

fn label_mismatch(metric: &str, declared: &[String], supplied: &[(&str, &str)]) -> MetricsError {
    MetricsError::LabelMismatch {
        metric: metric.to_string(),
        expected: declared.to_vec(),
        supplied: supplied.iter().map(|(key, _)| key.to_string()).collect(),
    }
}

/// Default process gauges, the counterpart of what metrics libraries register
/// for free. Memory is snapshotted at construction so the first scrape is
/// already populated; the refresh loop keeps everything current afterwards.
#[derive(Clone)]
struct ProcessMetrics {
    resident_memory_bytes: Gauge,
    virtual_memory_bytes: Gauge,
    uptime_seconds: Gauge,
    cpu_usage_percent: Gauge<f64, AtomicU64>,
    started: Instant,
}

impl ProcessMetrics {
    fn register(registry: &mut Registry, names: &mut HashSet<String>) -> Self {
        fn gauge(registry: &mut Registry, names: &mut HashSet<String>, name: &str, help: &str) -> Gauge {
            let gauge = Gauge::default();
            registry.register(name, help, gauge.clone());
            names.insert(name.to_string());
            gauge
        }

        let resident_memory_bytes = gauge(registry, names, "process_resident_memory_bytes", "Resident set size in bytes");
        let virtual_memory_bytes = gauge(registry, names, "process_virtual_memory_bytes", "Virtual memory size in bytes");
        let start_time_seconds = gauge(registry, names, "process_start_time_seconds", "Start time of the process since unix epoch in seconds");
        let uptime_seconds = gauge(registry, names, "process_uptime_seconds", "Seconds since the process started");

        let cpu_usage_percent = Gauge::<f64, AtomicU64>::default();
        registry.register("process_cpu_usage_percent", "Process cpu usage in percent", cpu_usage_percent.clone());
        names.insert("process_cpu_usage_percent".to_string());

        let epoch_seconds = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        start_time_seconds.set(epoch_seconds as i64);

        let process = Self {
            resident_memory_bytes,
            virtual_memory_bytes,
            uptime_seconds,
            cpu_usage_percent,
            started: Instant::now(),
        };
        process.refresh_memory();
        process
    }

    fn refresh_memory(&self) {
        if let Some(usage) = memory_stats::memory_stats() {
            self.resident_memory_bytes.set(usage.physical_mem as i64);
            self.virtual_memory_bytes.set(usage.virtual_mem as i64);
        } else {
            warn!("failed to read process memory stats");
        }
    }

    async fn run_refresh_loop(self) {
        use sysinfo::{ProcessRefreshKind, RefreshKind, System};
        let mut sys = System::new_with_specifics(RefreshKind::new().with_processes(ProcessRefreshKind::new().with_cpu()));
        let pid = sysinfo::Pid::from_u32(std::process::id());
        let mut interval = tokio::time::interval(PROCESS_REFRESH_INTERVAL);
        loop {
            interval.tick().await;
            self.uptime_seconds.set(self.started.elapsed().as_secs() as i64);
            self.refresh_memory();
            sys.refresh_processes_specifics(ProcessRefreshKind::new().with_cpu());
            match sys.process(pid) {
                Some(process) => {
                    self.cpu_usage_percent.set(process.cpu_usage() as f64);
                }
                None => warn!("failed to read process cpu usage"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_line<'a>(text: &'a str, name: &str) -> Option<&'a str> {
        text.lines().find(|line| line.starts_with(name))
    }

    #[test]
    fn plain_counter_counts() {
        let mut metrics = MetricsRegistry::new();
        metrics.register_counter("api_hits", "Number of hits to the API", &[]).unwrap();
        metrics.increment("api_hits", &[]).unwrap();
        metrics.increment_by("api_hits", &[], 2).unwrap();
        let text = metrics.serialize().unwrap();
        assert!(text.contains("# HELP api_hits Number of hits to the API"));
        assert!(text.contains("# TYPE api_hits counter\n"));
        assert_eq!(sample_line(&text, "api_hits_total"), Some("api_hits_total 3"));
    }

    #[test]
    fn duplicate_registration_fails_and_keeps_the_original() {
        let mut metrics = MetricsRegistry::new();
        metrics.register_counter("api_hits", "Number of hits to the API", &[]).unwrap();
        metrics.increment("api_hits", &[]).unwrap();

        let err = metrics.register_counter("api_hits", "shadow", &[]).unwrap_err();
        assert_eq!(err, MetricsError::DuplicateMetricName("api_hits".to_string()));

        // default process metric names are reserved too
        let err = metrics.register_counter("process_uptime_seconds", "shadow", &[]).unwrap_err();
        assert_eq!(err, MetricsError::DuplicateMetricName("process_uptime_seconds".to_string()));

        metrics.increment("api_hits", &[]).unwrap();
        let text = metrics.serialize().unwrap();
        assert_eq!(sample_line(&text, "api_hits_total"), Some("api_hits_total 2"));
        assert!(!text.contains("shadow"));
    }

    #[test]
    fn incrementing_an_unregistered_name_fails() {
        let metrics = MetricsRegistry::new();
        let err = metrics.increment("api_hits", &[]).unwrap_err();
        assert_eq!(err, MetricsError::UnknownMetric("api_hits".to_string()));
    }

    #[test]
    fn label_keys_must_match_the_declaration_exactly() {
        let mut metrics = MetricsRegistry::new();
        metrics.register_counter("api_hits", "Number of hits to the API", &[]).unwrap();
        metrics
            .register_counter("http_requests", "Number of HTTP requests", &["route", "method", "status"])
            .unwrap();

        let cases: &[&[(&str, &str)]] = &[
            // missing keys
            &[("route", "/fast")],
            &[],
            // renamed key
            &[("route", "/fast"), ("method", "GET"), ("verb", "GET")],
            // extra key
            &[("route", "/fast"), ("method", "GET"), ("status", "200"), ("host", "a")],
            // duplicate key standing in for a missing one
            &[("route", "/fast"), ("route", "/slow"), ("method", "GET")],
        ];
        for labels in cases {
            assert!(
                matches!(metrics.increment("http_requests", labels), Err(MetricsError::LabelMismatch { .. })),
                "labels {labels:?} should be rejected"
            );
        }
        // labels against an unlabeled counter
        assert!(matches!(
            metrics.increment("api_hits", &[("route", "/fast")]),
            Err(MetricsError::LabelMismatch { .. })
        ));

        // nothing above may have created a series
        let text = metrics.serialize().unwrap();
        assert!(!text.contains("http_requests_total{"));
    }

    #[test]
    fn label_series_are_lazy_and_canonically_ordered() {
        let mut metrics = MetricsRegistry::new();
        metrics
            .register_counter("http_requests", "Number of HTTP requests", &["route", "method", "status"])
            .unwrap();

        // declared but untouched: block header only, no samples yet
        let text = metrics.serialize().unwrap();
        assert!(text.contains("# TYPE http_requests counter\n"));
        assert!(!text.contains("http_requests_total{"));

        // supplied out of declared order; the sample renders in declared order
        metrics
            .increment("http_requests", &[("status", "200"), ("route", "/fast"), ("method", "GET")])
            .unwrap();
        metrics.increment("http_requests", &[("route", "/slow"), ("method", "GET"), ("status", "200")]).unwrap();
        metrics.increment("http_requests", &[("method", "GET"), ("route", "/slow"), ("status", "200")]).unwrap();

        let text = metrics.serialize().unwrap();
        assert!(text.contains("http_requests_total{route=\"/fast\",method=\"GET\",status=\"200\"} 1"));
        assert!(text.contains("http_requests_total{route=\"/slow\",method=\"GET\",status=\"200\"} 2"));
    }

    #[test]
    fn blocks_keep_registration_order() {
        let mut metrics = MetricsRegistry::new();
        metrics.register_counter("requests_started", "Requests started", &[]).unwrap();
        metrics.register_counter("requests_finished", "Requests finished", &[]).unwrap();
        let text = metrics.serialize().unwrap();
        let process = text.find("# TYPE process_resident_memory_bytes gauge").unwrap();
        let started = text.find("# TYPE requests_started counter").unwrap();
        let finished = text.find("# TYPE requests_finished counter").unwrap();
        assert!(process < started && started < finished);
    }

    #[test]
    fn serialization_is_idempotent_without_traffic() {
        let mut metrics = MetricsRegistry::new();
        metrics.register_counter("api_hits", "Number of hits to the API", &[]).unwrap();
        metrics.increment("api_hits", &[]).unwrap();
        assert_eq!(metrics.serialize().unwrap(), metrics.serialize().unwrap());
    }

    #[test]
    fn process_gauges_are_present_from_the_first_scrape() {
        let metrics = MetricsRegistry::new();
        let text = metrics.serialize().unwrap();
        for name in [
            "process_resident_memory_bytes",
            "process_virtual_memory_bytes",
            "process_start_time_seconds",
            "process_uptime_seconds",
            "process_cpu_usage_percent",
        ] {
            assert!(text.contains(&format!("# TYPE {name} gauge")), "{name} missing");
        }
        assert!(text.ends_with("# EOF\n"));
    }
}
