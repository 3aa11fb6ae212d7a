use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ahash::AHashMap;
use serde::Serialize;

/// Requests processed by the AI service, labelled `feature`, `provider`,
/// `outcome`.
pub const AI_REQUESTS_TOTAL: &str = "ai_requests_total";
/// End-to-end latency of AI service calls.
pub const AI_REQUEST_DURATION_SECONDS: &str = "ai_request_duration_seconds";
/// A/B metric events, labelled `test`, `variant`, `metric`.
pub const AB_TEST_METRIC: &str = "ab_test_metric";

// Poisoning is ignored: every stored value is an atomic.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn add_f64(cell: &AtomicU64, value: f64) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let next = (f64::from_bits(current) + value).to_bits();
        match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Label set sorted by key, so `[("a","1"),("b","2")]` and
/// `[("b","2"),("a","1")]` address the same series.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort();
        Self(v)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `{k="v",...}` with Prometheus escaping, or `""` when empty.
    pub fn prometheus_str(&self) -> String {
        self.render(None)
    }

    fn render(&self, extra: Option<(&str, &str)>) -> String {
        let mut parts: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", escape(v)))
            .collect();
        if let Some((k, v)) = extra {
            parts.push(format!("{k}=\"{}\"", escape(v)));
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!("{{{}}}", parts.join(","))
        }
    }
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

type SeriesKey = (String, Labels);

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Upper bounds (seconds) sized for LLM round trips.
pub fn latency_buckets() -> Vec<f64> {
    vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
}

#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    /// Per-bucket (non-cumulative) counts.
    counts: Vec<AtomicU64>,
    sum_bits: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(mut bounds: Vec<f64>) -> Self {
        bounds.retain(|b| b.is_finite());
        bounds.sort_by(f64::total_cmp);
        bounds.dedup();
        let counts = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            sum_bits: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        add_f64(&self.sum_bits, value);
        if let Some(i) = self.bounds.iter().position(|b| value <= *b) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// `(upper_bound, cumulative_count)` pairs, excluding `+Inf`.
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        self.bounds
            .iter()
            .zip(&self.counts)
            .map(|(bound, c)| {
                running += c.load(Ordering::Relaxed);
                (*bound, running)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesValue<T> {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: T,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<(f64, u64)>,
    pub sum: f64,
    pub count: u64,
}

/// Point-in-time copy of every series, sorted by name then labels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<SeriesValue<u64>>,
    pub gauges: Vec<SeriesValue<i64>>,
    pub histograms: Vec<SeriesValue<HistogramSnapshot>>,
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Process-wide metric store. Series are created on first use.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<SeriesKey, AtomicU64>>,
    gauges: RwLock<AHashMap<SeriesKey, AtomicI64>>,
    histograms: RwLock<AHashMap<SeriesKey, Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(c) = read(&self.counters).get(&key) {
            c.fetch_add(amount, Ordering::Relaxed);
            return;
        }
        write(&self.counters)
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.counters)
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum of a counter across all label sets.
    pub fn counter_total(&self, name: &str) -> u64 {
        read(&self.counters)
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, c)| c.load(Ordering::Relaxed))
            .sum()
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(g) = read(&self.gauges).get(&key) {
            g.store(value, Ordering::Relaxed);
            return;
        }
        write(&self.gauges)
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.gauges)
            .get(&key)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Histograms ---------------------------------------------------------

    /// Observe `value`. New series use [`latency_buckets`].
    pub fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = (name.to_string(), Labels::new(labels));
        if let Some(h) = read(&self.histograms).get(&key) {
            h.observe(value);
            return;
        }
        write(&self.histograms)
            .entry(key)
            .or_insert_with(|| Histogram::new(latency_buckets()))
            .observe(value);
    }

    pub fn histogram_count(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.histograms)
            .get(&key)
            .map(Histogram::count)
            .unwrap_or(0)
    }

    // -- Export -------------------------------------------------------------

    pub fn snapshot(&self) -> MetricsSnapshot {
        fn series<V, T>(
            map: &AHashMap<SeriesKey, V>,
            f: impl Fn(&V) -> T,
        ) -> Vec<SeriesValue<T>> {
            let mut keys: Vec<&SeriesKey> = map.keys().collect();
            keys.sort();
            keys.into_iter()
                .filter_map(|key| {
                    map.get(key).map(|v| SeriesValue {
                        name: key.0.clone(),
                        labels: key.1 .0.clone(),
                        value: f(v),
                    })
                })
                .collect()
        }

        MetricsSnapshot {
            counters: series(&read(&self.counters), |c| c.load(Ordering::Relaxed)),
            gauges: series(&read(&self.gauges), |g| g.load(Ordering::Relaxed)),
            histograms: series(&read(&self.histograms), |h| HistogramSnapshot {
                buckets: h.cumulative(),
                sum: h.sum(),
                count: h.count(),
            }),
        }
    }

    /// Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();
        let mut last_type: Option<String> = None;
        let mut header = |out: &mut String, name: &str, kind: &str| {
            if last_type.as_deref() != Some(name) {
                out.push_str(&format!("# TYPE {name} {kind}\n"));
                last_type = Some(name.to_string());
            }
        };

        for s in &snapshot.counters {
            header(&mut out, &s.name, "counter");
            let labels = Labels(s.labels.clone());
            out.push_str(&format!("{}{} {}\n", s.name, labels.prometheus_str(), s.value));
        }
        for s in &snapshot.gauges {
            header(&mut out, &s.name, "gauge");
            let labels = Labels(s.labels.clone());
            out.push_str(&format!("{}{} {}\n", s.name, labels.prometheus_str(), s.value));
        }
        for s in &snapshot.histograms {
            header(&mut out, &s.name, "histogram");
            let labels = Labels(s.labels.clone());
            for (bound, count) in &s.value.buckets {
                let le = bound.to_string();
                out.push_str(&format!(
                    "{}_bucket{} {count}\n",
                    s.name,
                    labels.render(Some(("le", &le)))
                ));
            }
            out.push_str(&format!(
                "{}_bucket{} {}\n",
                s.name,
                labels.render(Some(("le", "+Inf"))),
                s.value.count
            ));
            let plain = labels.prometheus_str();
            out.push_str(&format!("{}_sum{plain} {}\n", s.name, s.value.sum));
            out.push_str(&format!("{}_count{plain} {}\n", s.name, s.value.count));
        }
        out
    }

    pub fn export_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Null)
    }
}

/// Shared registry used when callers do not inject their own.
pub fn global_metrics() -> &'static MetricsCollector {
    static GLOBAL: OnceLock<MetricsCollector> = OnceLock::new();
    GLOBAL.get_or_init(MetricsCollector::new)
}
