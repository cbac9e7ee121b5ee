use ahash::AHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

pub const BACKEND_CALLS_TOTAL: &str = "backend_calls_total";
pub const BACKEND_RETRIES_TOTAL: &str = "backend_retries_total";
pub const BACKEND_CALL_DURATION_SECONDS: &str = "backend_call_duration_seconds";
pub const COST_ALERTS_TOTAL: &str = "cost_alerts_total";
pub const ORCHESTRATIONS_TOTAL: &str = "orchestrations_total";

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Cumulative-bucket histogram with an atomically accumulated f64 sum.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_bits: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_bits: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sum_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        for (boundary, slot) in self.buckets.iter().zip(&self.counts) {
            if value <= *boundary {
                slot.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Backend latency buckets in seconds; LLM calls run from sub-second to
/// well past a minute.
fn latency_buckets() -> Vec<f64> {
    vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted key=value pairs distinguishing series of one counter family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
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

    /// `{key="value",...}` or the empty string.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Process-local counters and histograms for orchestration activity.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = self.counters.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record an observation, creating the histogram with latency buckets on
    /// first use.
    pub fn record_histogram(&self, name: &str, value: f64) {
        {
            let map = self.histograms.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(h) = map.get(name) {
                h.observe(value);
                return;
            }
        }
        let mut map = self.histograms.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(name.to_string())
            .or_insert_with(|| Histogram::new(latency_buckets()))
            .observe(value);
    }

    /// `(count, sum)` for a histogram, zeros when it was never observed.
    pub fn histogram_totals(&self, name: &str) -> (u64, f64) {
        self.histograms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|h| (h.count(), h.sum()))
            .unwrap_or((0, 0.0))
    }

    /// Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = self.counters.read().unwrap_or_else(PoisonError::into_inner);
            let mut series: Vec<(&String, &Labels, u64)> = map
                .iter()
                .map(|((name, labels), v)| (name, labels, v.load(Ordering::Relaxed)))
                .collect();
            series.sort_by(|a, b| a.0.cmp(b.0).then_with(|| a.1 .0.cmp(&b.1 .0)));
            let mut last: Option<&String> = None;
            for (name, labels, value) in series {
                if last != Some(name) {
                    out.push_str(&format!("# TYPE {name} counter\n"));
                    last = Some(name);
                }
                out.push_str(&format!("{name}{} {value}\n", labels.prometheus_str()));
            }
        }

        {
            let map = self.histograms.read().unwrap_or_else(PoisonError::into_inner);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let h = &map[name];
                out.push_str(&format!("# TYPE {name} histogram\n"));
                let mut cumulative = 0u64;
                for (boundary, slot) in h.buckets.iter().zip(&h.counts) {
                    cumulative = cumulative.max(slot.load(Ordering::Relaxed));
                    out.push_str(&format!("{name}_bucket{{le=\"{boundary}\"}} {cumulative}\n"));
                }
                out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", h.count()));
                out.push_str(&format!("{name}_sum {}\n", h.sum()));
                out.push_str(&format!("{name}_count {}\n", h.count()));
            }
        }

        out
    }

    pub fn export_json(&self) -> serde_json::Value {
        let mut counters = serde_json::Map::new();
        for ((name, labels), v) in self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            counters.insert(
                format!("{name}{}", labels.prometheus_str()),
                serde_json::json!(v.load(Ordering::Relaxed)),
            );
        }

        let mut histograms = serde_json::Map::new();
        for (name, h) in self
            .histograms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            histograms.insert(
                name.clone(),
                serde_json::json!({ "count": h.count(), "sum": h.sum() }),
            );
        }

        serde_json::json!({ "counters": counters, "histograms": histograms })
    }
}

/// The process-wide collector.
pub fn global_metrics() -> &'static MetricsCollector {
    use std::sync::OnceLock;
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_keyed_by_labels() {
        let m = MetricsCollector::new();
        m.increment_counter(BACKEND_CALLS_TOTAL, &[("backend", "gpt-4o"), ("outcome", "ok")]);
        m.increment_counter(BACKEND_CALLS_TOTAL, &[("outcome", "ok"), ("backend", "gpt-4o")]);
        m.increment_counter(BACKEND_CALLS_TOTAL, &[("backend", "gpt-4o"), ("outcome", "error")]);

        assert_eq!(
            m.get_counter(BACKEND_CALLS_TOTAL, &[("backend", "gpt-4o"), ("outcome", "ok")]),
            2
        );
        assert_eq!(
            m.get_counter(BACKEND_CALLS_TOTAL, &[("backend", "gpt-4o"), ("outcome", "error")]),
            1
        );
        assert_eq!(m.get_counter(BACKEND_CALLS_TOTAL, &[("backend", "other")]), 0);
    }

    #[test]
    fn histogram_accumulates_sum_and_count() {
        let m = MetricsCollector::new();
        m.record_histogram(BACKEND_CALL_DURATION_SECONDS, 0.2);
        m.record_histogram(BACKEND_CALL_DURATION_SECONDS, 1.3);
        let (count, sum) = m.histogram_totals(BACKEND_CALL_DURATION_SECONDS);
        assert_eq!(count, 2);
        assert!((sum - 1.5).abs() < 1e-9);
        assert_eq!(m.histogram_totals("missing"), (0, 0.0));
    }

    #[test]
    fn prometheus_export_contains_series() {
        let m = MetricsCollector::new();
        m.increment_counter(COST_ALERTS_TOTAL, &[("kind", "daily")]);
        m.record_histogram(BACKEND_CALL_DURATION_SECONDS, 0.4);

        let out = m.export_prometheus();
        assert!(out.contains("# TYPE cost_alerts_total counter"));
        assert!(out.contains("cost_alerts_total{kind=\"daily\"} 1"));
        assert!(out.contains("backend_call_duration_seconds_count 1"));
        assert!(out.contains("backend_call_duration_seconds_bucket{le=\"0.5\"} 1"));
    }

    #[test]
    fn json_export_shape() {
        let m = MetricsCollector::new();
        m.increment_counter(ORCHESTRATIONS_TOTAL, &[("strategy", "dual")]);
        let json = m.export_json();
        assert_eq!(json["counters"]["orchestrations_total{strategy=\"dual\"}"], 1);
        assert!(json["histograms"].is_object());
    }

    #[test]
    fn global_metrics_is_a_singleton() {
        assert!(std::ptr::eq(global_metrics(), global_metrics()));
    }
}
