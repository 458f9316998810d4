//! Cumulative, process-lifetime counters backing `/metrics`.
//!
//! Unlike [`crate::traffic::TrafficLog`] (a bounded recent-activity window),
//! these counters never reset and never evict — they exist purely to be
//! rendered as Prometheus text by `api::metrics`, mirroring the original
//! gateway's module-level `Counter`/`Histogram` objects.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Histogram bucket upper bounds, in seconds — a reasonable spread for a
/// proxy whose calls range from sub-second to multi-minute generations.
pub const DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

#[derive(Default)]
struct Histogram {
    bucket_counts: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            bucket_counts: DURATION_BUCKETS.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, seconds: f64) {
        for (bound, counter) in DURATION_BUCKETS.iter().zip(&self.bucket_counts) {
            if seconds <= *bound {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Key identifying one `gateway_requests_total` / `gateway_request_duration_seconds`
/// series. `status` is the raw upstream status code as a string, or the
/// literal `"timeout"` / `"error"` for the two exception paths — matching
/// the original's label semantics exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestLabels {
    pub method: String,
    pub endpoint: String,
    pub node: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CountedRequest {
    method: String,
    endpoint: String,
    node: String,
    status: String,
}

#[derive(Default)]
pub struct Metrics {
    requests_total: DashMap<CountedRequest, AtomicU64>,
    durations: DashMap<RequestLabels, Histogram>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, labels: &RequestLabels, status: &str) {
        let key = CountedRequest {
            method: labels.method.clone(),
            endpoint: labels.endpoint.clone(),
            node: labels.node.clone(),
            status: status.to_string(),
        };
        self.requests_total
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, labels: &RequestLabels, seconds: f64) {
        self.durations
            .entry(labels.clone())
            .or_insert_with(Histogram::new)
            .observe(seconds);
    }

    /// Renders the `gateway_requests_total` and `gateway_request_duration_seconds`
    /// families as Prometheus text exposition lines.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP gateway_requests_total Total number of requests processed\n");
        out.push_str("# TYPE gateway_requests_total counter\n");
        for entry in self.requests_total.iter() {
            let key = entry.key();
            let count = entry.value().load(Ordering::Relaxed);
            out.push_str(&format!(
                "gateway_requests_total{{method=\"{}\",endpoint=\"{}\",node=\"{}\",status=\"{}\"}} {count}\n",
                escape(&key.method),
                escape(&key.endpoint),
                escape(&key.node),
                escape(&key.status),
            ));
        }

        out.push_str("# HELP gateway_request_duration_seconds Request duration in seconds\n");
        out.push_str("# TYPE gateway_request_duration_seconds histogram\n");
        for entry in self.durations.iter() {
            let labels = entry.key();
            let hist = entry.value();
            let mut cumulative = 0u64;
            for (bound, counter) in DURATION_BUCKETS.iter().zip(&hist.bucket_counts) {
                cumulative = cumulative.max(counter.load(Ordering::Relaxed));
                out.push_str(&format!(
                    "gateway_request_duration_seconds_bucket{{method=\"{}\",endpoint=\"{}\",node=\"{}\",le=\"{bound}\"}} {cumulative}\n",
                    escape(&labels.method),
                    escape(&labels.endpoint),
                    escape(&labels.node),
                ));
            }
            let count = hist.count.load(Ordering::Relaxed);
            out.push_str(&format!(
                "gateway_request_duration_seconds_bucket{{method=\"{}\",endpoint=\"{}\",node=\"{}\",le=\"+Inf\"}} {count}\n",
                escape(&labels.method),
                escape(&labels.endpoint),
                escape(&labels.node),
            ));
            let sum_seconds = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!(
                "gateway_request_duration_seconds_sum{{method=\"{}\",endpoint=\"{}\",node=\"{}\"}} {sum_seconds}\n",
                escape(&labels.method),
                escape(&labels.endpoint),
                escape(&labels.node),
            ));
            out.push_str(&format!(
                "gateway_request_duration_seconds_count{{method=\"{}\",endpoint=\"{}\",node=\"{}\"}} {count}\n",
                escape(&labels.method),
                escape(&labels.endpoint),
                escape(&labels.node),
            ));
        }

        out
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counter_line_for_recorded_request() {
        let metrics = Metrics::new();
        let labels = RequestLabels {
            method: "POST".into(),
            endpoint: "/api/chat".into(),
            node: "gpu-1".into(),
        };
        metrics.record_request(&labels, "200");
        let text = metrics.render();
        assert!(text.contains("gateway_requests_total"));
        assert!(text.contains("status=\"200\""));
        assert!(text.contains("node=\"gpu-1\""));
    }

    #[test]
    fn distinct_status_values_get_separate_series() {
        let metrics = Metrics::new();
        let labels = RequestLabels {
            method: "POST".into(),
            endpoint: "/api/chat".into(),
            node: "gpu-1".into(),
        };
        metrics.record_request(&labels, "timeout");
        metrics.record_request(&labels, "error");
        let text = metrics.render();
        assert!(text.contains("status=\"timeout\""));
        assert!(text.contains("status=\"error\""));
    }

    #[test]
    fn histogram_bucket_is_cumulative() {
        let metrics = Metrics::new();
        let labels = RequestLabels {
            method: "POST".into(),
            endpoint: "/api/chat".into(),
            node: "gpu-1".into(),
        };
        metrics.observe_duration(&labels, 0.05);
        metrics.observe_duration(&labels, 4.0);
        let text = metrics.render();
        assert!(text.contains("le=\"+Inf\"} 2"));
    }
}
