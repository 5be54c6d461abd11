/// Metrics for the manifest pipeline
///
/// Tracks:
/// - Signing attempts, outcomes per strategy and failures per stage
/// - Verification outcomes per trust level
/// - Trust-list cache hits, remote lookups and remote failures
/// - Latency for signing and verification
///
/// Exports metrics in Prometheus exposition format.
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Labeled counter, e.g. outcomes by strategy
#[derive(Debug, Default)]
pub struct LabeledCounter<L: Hash + Eq> {
    counts: RwLock<HashMap<L, u64>>,
}

impl<L: Hash + Eq + Clone> LabeledCounter<L> {
    /// Create a new labeled counter
    pub fn new() -> Self {
        Self {
            counts: RwLock::new(HashMap::new()),
        }
    }

    /// Increment counter for a label
    pub fn increment(&self, label: L) {
        let mut counts = self.counts.write().unwrap_or_else(|e| e.into_inner());
        *counts.entry(label).or_insert(0) += 1;
    }

    /// Get current count for a label
    pub fn get(&self, label: &L) -> u64 {
        self.counts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(label)
            .copied()
            .unwrap_or(0)
    }

    /// Get all counts
    pub fn all(&self) -> HashMap<L, u64> {
        self.counts.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Get total across all labels
    pub fn total(&self) -> u64 {
        self.counts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .sum()
    }
}

/// Simple histogram for latency tracking
#[derive(Debug)]
pub struct Histogram {
    /// Bucket boundaries (upper limits in milliseconds)
    boundaries: Vec<u64>,
    /// Count per bucket (includes +Inf bucket)
    buckets: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given bucket boundaries
    pub fn new(boundaries: Vec<u64>) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();

        Self {
            boundaries,
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Default latency buckets (milliseconds)
    pub fn latency_default() -> Self {
        Self::new(vec![5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000])
    }

    /// Record a value
    pub fn record(&self, value_ms: u64) {
        self.sum.fetch_add(value_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let index = self
            .boundaries
            .iter()
            .position(|&boundary| value_ms <= boundary)
            .unwrap_or(self.boundaries.len());
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a duration
    pub fn record_duration(&self, duration: Duration) {
        self.record(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
    }

    /// Bucket counts with boundaries; the last entry is `+Inf` (`u64::MAX`)
    pub fn snapshot(&self) -> Vec<(u64, u64)> {
        self.boundaries
            .iter()
            .copied()
            .chain(std::iter::once(u64::MAX))
            .zip(self.buckets.iter().map(|b| b.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }
}

/// Metrics for signing and verification
#[derive(Debug)]
pub struct PipelineMetrics {
    pub signing_attempts: AtomicU64,
    /// Successful signings by strategy (`embedded`, `sidecar`)
    pub signing_success: LabeledCounter<&'static str>,
    /// Failed attempts by stage (`hash`, `sign`, `embed`, `sidecar`, ...)
    pub signing_failures: LabeledCounter<&'static str>,
    pub signing_duration: Histogram,

    pub verification_attempts: AtomicU64,
    /// Verification outcomes by trust level
    pub verification_results: LabeledCounter<&'static str>,
    pub verification_duration: Histogram,

    pub trust_cache_hits: AtomicU64,
    pub trust_remote_lookups: AtomicU64,
    pub trust_remote_failures: AtomicU64,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            signing_attempts: AtomicU64::new(0),
            signing_success: LabeledCounter::new(),
            signing_failures: LabeledCounter::new(),
            signing_duration: Histogram::latency_default(),

            verification_attempts: AtomicU64::new(0),
            verification_results: LabeledCounter::new(),
            verification_duration: Histogram::latency_default(),

            trust_cache_hits: AtomicU64::new(0),
            trust_remote_lookups: AtomicU64::new(0),
            trust_remote_failures: AtomicU64::new(0),
        }
    }

    /// Record a signing attempt start
    pub fn start_signing(&self) -> OperationTimer {
        self.signing_attempts.fetch_add(1, Ordering::Relaxed);
        OperationTimer::start()
    }

    /// Record a successful signing
    pub fn record_signing_success(&self, strategy: &'static str, timer: OperationTimer) {
        self.signing_success.increment(strategy);
        self.signing_duration.record_duration(timer.elapsed());
    }

    /// Record a failed stage
    pub fn record_signing_failure(&self, stage: &'static str) {
        self.signing_failures.increment(stage);
    }

    /// Record a verification start
    pub fn start_verification(&self) -> OperationTimer {
        self.verification_attempts.fetch_add(1, Ordering::Relaxed);
        OperationTimer::start()
    }

    /// Record a verification verdict
    pub fn record_verification(&self, trust_level: &'static str, timer: OperationTimer) {
        self.verification_results.increment(trust_level);
        self.verification_duration.record_duration(timer.elapsed());
    }

    pub fn record_trust_cache_hit(&self) {
        self.trust_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trust_remote_lookup(&self, succeeded: bool) {
        self.trust_remote_lookups.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.trust_remote_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Export metrics in Prometheus exposition format
    pub fn export_prometheus(&self, prefix: &str) -> String {
        let mut output = String::new();

        write_counter(
            &mut output,
            prefix,
            "signing_attempts_total",
            self.signing_attempts.load(Ordering::Relaxed),
        );
        write_labeled(&mut output, prefix, "signing_success_total", "strategy", &self.signing_success);
        write_labeled(&mut output, prefix, "signing_failures_total", "stage", &self.signing_failures);
        write_histogram(&mut output, prefix, "signing_duration_ms", &self.signing_duration);

        write_counter(
            &mut output,
            prefix,
            "verification_attempts_total",
            self.verification_attempts.load(Ordering::Relaxed),
        );
        write_labeled(
            &mut output,
            prefix,
            "verification_results_total",
            "trust_level",
            &self.verification_results,
        );
        write_histogram(&mut output, prefix, "verification_duration_ms", &self.verification_duration);

        write_counter(
            &mut output,
            prefix,
            "trust_cache_hits_total",
            self.trust_cache_hits.load(Ordering::Relaxed),
        );
        write_counter(
            &mut output,
            prefix,
            "trust_remote_lookups_total",
            self.trust_remote_lookups.load(Ordering::Relaxed),
        );
        write_counter(
            &mut output,
            prefix,
            "trust_remote_failures_total",
            self.trust_remote_failures.load(Ordering::Relaxed),
        );

        output
    }
}

fn write_counter(output: &mut String, prefix: &str, name: &str, value: u64) {
    output.push_str(&format!(
        "# TYPE {prefix}{name} counter\n{prefix}{name} {value}\n\n"
    ));
}

fn write_labeled<L: Hash + Eq + Clone + Display + Ord>(
    output: &mut String,
    prefix: &str,
    name: &str,
    label: &str,
    counter: &LabeledCounter<L>,
) {
    output.push_str(&format!("# TYPE {prefix}{name} counter\n"));
    let sorted: BTreeMap<L, u64> = counter.all().into_iter().collect();
    for (value, count) in sorted {
        output.push_str(&format!("{prefix}{name}{{{label}=\"{value}\"}} {count}\n"));
    }
    output.push('\n');
}

fn write_histogram(output: &mut String, prefix: &str, name: &str, histogram: &Histogram) {
    output.push_str(&format!("# TYPE {prefix}{name} histogram\n"));
    let mut cumulative = 0u64;
    for (boundary, count) in histogram.snapshot() {
        cumulative += count;
        let le = if boundary == u64::MAX {
            "+Inf".to_string()
        } else {
            boundary.to_string()
        };
        output.push_str(&format!("{prefix}{name}_bucket{{le=\"{le}\"}} {cumulative}\n"));
    }
    output.push_str(&format!("{prefix}{name}_sum {}\n", histogram.sum()));
    output.push_str(&format!("{prefix}{name}_count {}\n\n", histogram.count()));
}

/// Timer for measuring operation duration
pub struct OperationTimer {
    start: Instant,
}

impl OperationTimer {
    fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

static GLOBAL_METRICS: std::sync::OnceLock<Arc<PipelineMetrics>> = std::sync::OnceLock::new();

/// Get or create the global metrics instance
pub fn global_metrics() -> Arc<PipelineMetrics> {
    GLOBAL_METRICS
        .get_or_init(|| Arc::new(PipelineMetrics::new()))
        .clone()
}
