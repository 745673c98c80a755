// Metrics
//
// Counters, gauges and histograms for translation and execution health:
// - translations by result
// - executions by outcome, limit breaches by kind
// - degraded controls and forced kills
// - execution latency

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::types::{ExecutionResult, LimitKind};

/// Counter metric (monotonically increasing)
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        // Saturate: a stray dec must not wrap the gauge.
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct HistogramBucket {
    /// Upper bound in seconds.
    pub le: f64,
    pub count: AtomicU64,
}

/// Cumulative-bucket latency histogram
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum: AtomicU64, // microseconds
    count: AtomicU64,
}

impl Histogram {
    /// Buckets sized for interpreter runs: 10 ms to 30 s.
    pub fn new_latency() -> Self {
        let bounds = [0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];
        let buckets = bounds
            .into_iter()
            .map(|le| HistogramBucket {
                le,
                count: AtomicU64::new(0),
            })
            .collect();

        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum
            .fetch_add(value.as_micros().min(u64::MAX as u128) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_micros(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 0.0001)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[derive(Debug, Default)]
pub struct OutcomeCounters {
    pub success: Counter,
    pub runtime_failure: Counter,
    pub limit_exceeded: Counter,
    pub sandbox_violation: Counter,
    pub cancelled: Counter,
    pub internal_error: Counter,
}

#[derive(Debug)]
pub struct MetricsRegistry {
    pub translations_ok: Counter,
    pub translations_failed: Counter,

    pub executions_total: Counter,
    pub outcomes: OutcomeCounters,

    pub breach_wall_time: Counter,
    pub breach_cpu_time: Counter,
    pub breach_memory: Counter,
    pub truncated_outputs: Counter,

    pub degraded_controls: Counter,
    pub forced_kills: Counter,

    pub active_executions: Gauge,
    pub execution_latency: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            translations_ok: Counter::new(),
            translations_failed: Counter::new(),
            executions_total: Counter::new(),
            outcomes: OutcomeCounters::default(),
            breach_wall_time: Counter::new(),
            breach_cpu_time: Counter::new(),
            breach_memory: Counter::new(),
            truncated_outputs: Counter::new(),
            degraded_controls: Counter::new(),
            forced_kills: Counter::new(),
            active_executions: Gauge::new(),
            execution_latency: Histogram::new_latency(),
        }
    }

    pub fn record_translation(&self, ok: bool) {
        if ok {
            self.translations_ok.inc();
        } else {
            self.translations_failed.inc();
        }
    }

    pub fn record_execution(&self, result: &ExecutionResult, latency: Duration) {
        self.executions_total.inc();
        self.execution_latency.observe(latency);

        let counter = match result {
            ExecutionResult::Success { .. } => &self.outcomes.success,
            ExecutionResult::RuntimeFailure { .. } => &self.outcomes.runtime_failure,
            ExecutionResult::LimitExceeded { limit, .. } => {
                match limit {
                    LimitKind::WallTime => self.breach_wall_time.inc(),
                    LimitKind::CpuTime => self.breach_cpu_time.inc(),
                    LimitKind::Memory => self.breach_memory.inc(),
                }
                &self.outcomes.limit_exceeded
            }
            ExecutionResult::SandboxViolation { .. } => &self.outcomes.sandbox_violation,
            ExecutionResult::Cancelled { .. } => &self.outcomes.cancelled,
            ExecutionResult::InternalError { .. } => &self.outcomes.internal_error,
        };
        counter.inc();

        if result.stats().map(|s| s.output_truncated).unwrap_or(false) {
            self.truncated_outputs.inc();
        }
    }

    /// Prometheus text exposition format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP twibox_translations_total Translations by result\n");
        output.push_str("# TYPE twibox_translations_total counter\n");
        output.push_str(&format!(
            "twibox_translations_total{{result=\"ok\"}} {}\n",
            self.translations_ok.get()
        ));
        output.push_str(&format!(
            "twibox_translations_total{{result=\"error\"}} {}\n",
            self.translations_failed.get()
        ));

        output.push_str("# HELP twibox_executions_total Total number of executions\n");
        output.push_str("# TYPE twibox_executions_total counter\n");
        output.push_str(&format!("twibox_executions_total {}\n", self.executions_total.get()));

        output.push_str("# HELP twibox_executions_by_outcome Executions by outcome\n");
        output.push_str("# TYPE twibox_executions_by_outcome counter\n");
        let outcomes = [
            ("success", &self.outcomes.success),
            ("runtime_failure", &self.outcomes.runtime_failure),
            ("limit_exceeded", &self.outcomes.limit_exceeded),
            ("sandbox_violation", &self.outcomes.sandbox_violation),
            ("cancelled", &self.outcomes.cancelled),
            ("internal_error", &self.outcomes.internal_error),
        ];
        for (name, counter) in outcomes {
            output.push_str(&format!(
                "twibox_executions_by_outcome{{outcome=\"{}\"}} {}\n",
                name,
                counter.get()
            ));
        }

        output.push_str("# HELP twibox_limit_breaches_total Limit breaches by kind\n");
        output.push_str("# TYPE twibox_limit_breaches_total counter\n");
        for (name, counter) in [
            ("wall_time", &self.breach_wall_time),
            ("cpu_time", &self.breach_cpu_time),
            ("memory", &self.breach_memory),
        ] {
            output.push_str(&format!(
                "twibox_limit_breaches_total{{limit=\"{}\"}} {}\n",
                name,
                counter.get()
            ));
        }

        output.push_str("# HELP twibox_truncated_outputs_total Runs whose output was truncated\n");
        output.push_str("# TYPE twibox_truncated_outputs_total counter\n");
        output.push_str(&format!(
            "twibox_truncated_outputs_total {}\n",
            self.truncated_outputs.get()
        ));

        output.push_str("# HELP twibox_degraded_controls_total Kernel controls that failed to apply\n");
        output.push_str("# TYPE twibox_degraded_controls_total counter\n");
        output.push_str(&format!(
            "twibox_degraded_controls_total {}\n",
            self.degraded_controls.get()
        ));

        output.push_str("# HELP twibox_forced_kills_total Runs torn down by the watchdog\n");
        output.push_str("# TYPE twibox_forced_kills_total counter\n");
        output.push_str(&format!("twibox_forced_kills_total {}\n", self.forced_kills.get()));

        output.push_str("# HELP twibox_active_executions Currently active executions\n");
        output.push_str("# TYPE twibox_active_executions gauge\n");
        output.push_str(&format!(
            "twibox_active_executions {}\n",
            self.active_executions.get()
        ));

        output.push_str("# HELP twibox_execution_latency_seconds End-to-end execution latency\n");
        output.push_str("# TYPE twibox_execution_latency_seconds histogram\n");
        for bucket in &self.execution_latency.buckets {
            output.push_str(&format!(
                "twibox_execution_latency_seconds_bucket{{le=\"{}\"}} {}\n",
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "twibox_execution_latency_seconds_bucket{{le=\"+Inf\"}} {}\n",
            self.execution_latency.get_count()
        ));
        output.push_str(&format!(
            "twibox_execution_latency_seconds_sum {}\n",
            self.execution_latency.get_sum_micros() as f64 / 1_000_000.0
        ));
        output.push_str(&format!(
            "twibox_execution_latency_seconds_count {}\n",
            self.execution_latency.get_count()
        ));

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

pub fn get_metrics() -> Arc<MetricsRegistry> {
    Arc::clone(&METRICS)
}

pub fn record_translation(ok: bool) {
    METRICS.record_translation(ok);
}
