//! Metric declarations for the contour engine.
//!
//! Metrics go through the `metrics` facade; without an installed recorder
//! every call is a no-op. Each metric is declared once as a [`Metric`]
//! constant so names cannot drift between call sites.
//!
//! ```rust
//! use keyline_engine::telemetry::{self, CACHE_HITS};
//!
//! telemetry::describe_metrics();
//! metrics::counter!(CACHE_HITS.name, "namespace" => "derived").increment(1);
//! ```

use metrics::{describe_counter, describe_histogram, Unit};

/// The kind of metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonically increasing counter.
    Counter,
    /// Distribution of observed values.
    Histogram,
}

/// A metric declaration with its metadata.
#[derive(Debug, Clone)]
pub struct Metric {
    /// Metric name.
    pub name: &'static str,
    /// Counter or histogram.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// Unit of measurement, if any.
    pub unit: Option<Unit>,
    /// Expected label keys.
    pub labels: &'static [&'static str],
}

impl Metric {
    /// Declare a counter.
    pub const fn counter(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Counter,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Declare a histogram.
    pub const fn histogram(name: &'static str) -> Self {
        Self {
            name,
            kind: MetricKind::Histogram,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Set the description.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Set the unit.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Set the expected label keys.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Register the description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => {
                describe_counter!(self.name, unit, self.description);
            }
            (MetricKind::Counter, None) => {
                describe_counter!(self.name, self.description);
            }
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description);
            }
            (MetricKind::Histogram, None) => {
                describe_histogram!(self.name, self.description);
            }
        }
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Cache lookups served from disk. Labels: namespace (raw, derived).
pub const CACHE_HITS: Metric = Metric::counter("keyline.cache.hits")
    .with_description("Cache lookups served without recomputation")
    .with_unit(Unit::Count)
    .with_labels(&["namespace"]);

/// Cache lookups that had to fetch or compute. Labels: namespace.
pub const CACHE_MISSES: Metric = Metric::counter("keyline.cache.misses")
    .with_description("Cache lookups that fetched or computed the entry")
    .with_unit(Unit::Count)
    .with_labels(&["namespace"]);

/// Entries removed by pruning. Labels: namespace, reason (ttl, size).
pub const CACHE_EVICTIONS: Metric = Metric::counter("keyline.cache.evictions")
    .with_description("Cache entries removed by pruning")
    .with_unit(Unit::Count)
    .with_labels(&["namespace", "reason"]);

// ============================================================================
// Network
// ============================================================================

/// Tiles downloaded into the raw cache.
pub const TILE_DOWNLOADS: Metric = Metric::counter("keyline.tiles.downloads")
    .with_description("Tiles downloaded into the raw cache")
    .with_unit(Unit::Count);

/// Bytes downloaded into the raw cache.
pub const TILE_DOWNLOAD_BYTES: Metric = Metric::counter("keyline.tiles.download_bytes")
    .with_description("Bytes downloaded into the raw cache")
    .with_unit(Unit::Bytes);

/// Retries of transient network failures.
pub const RETRIES_TOTAL: Metric = Metric::counter("keyline.network.retries")
    .with_description("Retries of catalog queries and tile downloads")
    .with_unit(Unit::Count);

// ============================================================================
// Pipeline
// ============================================================================

/// External tool invocations. Labels: stage, outcome (ok, failed, timeout).
pub const TOOL_INVOCATIONS: Metric = Metric::counter("keyline.stage.tool_invocations")
    .with_description("External tool invocations by stage and outcome")
    .with_unit(Unit::Count)
    .with_labels(&["stage", "outcome"]);

/// Wall time of one processing stage. Labels: stage.
pub const STAGE_DURATION: Metric = Metric::histogram("keyline.stage.duration_ms")
    .with_description("Wall time of one processing stage")
    .with_unit(Unit::Milliseconds)
    .with_labels(&["stage"]);

/// Completed pipeline runs. Labels: outcome (success, error kind).
pub const PIPELINE_RUNS: Metric = Metric::counter("keyline.pipeline.runs")
    .with_description("Pipeline runs by outcome")
    .with_unit(Unit::Count)
    .with_labels(&["outcome"]);

/// Every metric declared by the engine.
pub const ALL_METRICS: &[Metric] = &[
    CACHE_HITS,
    CACHE_MISSES,
    CACHE_EVICTIONS,
    TILE_DOWNLOADS,
    TILE_DOWNLOAD_BYTES,
    RETRIES_TOTAL,
    TOOL_INVOCATIONS,
    STAGE_DURATION,
    PIPELINE_RUNS,
];

/// Register descriptions for all engine metrics. Call once at startup.
pub fn describe_metrics() {
    for metric in ALL_METRICS {
        metric.describe();
    }
}
