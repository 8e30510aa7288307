//! Metric collection for the call-tracking runtime.
//!
//! Counters and histograms are emitted through the `metrics` facade; wire
//! up any exporter in the host application and call [`register_metrics`]
//! once at startup to attach descriptions.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        "calltrack_calls_started_total",
        "Total number of tracked calls started"
    );
    describe_counter!(
        "calltrack_calls_fulfilled_total",
        "Total number of calls settled with a value"
    );
    describe_counter!(
        "calltrack_calls_rejected_total",
        "Total number of calls settled with an error"
    );
    describe_counter!(
        "calltrack_calls_stale_total",
        "Total number of settlements superseded by a newer call"
    );
    describe_histogram!(
        "calltrack_call_duration_seconds",
        "Time from call start to settlement"
    );

    describe_counter!(
        "calltrack_pipelines_built_total",
        "Total number of pipelines assembled successfully"
    );
    describe_counter!(
        "calltrack_pipeline_build_failures_total",
        "Total number of pipeline builds aborted by configuration errors"
    );

    describe_counter!(
        "calltrack_group_partitions_created_total",
        "Total number of group partitions created"
    );
    describe_counter!(
        "calltrack_group_partitions_evicted_total",
        "Total number of partitions removed by scope eviction"
    );
    describe_counter!(
        "calltrack_group_partitions_cleared_total",
        "Total number of partitions removed by manual clear"
    );
}

/// Call lifecycle metrics recorder.
pub struct CallMetrics;

impl CallMetrics {
    /// Record a call start.
    pub fn record_start() {
        counter!("calltrack_calls_started_total").increment(1);
    }

    /// Record a fulfilled settlement.
    pub fn record_fulfill(duration: Duration, stale: bool) {
        counter!("calltrack_calls_fulfilled_total").increment(1);
        if stale {
            counter!("calltrack_calls_stale_total").increment(1);
        }
        histogram!("calltrack_call_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a rejected settlement.
    pub fn record_reject(duration: Duration, stale: bool) {
        counter!("calltrack_calls_rejected_total").increment(1);
        if stale {
            counter!("calltrack_calls_stale_total").increment(1);
        }
        histogram!("calltrack_call_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Pipeline assembly metrics recorder.
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Record a successful build.
    pub fn record_build() {
        counter!("calltrack_pipelines_built_total").increment(1);
    }

    /// Record a build aborted by a configuration error.
    pub fn record_build_failure() {
        counter!("calltrack_pipeline_build_failures_total").increment(1);
    }
}

/// Group partition metrics recorder.
pub struct GroupMetrics;

impl GroupMetrics {
    /// Record a partition creation.
    pub fn record_partition_created() {
        counter!("calltrack_group_partitions_created_total").increment(1);
    }

    /// Record partitions removed by scope eviction.
    pub fn record_evictions(count: usize) {
        counter!("calltrack_group_partitions_evicted_total").increment(count as u64);
    }

    /// Record partitions removed by a manual clear.
    pub fn record_cleared(count: usize) {
        counter!("calltrack_group_partitions_cleared_total").increment(count as u64);
    }
}
