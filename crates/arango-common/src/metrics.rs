//! Metrics registry for plan builder and executor observability
//!
//! Provides OpenTelemetry metrics for:
//! - Actions generated, started, succeeded and failed
//! - Plan aborts (explicit and timeout)
//! - Rebalancer shard moves
//! - Reconciliation duration

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
use opentelemetry::KeyValue;

/// Global meter for operator metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("arango"));

// ============================================================================
// Action Metrics
// ============================================================================

/// Counter of actions placed into a plan by a builder
///
/// Labels:
/// - `priority`: normal, high
/// - `action`: action type name
pub static ACTIONS_GENERATED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("arango_actions_generated_total")
        .with_description("Total number of actions generated by the plan builder")
        .with_unit("{actions}")
        .build()
});

/// Counter of actions that completed
///
/// Labels:
/// - `action`: action type name
pub static ACTIONS_SUCCEEDED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("arango_actions_succeeded_total")
        .with_description("Total number of actions that completed")
        .with_unit("{actions}")
        .build()
});

/// Counter of actions that failed fatally
///
/// Labels:
/// - `action`: action type name
pub static ACTIONS_FAILED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("arango_actions_failed_total")
        .with_description("Total number of actions that failed")
        .with_unit("{actions}")
        .build()
});

/// Number of actions started but not yet finished
///
/// Labels:
/// - `action`: action type name
pub static ACTIONS_CURRENT: Lazy<UpDownCounter<i64>> = Lazy::new(|| {
    METER
        .i64_up_down_counter("arango_actions_current")
        .with_description("Number of actions currently waiting for progress")
        .with_unit("{actions}")
        .build()
});

/// Counter of plans dropped before completion
///
/// Labels:
/// - `reason`: abort, timeout, failure
pub static PLAN_ABORTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("arango_plan_aborts_total")
        .with_description("Total number of plans discarded before completion")
        .with_unit("{plans}")
        .build()
});

// ============================================================================
// Rebalancer Metrics
// ============================================================================

/// Counter of shard moves generated by the rebalancer
pub static REBALANCER_MOVES_GENERATED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("arango_rebalancer_moves_generated_total")
        .with_description("Total number of shard moves generated")
        .with_unit("{moves}")
        .build()
});

/// Counter of shard moves that finished successfully
pub static REBALANCER_MOVES_SUCCEEDED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("arango_rebalancer_moves_succeeded_total")
        .with_description("Total number of shard moves that succeeded")
        .with_unit("{moves}")
        .build()
});

/// Counter of shard moves that failed
pub static REBALANCER_MOVES_FAILED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("arango_rebalancer_moves_failed_total")
        .with_description("Total number of shard moves that failed")
        .with_unit("{moves}")
        .build()
});

// ============================================================================
// Reconcile Metrics
// ============================================================================

/// Histogram of deployment reconciliation duration
///
/// Labels:
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("arango_reconcile_duration_seconds")
        .with_description("Duration of deployment reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Priority label for the normal plan
pub const PRIORITY_NORMAL: &str = "normal";
/// Priority label for the high-priority plan
pub const PRIORITY_HIGH: &str = "high";

/// Record that a builder produced an action
pub fn record_action_generated(priority: &'static str, action: &str) {
    ACTIONS_GENERATED.add(
        1,
        &[
            KeyValue::new("priority", priority),
            KeyValue::new("action", action.to_string()),
        ],
    );
}

/// Record that an action completed
pub fn record_action_succeeded(action: &str) {
    ACTIONS_SUCCEEDED.add(1, &[KeyValue::new("action", action.to_string())]);
}

/// Record that an action failed
pub fn record_action_failed(action: &str) {
    ACTIONS_FAILED.add(1, &[KeyValue::new("action", action.to_string())]);
}

/// Adjust the number of in-flight actions
pub fn record_action_current(action: &str, delta: i64) {
    ACTIONS_CURRENT.add(delta, &[KeyValue::new("action", action.to_string())]);
}

/// Record that a plan was dropped
pub fn record_plan_abort(reason: &'static str) {
    PLAN_ABORTS.add(1, &[KeyValue::new("reason", reason)]);
}

/// Record the outcome of rebalancer shard moves
pub fn record_rebalancer_moves(generated: u64, succeeded: u64, failed: u64) {
    if generated > 0 {
        REBALANCER_MOVES_GENERATED.add(generated, &[]);
    }
    if succeeded > 0 {
        REBALANCER_MOVES_SUCCEEDED.add(succeeded, &[]);
    }
    if failed > 0 {
        REBALANCER_MOVES_FAILED.add(failed, &[]);
    }
}

/// Record how long one reconciliation took
pub fn record_reconcile_duration(seconds: f64, success: bool) {
    let result = if success { "success" } else { "error" };
    RECONCILE_DURATION.record(seconds, &[KeyValue::new("result", result)]);
}
