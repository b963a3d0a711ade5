use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, register_int_counter_vec,
    register_int_gauge_vec, CounterVec, GaugeVec, HistogramVec, IntCounterVec, IntGaugeVec,
};

pub static AGENT_EXECUTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_agent_executions_total",
        "Total agent executions",
        &["agent_id", "status"]
    )
    .unwrap()
});

pub static AGENT_EXECUTION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "mongoclaw_agent_execution_duration_seconds",
        "Agent execution duration",
        &["agent_id"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap()
});

pub static QUEUE_PROCESSED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_queue_processed_total",
        "Total items processed per queue",
        &["queue", "status"]
    )
    .unwrap()
});

pub static CHANGE_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_change_events_total",
        "Total change events received",
        &["database", "collection", "operation"]
    )
    .unwrap()
});

pub static AGENT_STREAM_PENDING: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "mongoclaw_agent_stream_pending",
        "Pending queue items per agent stream",
        &["agent_id", "stream"]
    )
    .unwrap()
});

pub static AGENT_STREAM_INFLIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "mongoclaw_agent_stream_inflight",
        "In-flight work items per agent stream",
        &["agent_id", "stream"]
    )
    .unwrap()
});

pub static AGENT_STREAM_STARVATION_CYCLES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_agent_stream_starvation_cycles_total",
        "Consecutive empty-read starvation signals per agent stream",
        &["agent_id", "stream"]
    )
    .unwrap()
});

pub static AGENT_STREAM_SATURATION_SKIPS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_agent_stream_saturation_skips_total",
        "Times a stream was skipped due to the in-flight cap",
        &["agent_id", "stream"]
    )
    .unwrap()
});

pub static DISPATCH_ADMISSION_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_dispatch_admission_total",
        "Dispatch admission decisions under backpressure",
        &["agent_id", "stream", "decision"]
    )
    .unwrap()
});

pub static DISPATCH_QUEUE_FULLNESS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "mongoclaw_dispatch_queue_fullness",
        "Dispatch-time queue fullness ratio (0-1)",
        &["stream"]
    )
    .unwrap()
});

pub static DISPATCH_ROUTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_dispatch_routed_total",
        "Dispatched work items by routing strategy and stream",
        &["strategy", "stream"]
    )
    .unwrap()
});

pub static REPLAYED_DELIVERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_replayed_deliveries_total",
        "Redeliveries observed (attempt > 0), reflects at-least-once behavior",
        &["agent_id"]
    )
    .unwrap()
});

pub static VERSION_CONFLICTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_version_conflicts_total",
        "Strict-consistency version conflicts",
        &["agent_id"]
    )
    .unwrap()
});

pub static HASH_CONFLICTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_hash_conflicts_total",
        "Strict document-hash conflicts",
        &["agent_id"]
    )
    .unwrap()
});

pub static AGENT_QUARANTINE_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_agent_quarantine_events_total",
        "Times agents entered temporary quarantine",
        &["agent_id"]
    )
    .unwrap()
});

pub static AGENT_LATENCY_SLO_VIOLATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_agent_latency_slo_violations_total",
        "Executions exceeding the configured latency SLO",
        &["agent_id"]
    )
    .unwrap()
});

pub static LOOP_GUARD_SKIPS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_loop_guard_skips_total",
        "Events skipped because the mutation came from an enrichment write",
        &["agent_id"]
    )
    .unwrap()
});

pub static SHADOW_WRITES_SKIPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_shadow_writes_skipped_total",
        "Writebacks suppressed by shadow mode",
        &["agent_id"]
    )
    .unwrap()
});

pub static POLICY_DECISIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_policy_decisions_total",
        "Policy evaluation decisions",
        &["agent_id", "action", "matched"]
    )
    .unwrap()
});

pub static AGENT_CONCURRENCY_WAITS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_agent_concurrency_waits_total",
        "Waits on the per-agent concurrency cap",
        &["agent_id"]
    )
    .unwrap()
});

pub static RETRIES_SCHEDULED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_retries_scheduled_total",
        "Retry attempts scheduled",
        &["agent_id", "reason"]
    )
    .unwrap()
});

pub static CIRCUIT_BREAKER_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "mongoclaw_circuit_breaker_state",
        "Circuit breaker state (0=closed, 1=half-open, 2=open)",
        &["name"]
    )
    .unwrap()
});

pub static AI_COST_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "mongoclaw_ai_cost_usd_total",
        "Total AI spend in USD",
        &["provider", "model"]
    )
    .unwrap()
});

pub static AI_TOKENS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_ai_tokens_total",
        "Total AI tokens used",
        &["provider", "model", "type"]
    )
    .unwrap()
});
