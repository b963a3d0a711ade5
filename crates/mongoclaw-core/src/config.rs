use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    ByAgent,
    ByCollection,
    Single,
    Partitioned,
    ByPriority,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::ByAgent => "by_agent",
            RoutingStrategy::ByCollection => "by_collection",
            RoutingStrategy::Single => "single",
            RoutingStrategy::Partitioned => "partitioned",
            RoutingStrategy::ByPriority => "by_priority",
        }
    }
}

impl FromStr for RoutingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "by_agent" => Ok(RoutingStrategy::ByAgent),
            "by_collection" => Ok(RoutingStrategy::ByCollection),
            "single" => Ok(RoutingStrategy::Single),
            "partitioned" => Ok(RoutingStrategy::Partitioned),
            "by_priority" => Ok(RoutingStrategy::ByPriority),
            other => Err(Error::Config(format!("unknown routing strategy '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    Drop,
    #[default]
    Defer,
    Dlq,
}

impl FromStr for OverflowPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "drop" => Ok(OverflowPolicy::Drop),
            "defer" => Ok(OverflowPolicy::Defer),
            "dlq" => Ok(OverflowPolicy::Dlq),
            other => Err(Error::Config(format!("unknown overflow policy '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
    pub agents_collection: String,
    pub executions_collection: String,
    pub resume_tokens_collection: String,
    pub leader_collection: String,
    pub idempotency_collection: String,
    pub max_pool_size: u32,
    pub min_pool_size: u32,
    pub server_selection_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub max_connections: u32,
    pub stream_max_len: u64,
    pub consumer_group: String,
    pub block_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AiDefaults {
    pub default_provider: String,
    pub default_model: String,
    pub default_temperature: f64,
    pub default_max_tokens: u32,
    pub request_timeout: f64,
    pub cache_enabled: bool,
    pub global_cost_limit_usd: Option<f64>,
    pub global_token_limit: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub routing_strategy: RoutingStrategy,
    pub partition_count: u32,
    pub batch_size: usize,
    pub fair_scheduling_enabled: bool,
    pub fair_stream_batch_size: usize,
    pub fair_streams_per_cycle: Option<usize>,
    pub max_in_flight_per_agent_stream: Option<u64>,
    pub pending_metrics_interval_seconds: f64,
    pub starvation_cycle_threshold: u64,
    pub dispatch_backpressure_enabled: bool,
    pub dispatch_backpressure_threshold: f64,
    pub dispatch_overflow_policy: OverflowPolicy,
    pub dispatch_min_priority_when_backpressured: u8,
    pub dispatch_defer_seconds: f64,
    pub dispatch_defer_max_attempts: u32,
    pub dispatch_pressure_cache_ttl_seconds: f64,
    pub agent_failure_window_seconds: f64,
    pub agent_failure_max: u32,
    pub quarantine_seconds: f64,
    pub latency_slo_ms: f64,
    pub max_retries: u32,
    pub retry_base_delay: f64,
    pub retry_max_delay: f64,
    pub execution_timeout: f64,
    pub shutdown_timeout: f64,
    pub backpressure_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mongodb: MongoConfig,
    pub redis: RedisConfig,
    pub ai: AiDefaults,
    pub worker: WorkerConfig,
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("invalid value '{raw}' for {key}"))),
        Err(_) => Ok(default),
    }
}

fn env_opt<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid value '{raw}' for {key}"))),
        _ => Ok(None),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(Error::Config(format!("invalid value '{other}' for {key}"))),
        },
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            mongodb: MongoConfig {
                uri: env_str("MONGODB_URI", "mongodb://localhost:27017"),
                database: env_str("MONGODB_DATABASE", "mongoclaw"),
                agents_collection: env_str("MONGODB_AGENTS_COLLECTION", "agents"),
                executions_collection: env_str("MONGODB_EXECUTIONS_COLLECTION", "executions"),
                resume_tokens_collection: env_str(
                    "MONGODB_RESUME_TOKENS_COLLECTION",
                    "resume_tokens",
                ),
                leader_collection: env_str("MONGODB_LEADER_COLLECTION", "leader_election"),
                idempotency_collection: env_str(
                    "MONGODB_IDEMPOTENCY_COLLECTION",
                    "idempotency_keys",
                ),
                max_pool_size: env_parse("MONGODB_MAX_POOL_SIZE", 100)?,
                min_pool_size: env_parse("MONGODB_MIN_POOL_SIZE", 10)?,
                server_selection_timeout_ms: env_parse("MONGODB_SERVER_SELECTION_TIMEOUT_MS", 5000)?,
            },
            redis: RedisConfig {
                url: env_str("REDIS_URL", "redis://localhost:6379/0"),
                max_connections: env_parse("REDIS_MAX_CONNECTIONS", 50)?,
                stream_max_len: env_parse("REDIS_STREAM_MAX_LEN", 100_000)?,
                consumer_group: env_str("REDIS_CONSUMER_GROUP", "mongoclaw-workers"),
                block_ms: env_parse("REDIS_BLOCK_MS", 5000)?,
            },
            ai: AiDefaults {
                default_provider: env_str("AI_DEFAULT_PROVIDER", "openai"),
                default_model: env_str("AI_DEFAULT_MODEL", "gpt-4o-mini"),
                default_temperature: env_parse("AI_DEFAULT_TEMPERATURE", 0.7)?,
                default_max_tokens: env_parse("AI_DEFAULT_MAX_TOKENS", 2048)?,
                request_timeout: env_parse("AI_REQUEST_TIMEOUT", 60.0)?,
                cache_enabled: env_bool("AI_CACHE_ENABLED", true)?,
                global_cost_limit_usd: env_opt("AI_GLOBAL_COST_LIMIT_USD")?,
                global_token_limit: env_opt("AI_GLOBAL_TOKEN_LIMIT")?,
            },
            worker: WorkerConfig {
                pool_size: env_parse("WORKER_POOL_SIZE", 10)?,
                routing_strategy: env_str("WORKER_ROUTING_STRATEGY", "by_agent").parse()?,
                partition_count: env_parse("WORKER_ROUTING_PARTITION_COUNT", 8)?,
                batch_size: env_parse("WORKER_BATCH_SIZE", 10)?,
                fair_scheduling_enabled: env_bool("WORKER_FAIR_SCHEDULING_ENABLED", true)?,
                fair_stream_batch_size: env_parse("WORKER_FAIR_STREAM_BATCH_SIZE", 1)?,
                fair_streams_per_cycle: env_opt("WORKER_FAIR_STREAMS_PER_CYCLE")?,
                max_in_flight_per_agent_stream: env_opt("WORKER_MAX_IN_FLIGHT_PER_AGENT_STREAM")?,
                pending_metrics_interval_seconds: env_parse(
                    "WORKER_PENDING_METRICS_INTERVAL_SECONDS",
                    10.0,
                )?,
                starvation_cycle_threshold: env_parse("WORKER_STARVATION_CYCLE_THRESHOLD", 20)?,
                dispatch_backpressure_enabled: env_bool(
                    "WORKER_DISPATCH_BACKPRESSURE_ENABLED",
                    true,
                )?,
                dispatch_backpressure_threshold: env_parse(
                    "WORKER_DISPATCH_BACKPRESSURE_THRESHOLD",
                    0.8,
                )?,
                dispatch_overflow_policy: env_str("WORKER_DISPATCH_OVERFLOW_POLICY", "defer")
                    .parse()?,
                dispatch_min_priority_when_backpressured: env_parse(
                    "WORKER_DISPATCH_MIN_PRIORITY_WHEN_BACKPRESSURED",
                    5,
                )?,
                dispatch_defer_seconds: env_parse("WORKER_DISPATCH_DEFER_SECONDS", 0.25)?,
                dispatch_defer_max_attempts: env_parse("WORKER_DISPATCH_DEFER_MAX_ATTEMPTS", 3)?,
                dispatch_pressure_cache_ttl_seconds: env_parse(
                    "WORKER_DISPATCH_PRESSURE_CACHE_TTL_SECONDS",
                    1.0,
                )?,
                agent_failure_window_seconds: env_parse(
                    "WORKER_AGENT_FAILURE_WINDOW_SECONDS",
                    60.0,
                )?,
                agent_failure_max: env_parse("WORKER_AGENT_FAILURE_MAX", 20)?,
                quarantine_seconds: env_parse("WORKER_QUARANTINE_SECONDS", 30.0)?,
                latency_slo_ms: env_parse("WORKER_LATENCY_SLO_MS", 3000.0)?,
                max_retries: env_parse("WORKER_MAX_RETRIES", 3)?,
                retry_base_delay: env_parse("WORKER_RETRY_BASE_DELAY", 1.0)?,
                retry_max_delay: env_parse("WORKER_RETRY_MAX_DELAY", 60.0)?,
                execution_timeout: env_parse("WORKER_EXECUTION_TIMEOUT", 300.0)?,
                shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT", 30.0)?,
                backpressure_threshold: env_parse("WORKER_BACKPRESSURE_THRESHOLD", 0.8)?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.worker.pool_size == 0 {
            return Err(Error::Config("WORKER_POOL_SIZE must be at least 1".into()));
        }
        if self.worker.retry_base_delay > self.worker.retry_max_delay {
            return Err(Error::Config(
                "WORKER_RETRY_BASE_DELAY must not exceed WORKER_RETRY_MAX_DELAY".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.worker.dispatch_backpressure_threshold) {
            return Err(Error::Config(
                "WORKER_DISPATCH_BACKPRESSURE_THRESHOLD must be within 0..=1".into(),
            ));
        }
        if self.worker.partition_count == 0 {
            return Err(Error::Config(
                "WORKER_ROUTING_PARTITION_COUNT must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        // Defaults only; ambient env is intentionally ignored here so tests
        // are insensitive to the calling environment.
        Self {
            mongodb: MongoConfig {
                uri: "mongodb://localhost:27017".into(),
                database: "mongoclaw".into(),
                agents_collection: "agents".into(),
                executions_collection: "executions".into(),
                resume_tokens_collection: "resume_tokens".into(),
                leader_collection: "leader_election".into(),
                idempotency_collection: "idempotency_keys".into(),
                max_pool_size: 100,
                min_pool_size: 10,
                server_selection_timeout_ms: 5000,
            },
            redis: RedisConfig {
                url: "redis://localhost:6379/0".into(),
                max_connections: 50,
                stream_max_len: 100_000,
                consumer_group: "mongoclaw-workers".into(),
                block_ms: 5000,
            },
            ai: AiDefaults {
                default_provider: "openai".into(),
                default_model: "gpt-4o-mini".into(),
                default_temperature: 0.7,
                default_max_tokens: 2048,
                request_timeout: 60.0,
                cache_enabled: true,
                global_cost_limit_usd: None,
                global_token_limit: None,
            },
            worker: WorkerConfig {
                pool_size: 10,
                routing_strategy: RoutingStrategy::ByAgent,
                partition_count: 8,
                batch_size: 10,
                fair_scheduling_enabled: true,
                fair_stream_batch_size: 1,
                fair_streams_per_cycle: None,
                max_in_flight_per_agent_stream: None,
                pending_metrics_interval_seconds: 10.0,
                starvation_cycle_threshold: 20,
                dispatch_backpressure_enabled: true,
                dispatch_backpressure_threshold: 0.8,
                dispatch_overflow_policy: OverflowPolicy::Defer,
                dispatch_min_priority_when_backpressured: 5,
                dispatch_defer_seconds: 0.25,
                dispatch_defer_max_attempts: 3,
                dispatch_pressure_cache_ttl_seconds: 1.0,
                agent_failure_window_seconds: 60.0,
                agent_failure_max: 20,
                quarantine_seconds: 30.0,
                latency_slo_ms: 3000.0,
                max_retries: 3,
                retry_base_delay: 1.0,
                retry_max_delay: 60.0,
                execution_timeout: 300.0,
                shutdown_timeout: 30.0,
                backpressure_threshold: 0.8,
            },
        }
    }
}
