//! Configuration management using Figment
//!
//! Configuration is loaded once at startup and frozen. Sources, highest
//! precedence first:
//! 1. Environment variables (prefix: CORGI_, nested keys split on `__`)
//! 2. Current working directory: ./config.toml
//! 3. Default values
//!
//! `Config::validate` enforces the fail-closed production rules: the identity
//! salt must be non-default and the development identity bypass must be off.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, FieldError, Result};

/// Default identity salt; refused outside development
pub const DEFAULT_SALT: &str = "corgi-dev-salt-change-me";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Identity derivation and resolution
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Upstream instance access
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Persistence backend selection and tuning
    #[serde(default)]
    pub store: StoreConfig,

    /// Redis configuration (optional; in-process cache tier is always on)
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// Cache TTLs per content class
    #[serde(default)]
    pub cache: CacheConfig,

    /// Ranking pipeline tuning
    #[serde(default)]
    pub ranking: RankingConfig,

    /// Cold-start selection tuning
    #[serde(default)]
    pub coldstart: ColdStartConfig,

    /// Crawler politeness and scope
    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Timeline injection tuning
    #[serde(default)]
    pub injection: InjectionConfig,

    /// Rate limiter ceilings
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Interaction pipeline limits
    #[serde(default)]
    pub interactions: InteractionsConfig,

    /// Background job runner tuning
    #[serde(default)]
    pub jobs: JobsConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl ServiceConfig {
    /// Whether the service runs in production mode
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Identity derivation and resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Process secret used to derive pseudonymous aliases
    #[serde(default = "default_salt")]
    pub salt: String,

    /// Accept `user_id`/`instance` query parameters as an identity source.
    /// Development only; `validate` refuses it in production.
    #[serde(default = "default_false")]
    pub allow_query_fallback: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            salt: default_salt(),
            allow_query_fallback: false,
        }
    }
}

/// Upstream instance access configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Instance used when a request carries no resolvable identity
    #[serde(default = "default_instance")]
    pub default_instance: String,

    /// Per-call upstream deadline in seconds
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,

    /// User-Agent presented to upstream instances
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            default_instance: default_instance(),
            timeout_secs: default_upstream_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl UpstreamConfig {
    /// Upstream deadline as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Which persistence backend to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackendKind {
    /// libsql file-backed store for single-node development
    Embedded,
    /// PostgreSQL for production
    Postgres,
    /// Volatile in-memory store for tests and seeding experiments
    Memory,
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackendKind,

    /// Database file path (embedded backend)
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Connection URL (postgres backend)
    #[serde(default)]
    pub url: Option<String>,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing a connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Upper bound on IN-clause parameter lists for bulk lookups
    #[serde(default = "default_in_clause_limit")]
    pub in_clause_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout_secs: default_connection_timeout(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            in_clause_limit: default_in_clause_limit(),
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_redis_connections")]
    pub max_connections: usize,

    /// Maximum retry attempts for establishing a connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// Cache TTLs per content class, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Home and recommended timelines
    #[serde(default = "default_timeline_ttl")]
    pub timeline_ttl_secs: u64,

    /// User profiles
    #[serde(default = "default_profile_ttl")]
    pub profile_ttl_secs: u64,

    /// Instance metadata
    #[serde(default = "default_instance_ttl")]
    pub instance_ttl_secs: u64,

    /// Individual statuses
    #[serde(default = "default_status_ttl")]
    pub status_ttl_secs: u64,

    /// Everything else
    #[serde(default = "default_default_ttl")]
    pub default_ttl_secs: u64,

    /// In-process tier entry cap
    #[serde(default = "default_local_capacity")]
    pub local_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            timeline_ttl_secs: default_timeline_ttl(),
            profile_ttl_secs: default_profile_ttl(),
            instance_ttl_secs: default_instance_ttl(),
            status_ttl_secs: default_status_ttl(),
            default_ttl_secs: default_default_ttl(),
            local_capacity: default_local_capacity(),
        }
    }
}

/// Weights applied to the ranking sub-scores
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelWeights {
    /// Author affinity weight
    #[serde(default = "default_w_author")]
    pub author_affinity: f64,
    /// Engagement weight
    #[serde(default = "default_w_engagement")]
    pub engagement: f64,
    /// Recency weight
    #[serde(default = "default_w_recency")]
    pub recency: f64,
    /// Content affinity weight
    #[serde(default = "default_w_content")]
    pub content_affinity: f64,
}

impl Default for ModelWeights {
    fn default() -> Self {
        Self {
            author_affinity: default_w_author(),
            engagement: default_w_engagement(),
            recency: default_w_recency(),
            content_affinity: default_w_content(),
        }
    }
}

/// A named scoring model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier, selected per call via `model_id`
    pub id: String,

    /// Sub-score weights
    #[serde(default)]
    pub weights: ModelWeights,

    /// Recency half-life in hours
    #[serde(default = "default_half_life")]
    pub half_life_hours: f64,

    /// Laplace smoothing constant for author affinity
    #[serde(default = "default_smoothing_alpha")]
    pub smoothing_alpha: f64,

    /// Sub-score normalization strategy. `log_clip` is the shipped
    /// strategy; the field exists because normalization is a per-model
    /// choice that operators must be able to see.
    #[serde(default = "default_normalization")]
    pub normalization: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            weights: ModelWeights::default(),
            half_life_hours: default_half_life(),
            smoothing_alpha: default_smoothing_alpha(),
            normalization: default_normalization(),
        }
    }
}

/// Ranking pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingConfig {
    /// Cap on the candidate pool per run
    #[serde(default = "default_candidate_cap")]
    pub candidate_cap: usize,

    /// How far back candidate selection reaches, in days
    #[serde(default = "default_candidate_days")]
    pub candidate_days: i64,

    /// Per-author cap applied before truncation
    #[serde(default = "default_per_author_cap")]
    pub per_author_cap: usize,

    /// Per-instance cap applied before truncation
    #[serde(default = "default_per_instance_cap")]
    pub per_instance_cap: usize,

    /// Age after which a cached generation is considered stale, in seconds
    #[serde(default = "default_staleness")]
    pub staleness_secs: u64,

    /// Whether `view` interactions count toward positive affinity
    #[serde(default = "default_false")]
    pub views_are_positive: bool,

    /// Scoring models; the first entry is the default model
    #[serde(default = "default_models")]
    pub models: Vec<ModelConfig>,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            candidate_cap: default_candidate_cap(),
            candidate_days: default_candidate_days(),
            per_author_cap: default_per_author_cap(),
            per_instance_cap: default_per_instance_cap(),
            staleness_secs: default_staleness(),
            views_are_positive: false,
            models: default_models(),
        }
    }
}

impl RankingConfig {
    /// Resolve a model by id, falling back to the default model
    pub fn model(&self, id: Option<&str>) -> ModelConfig {
        match id {
            Some(id) => self
                .models
                .iter()
                .find(|m| m.id == id)
                .cloned()
                .unwrap_or_else(|| self.models.first().cloned().unwrap_or_default()),
            None => self.models.first().cloned().unwrap_or_default(),
        }
    }
}

/// Cold-start selection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColdStartConfig {
    /// Minimum weighted engagement for the strict selection tier
    #[serde(default = "default_engagement_threshold")]
    pub engagement_threshold: f64,

    /// Share of the diversity mix taken from top trending
    #[serde(default = "default_top_share")]
    pub top_share: f64,

    /// Share taken from trending outside the user's network
    #[serde(default = "default_outside_share")]
    pub outside_share: f64,
}

impl Default for ColdStartConfig {
    fn default() -> Self {
        Self {
            engagement_threshold: default_engagement_threshold(),
            top_share: default_top_share(),
            outside_share: default_outside_share(),
        }
    }
}

/// Crawler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// Instances to crawl
    #[serde(default)]
    pub instances: Vec<String>,

    /// Hashtag timelines to follow on every instance
    #[serde(default)]
    pub hashtags: Vec<String>,

    /// Floor on inter-request delay per instance, in milliseconds
    #[serde(default = "default_min_request_delay")]
    pub min_request_delay_ms: u64,

    /// Consecutive failures before an instance is marked unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cool-down for unhealthy instances, in seconds
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Posts older than this are swept, in days
    #[serde(default = "default_freshness_days")]
    pub freshness_days: i64,

    /// Tokens in author bios/fields that signal opt-out
    #[serde(default = "default_opt_out_tokens")]
    pub opt_out_tokens: Vec<String>,

    /// Opt-out cache TTL in hours
    #[serde(default = "default_opt_out_ttl")]
    pub opt_out_ttl_hours: i64,

    /// Page size requested from upstream timelines
    #[serde(default = "default_crawl_page_limit")]
    pub page_limit: usize,

    /// Interval between crawl cycles per instance, in seconds
    #[serde(default = "default_crawl_interval")]
    pub interval_secs: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            hashtags: Vec::new(),
            min_request_delay_ms: default_min_request_delay(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown(),
            freshness_days: default_freshness_days(),
            opt_out_tokens: default_opt_out_tokens(),
            opt_out_ttl_hours: default_opt_out_ttl(),
            page_limit: default_crawl_page_limit(),
            interval_secs: default_crawl_interval(),
        }
    }
}

/// Timeline injection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionConfig {
    /// Recommendations injected per home-timeline page
    #[serde(default = "default_max_injections")]
    pub max_injections: usize,

    /// Minimum upstream posts between two injections (uniform strategy)
    #[serde(default = "default_gap")]
    pub gap: usize,

    /// Placement strategy: uniform, top, or tag_match
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            max_injections: default_max_injections(),
            gap: default_gap(),
            strategy: default_strategy(),
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per window for authenticated aliases
    #[serde(default = "default_authenticated_rpm")]
    pub authenticated_rpm: u32,

    /// Requests per window for the anonymous alias; substantially lower
    #[serde(default = "default_anonymous_rpm")]
    pub anonymous_rpm: u32,

    /// Sliding window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            authenticated_rpm: default_authenticated_rpm(),
            anonymous_rpm: default_anonymous_rpm(),
            window_secs: default_window_secs(),
        }
    }
}

/// Interaction pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionsConfig {
    /// Maximum free-text length, measured before normalization
    #[serde(default = "default_max_text_len")]
    pub max_text_len: usize,

    /// Maximum context object nesting depth
    #[serde(default = "default_max_context_depth")]
    pub max_context_depth: usize,

    /// Record interactions for the anonymous alias
    #[serde(default = "default_false")]
    pub allow_anonymous: bool,
}

impl Default for InteractionsConfig {
    fn default() -> Self {
        Self {
            max_text_len: default_max_text_len(),
            max_context_depth: default_max_context_depth(),
            allow_anonymous: false,
        }
    }
}

/// Background job runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Retry budget per job
    #[serde(default = "default_job_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff, in milliseconds
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Per-job deadline in seconds
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Lifecycle sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Queue admission bound
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Dead-letter buffer bound
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_retries: default_job_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            job_timeout_secs: default_job_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            queue_depth: default_queue_depth(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            port: default_port(),
            log_level: default_log_level(),
            timeout_secs: default_timeout(),
            environment: default_environment(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            identity: IdentityConfig::default(),
            upstream: UpstreamConfig::default(),
            store: StoreConfig::default(),
            redis: None,
            cache: CacheConfig::default(),
            ranking: RankingConfig::default(),
            coldstart: ColdStartConfig::default(),
            crawler: CrawlerConfig::default(),
            injection: InjectionConfig::default(),
            rate_limit: RateLimitConfig::default(),
            interactions: InteractionsConfig::default(),
            jobs: JobsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment and `./config.toml`
    pub fn load() -> Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("CORGI_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Enforce start-up invariants; production fails closed
    pub fn validate(&self) -> Result<()> {
        let mut fields = Vec::new();

        if self.service.is_production() {
            if self.identity.salt == DEFAULT_SALT || self.identity.salt.len() < 16 {
                fields.push(FieldError::new(
                    "identity.salt",
                    "production requires a non-default salt of at least 16 characters",
                ));
            }
            if self.identity.allow_query_fallback {
                fields.push(FieldError::new(
                    "identity.allow_query_fallback",
                    "query-parameter identity must be off in production",
                ));
            }
        }

        if self.store.backend == StoreBackendKind::Postgres && self.store.url.is_none() {
            fields.push(FieldError::new(
                "store.url",
                "postgres backend requires a connection URL",
            ));
        }

        if self.rate_limit.window_secs == 0 {
            fields.push(FieldError::new(
                "rate_limit.window_secs",
                "window must be non-zero",
            ));
        }

        if fields.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation {
                message: "invalid configuration".to_string(),
                fields,
            })
        }
    }
}

fn default_service_name() -> String {
    "corgi".to_string()
}

fn default_port() -> u16 {
    5002
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_salt() -> String {
    DEFAULT_SALT.to_string()
}

fn default_false() -> bool {
    false
}

fn default_instance() -> String {
    "mastodon.social".to_string()
}

fn default_upstream_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("corgi/{}", env!("CARGO_PKG_VERSION"))
}

fn default_store_backend() -> StoreBackendKind {
    StoreBackendKind::Embedded
}

fn default_store_path() -> PathBuf {
    PathBuf::from("corgi.db")
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2
}

fn default_in_clause_limit() -> usize {
    5000
}

fn default_redis_connections() -> usize {
    16
}

fn default_timeline_ttl() -> u64 {
    120
}

fn default_profile_ttl() -> u64 {
    600
}

fn default_instance_ttl() -> u64 {
    3600
}

fn default_status_ttl() -> u64 {
    1800
}

fn default_default_ttl() -> u64 {
    900
}

fn default_local_capacity() -> usize {
    4096
}

fn default_w_author() -> f64 {
    0.4
}

fn default_w_engagement() -> f64 {
    0.3
}

fn default_w_recency() -> f64 {
    0.2
}

fn default_w_content() -> f64 {
    0.1
}

fn default_half_life() -> f64 {
    24.0
}

fn default_smoothing_alpha() -> f64 {
    5.0
}

fn default_normalization() -> String {
    "log_clip".to_string()
}

fn default_models() -> Vec<ModelConfig> {
    vec![ModelConfig::default()]
}

fn default_candidate_cap() -> usize {
    2000
}

fn default_candidate_days() -> i64 {
    7
}

fn default_per_author_cap() -> usize {
    3
}

fn default_per_instance_cap() -> usize {
    10
}

fn default_staleness() -> u64 {
    300
}

fn default_engagement_threshold() -> f64 {
    5.0
}

fn default_top_share() -> f64 {
    0.7
}

fn default_outside_share() -> f64 {
    0.2
}

fn default_min_request_delay() -> u64 {
    1000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown() -> u64 {
    900
}

fn default_freshness_days() -> i64 {
    14
}

fn default_opt_out_tokens() -> Vec<String> {
    vec!["#nobots".to_string(), "#noindex".to_string()]
}

fn default_opt_out_ttl() -> i64 {
    48
}

fn default_crawl_page_limit() -> usize {
    40
}

fn default_crawl_interval() -> u64 {
    300
}

fn default_max_injections() -> usize {
    3
}

fn default_gap() -> usize {
    2
}

fn default_strategy() -> String {
    "uniform".to_string()
}

fn default_authenticated_rpm() -> u32 {
    300
}

fn default_anonymous_rpm() -> u32 {
    30
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_text_len() -> usize {
    2000
}

fn default_max_context_depth() -> usize {
    4
}

fn default_job_retries() -> u32 {
    4
}

fn default_retry_base_delay() -> u64 {
    500
}

fn default_job_timeout() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    86_400
}

fn default_queue_depth() -> usize {
    256
}

fn default_dead_letter_capacity() -> usize {
    128
}
