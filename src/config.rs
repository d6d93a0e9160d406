//! Balancer configuration — algorithm choice and per-feature tuning
//!
//! Every field carries an explicit default so a bare `[balancer]` table (or
//! `BalancerConfig::default()`) yields a working round-robin balancer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Load balancing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Distribute requests evenly across all servers
    #[default]
    RoundRobin,
    /// Route to the server with fewest active connections
    LeastConnections,
    /// Distribute proportionally to server weights
    Weighted,
    /// Stable hash of the client IP
    IpHash,
    /// Composite score over response time, error rate and connections
    HealthBased,
    /// Prefer servers in the request's region
    Geographic,
}

impl std::str::FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "round_robin" => Ok(Self::RoundRobin),
            "least_connections" => Ok(Self::LeastConnections),
            "weighted" => Ok(Self::Weighted),
            "ip_hash" => Ok(Self::IpHash),
            "health_based" => Ok(Self::HealthBased),
            "geographic" => Ok(Self::Geographic),
            other => Err(format!("unknown algorithm: {}", other)),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoundRobin => write!(f, "round_robin"),
            Self::LeastConnections => write!(f, "least_connections"),
            Self::Weighted => write!(f, "weighted"),
            Self::IpHash => write!(f, "ip_hash"),
            Self::HealthBased => write!(f, "health_based"),
            Self::Geographic => write!(f, "geographic"),
        }
    }
}

/// Top-level balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BalancerConfig {
    /// Selection algorithm
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Active health checking
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Per-server circuit breaking
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Cookie-based session affinity
    #[serde(default)]
    pub sticky_session: StickySessionConfig,

    /// Region-aware routing
    #[serde(default)]
    pub geographic: GeographicConfig,

    /// Admission control and request queuing
    #[serde(default)]
    pub queuing: QueueConfig,
}

/// Active health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Whether per-server probe tasks are started
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Probe interval in milliseconds
    #[serde(default = "default_hc_interval_ms")]
    pub interval_ms: u64,

    /// Per-probe timeout in milliseconds (independent of the interval)
    #[serde(default = "default_hc_timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive probe failures before a server is marked unhealthy
    #[serde(default = "default_hc_retries")]
    pub retries: u32,

    /// HTTP path probed by the default transport
    #[serde(default = "default_hc_path")]
    pub path: String,

    /// Status code the default transport expects
    #[serde(default = "default_hc_status")]
    pub expected_status: u16,
}

impl HealthCheckConfig {
    /// Probe interval as a `Duration`
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Probe timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_ms: default_hc_interval_ms(),
            timeout_ms: default_hc_timeout_ms(),
            retries: default_hc_retries(),
            path: default_hc_path(),
            expected_status: default_hc_status(),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Whether failures trip the breaker
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the circuit stays open before a probe may release it, in ms
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,

    /// Trial calls admitted while half-open
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl CircuitBreakerConfig {
    /// Recovery timeout as a `Duration`
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

/// Sticky session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StickySessionConfig {
    /// Whether session affinity overrides the algorithm
    #[serde(default)]
    pub enabled: bool,

    /// Cookie carrying the session id
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Session lifetime in milliseconds
    #[serde(default = "default_session_ttl_ms")]
    pub ttl_ms: u64,
}

impl StickySessionConfig {
    /// Session TTL as a `Duration`
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

impl Default for StickySessionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cookie_name: default_cookie_name(),
            ttl_ms: default_session_ttl_ms(),
        }
    }
}

/// Geographic routing configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeographicConfig {
    /// Whether region preference applies
    #[serde(default)]
    pub enabled: bool,

    /// Known regions (informational; unknown regions still fall back)
    #[serde(default)]
    pub regions: Vec<String>,
}

/// Admission control and queuing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Whether overload requests are queued instead of dispatched
    #[serde(default)]
    pub enabled: bool,

    /// Maximum queued requests before `RequestQueueFull`
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Per-item queue timeout in milliseconds
    #[serde(default = "default_queue_timeout_ms")]
    pub timeout_ms: u64,

    /// Assumed concurrent capacity of a single server
    #[serde(default = "default_server_capacity")]
    pub server_capacity: usize,

    /// Fraction of aggregate capacity above which requests queue
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Dispatcher drain interval in milliseconds
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
}

impl QueueConfig {
    /// Queue timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Dispatcher interval as a `Duration`
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_queue_size: default_max_queue_size(),
            timeout_ms: default_queue_timeout_ms(),
            server_capacity: default_server_capacity(),
            threshold: default_threshold(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_hc_interval_ms() -> u64 {
    10_000
}

fn default_hc_timeout_ms() -> u64 {
    5_000
}

fn default_hc_retries() -> u32 {
    3
}

fn default_hc_path() -> String {
    "/health".to_string()
}

fn default_hc_status() -> u16 {
    200
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_calls() -> u32 {
    3
}

fn default_cookie_name() -> String {
    "lb_session".to_string()
}

fn default_session_ttl_ms() -> u64 {
    3_600_000
}

fn default_max_queue_size() -> usize {
    1_000
}

fn default_queue_timeout_ms() -> u64 {
    30_000
}

fn default_server_capacity() -> usize {
    100
}

fn default_threshold() -> f64 {
    0.8
}

fn default_dispatch_interval_ms() -> u64 {
    100
}
