//! Server registry — owns the backend pool and its circuit breakers
//!
//! Servers are handed out as `Arc<Server>` so an in-flight request keeps
//! its captured reference across a concurrent `remove`; lookups after
//! removal simply return `None`.

use crate::breaker::CircuitBreaker;
use crate::config::CircuitBreakerConfig;
use crate::error::{BalancerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Registration parameters for a backend server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Host name or address
    pub host: String,
    /// Port
    pub port: u16,
    /// Weight for weighted selection (must be ≥ 1)
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Region for geographic routing
    #[serde(default)]
    pub region: Option<String>,
    /// Logical group
    #[serde(default)]
    pub group: Option<String>,
}

fn default_weight() -> u32 {
    1
}

impl ServerSpec {
    /// Minimal spec with defaults
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: 1,
            region: None,
            group: None,
        }
    }

    /// Set the weight
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set the region
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set the group
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Partial update applied by `update_server_config`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerPatch {
    /// New weight (must be ≥ 1)
    pub weight: Option<u32>,
    /// New region
    pub region: Option<String>,
    /// New group
    pub group: Option<String>,
}

/// A single backend server
#[derive(Debug)]
pub struct Server {
    /// Unique id
    pub id: String,
    /// Host name or address
    pub host: String,
    /// Port
    pub port: u16,
    weight: AtomicU32,
    region: RwLock<Option<String>>,
    group: RwLock<Option<String>>,
    healthy: AtomicBool,
    connections: AtomicUsize,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    avg_response_ms: AtomicU64,
    last_health_check: RwLock<Option<Instant>>,
}

impl Server {
    fn new(id: String, spec: ServerSpec) -> Self {
        Self {
            id,
            host: spec.host,
            port: spec.port,
            weight: AtomicU32::new(spec.weight),
            region: RwLock::new(spec.region),
            group: RwLock::new(spec.group),
            healthy: AtomicBool::new(true),
            connections: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            avg_response_ms: AtomicU64::new(0),
            last_health_check: RwLock::new(None),
        }
    }

    /// Base URL for the default HTTP probe transport
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Current weight
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub(crate) fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    /// Region, if configured
    pub fn region(&self) -> Option<String> {
        self.region.read().unwrap().clone()
    }

    pub(crate) fn set_region(&self, region: Option<String>) {
        *self.region.write().unwrap() = region;
    }

    /// Group, if configured
    pub fn group(&self) -> Option<String> {
        self.group.read().unwrap().clone()
    }

    pub(crate) fn set_group(&self, group: Option<String>) {
        *self.group.write().unwrap() = group;
    }

    /// Whether the server currently passes health checks
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Flip the healthy flag; returns the previous value
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::Relaxed)
    }

    /// Active connection count
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Increment active connections
    pub fn acquire_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections, saturating at zero
    pub fn release_connection(&self) {
        let _ = self
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1));
    }

    /// Lifetime request count
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Lifetime error count
    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    /// Record a completed request against the lifetime counters
    pub fn record_request(&self, failed: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Rolling average response time in milliseconds
    pub fn avg_response_ms(&self) -> u64 {
        self.avg_response_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn set_avg_response_ms(&self, ms: u64) {
        self.avg_response_ms.store(ms, Ordering::Relaxed);
    }

    /// When the server was last probed
    pub fn last_health_check(&self) -> Option<Instant> {
        *self.last_health_check.read().unwrap()
    }

    pub(crate) fn set_last_health_check(&self, at: Instant) {
        *self.last_health_check.write().unwrap() = Some(at);
    }
}

/// Per-server snapshot for external observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSnapshot {
    /// Server id
    pub id: String,
    /// Host
    pub host: String,
    /// Port
    pub port: u16,
    /// Weight
    pub weight: u32,
    /// Region
    pub region: Option<String>,
    /// Group
    pub group: Option<String>,
    /// Healthy flag
    pub healthy: bool,
    /// Active connections
    pub connections: usize,
    /// Lifetime requests
    pub total_requests: u64,
    /// Lifetime errors
    pub total_errors: u64,
    /// Rolling average response time in ms
    pub avg_response_ms: u64,
    /// Circuit state as text
    pub circuit_state: String,
    /// Consecutive breaker failures
    pub consecutive_failures: u32,
}

/// Registry of backend servers and their breakers
pub struct ServerRegistry {
    breaker_config: CircuitBreakerConfig,
    // Vec preserves first-seen order for round-robin and tie-breaking;
    // the map indexes breakers by server id.
    servers: RwLock<Vec<Arc<Server>>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl ServerRegistry {
    /// Create an empty registry
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            breaker_config,
            servers: RwLock::new(Vec::new()),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a server and its breaker; fails fast on duplicate id or
    /// weight < 1
    pub fn insert(&self, id: &str, spec: ServerSpec) -> Result<Arc<Server>> {
        if spec.weight < 1 {
            return Err(BalancerError::Config(format!(
                "server '{}' has weight {}, must be >= 1",
                id, spec.weight
            )));
        }

        let mut servers = self.servers.write().unwrap();
        if servers.iter().any(|s| s.id == id) {
            return Err(BalancerError::Config(format!(
                "server '{}' already registered",
                id
            )));
        }

        let server = Arc::new(Server::new(id.to_string(), spec));
        servers.push(server.clone());

        let mut breakers = self.breakers.write().unwrap();
        breakers.insert(
            id.to_string(),
            Arc::new(CircuitBreaker::new(self.breaker_config.clone())),
        );

        Ok(server)
    }

    /// Remove a server and its breaker; returns the removed entry
    pub fn remove(&self, id: &str) -> Option<Arc<Server>> {
        let removed = {
            let mut servers = self.servers.write().unwrap();
            let pos = servers.iter().position(|s| s.id == id)?;
            Some(servers.remove(pos))
        };
        self.breakers.write().unwrap().remove(id);
        removed
    }

    /// Look up a server by id
    pub fn get(&self, id: &str) -> Option<Arc<Server>> {
        self.servers
            .read()
            .unwrap()
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    /// Look up a server's breaker
    pub fn breaker(&self, id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().unwrap().get(id).cloned()
    }

    /// All registered servers in first-seen order
    pub fn all(&self) -> Vec<Arc<Server>> {
        self.servers.read().unwrap().clone()
    }

    /// Servers eligible for selection: healthy and breaker not open,
    /// optionally restricted to a group, first-seen order preserved
    pub fn available(&self, group: Option<&str>) -> Vec<Arc<Server>> {
        let servers = self.servers.read().unwrap();
        let breakers = self.breakers.read().unwrap();
        servers
            .iter()
            .filter(|s| s.is_healthy())
            .filter(|s| breakers.get(&s.id).map(|b| !b.is_open()).unwrap_or(false))
            .filter(|s| match group {
                Some(g) => s.group().as_deref() == Some(g),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Derived group index: group name → member server ids
    pub fn groups(&self) -> HashMap<String, Vec<String>> {
        let servers = self.servers.read().unwrap();
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        for server in servers.iter() {
            if let Some(group) = server.group() {
                groups.entry(group).or_default().push(server.id.clone());
            }
        }
        groups
    }

    /// Sum of active connections across all servers
    pub fn total_connections(&self) -> usize {
        self.servers
            .read()
            .unwrap()
            .iter()
            .map(|s| s.connections())
            .sum()
    }

    /// Number of registered servers
    pub fn len(&self) -> usize {
        self.servers.read().unwrap().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.servers.read().unwrap().is_empty()
    }

    /// Per-server snapshots in first-seen order
    pub fn snapshots(&self) -> Vec<ServerSnapshot> {
        let servers = self.servers.read().unwrap();
        let breakers = self.breakers.read().unwrap();
        servers
            .iter()
            .map(|s| {
                let breaker = breakers.get(&s.id);
                ServerSnapshot {
                    id: s.id.clone(),
                    host: s.host.clone(),
                    port: s.port,
                    weight: s.weight(),
                    region: s.region(),
                    group: s.group(),
                    healthy: s.is_healthy(),
                    connections: s.connections(),
                    total_requests: s.total_requests(),
                    total_errors: s.total_errors(),
                    avg_response_ms: s.avg_response_ms(),
                    circuit_state: breaker
                        .map(|b| b.state().to_string())
                        .unwrap_or_else(|| "closed".to_string()),
                    consecutive_failures: breaker
                        .map(|b| b.consecutive_failures())
                        .unwrap_or(0),
                }
            })
            .collect()
    }
}
