//! Gateway balancer — composes admission, affinity, selection, breaking
//! and recording into the per-request decision path
//!
//! The balancer is an explicitly constructed object: configuration and all
//! collaborators (forwarding transport, probe transport, clock, random
//! source) are injected, so every time- or randomness-dependent behavior
//! is deterministic under test. It owns no network I/O itself — the
//! injected [`Forwarder`] performs the actual call.

use crate::breaker::Transition;
use crate::clock::{Clock, RandomSource, SystemClock, ThreadRandom};
use crate::config::{Algorithm, BalancerConfig};
use crate::error::{BalancerError, Result};
use crate::events::{BalancerEvent, EventBus};
use crate::health::{HealthChecker, HealthProbe, HttpProbe};
use crate::metrics::{AggregateSnapshot, MetricsAggregator};
use crate::queue::AdmissionController;
use crate::registry::{Server, ServerPatch, ServerRegistry, ServerSnapshot, ServerSpec};
use crate::select;
use crate::session::SessionStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// An inbound request, reduced to the metadata selection needs
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Client IP, consumed by the ip-hash algorithm
    pub client_ip: Option<String>,
    /// Sticky session id, typically extracted from a cookie
    pub session_id: Option<String>,
    /// Client region, consumed by geographic routing
    pub region: Option<String>,
    /// Restrict selection to a server group
    pub group: Option<String>,
}

impl Request {
    /// Empty request
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the client IP
    pub fn client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    /// Set the session id
    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
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

/// What the forwarding collaborator returns
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    /// Status code
    pub status: u16,
    /// Response body
    pub body: Vec<u8>,
}

/// A completed response, annotated with routing metadata
#[derive(Debug, Clone)]
pub struct Response {
    /// Status code
    pub status: u16,
    /// Response body
    pub body: Vec<u8>,
    /// Which server handled the request
    pub server_id: String,
    /// Time spent in the forwarding call, in milliseconds
    pub latency_ms: u64,
    /// `Set-Cookie` value when a new sticky session was created
    pub session_cookie: Option<String>,
}

/// Forwarding transport, owned by the proxy collaborator
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Perform the actual call against the chosen server
    async fn forward(
        &self,
        server: &Server,
        request: &Request,
    ) -> std::result::Result<UpstreamResponse, String>;
}

/// Aggregate statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerStats {
    /// Registered servers
    pub servers: usize,
    /// Servers currently eligible for selection
    pub available_servers: usize,
    /// Queued requests
    pub queue_depth: usize,
    /// Live sticky sessions
    pub active_sessions: usize,
    /// Rolling counters and gauges
    pub metrics: AggregateSnapshot,
}

/// The gateway load balancer
pub struct GatewayBalancer {
    config: BalancerConfig,
    registry: Arc<ServerRegistry>,
    sessions: Arc<SessionStore>,
    metrics: Arc<MetricsAggregator>,
    admission: Arc<AdmissionController>,
    events: EventBus,
    forwarder: Arc<dyn Forwarder>,
    checker: Arc<HealthChecker>,
    clock: Arc<dyn Clock>,
    rng: Arc<dyn RandomSource>,
    rr_counter: AtomicUsize,
    probe_tasks: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl GatewayBalancer {
    /// Create a balancer with default clock, randomness and HTTP probe
    pub fn new(config: BalancerConfig, forwarder: Arc<dyn Forwarder>) -> Self {
        let probe = Arc::new(HttpProbe::new(&config.health_check));
        Self::with_collaborators(
            config,
            forwarder,
            probe,
            Arc::new(SystemClock),
            Arc::new(ThreadRandom),
        )
    }

    /// Create a balancer with every collaborator injected
    pub fn with_collaborators(
        config: BalancerConfig,
        forwarder: Arc<dyn Forwarder>,
        probe: Arc<dyn HealthProbe>,
        clock: Arc<dyn Clock>,
        rng: Arc<dyn RandomSource>,
    ) -> Self {
        let events = EventBus::new();
        let checker = Arc::new(HealthChecker::new(
            config.health_check.clone(),
            probe,
            clock.clone(),
            events.clone(),
        ));
        Self {
            registry: Arc::new(ServerRegistry::new(config.circuit_breaker.clone())),
            sessions: Arc::new(SessionStore::new(config.sticky_session.clone(), clock.clone())),
            metrics: Arc::new(MetricsAggregator::new()),
            admission: Arc::new(AdmissionController::new(config.queuing.clone(), clock.clone())),
            events,
            forwarder,
            checker,
            clock,
            rng,
            rr_counter: AtomicUsize::new(0),
            probe_tasks: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            config,
        }
    }

    /// Start the periodic background tasks: queue dispatcher, metrics
    /// tick and session sweep
    pub fn start(&self) {
        let mut background = self.background.lock().unwrap();

        if self.config.queuing.enabled {
            let admission = self.admission.clone();
            let registry = self.registry.clone();
            let interval = self.config.queuing.dispatch_interval();
            background.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    admission.expire_overdue();
                    let slots =
                        admission.free_slots(registry.total_connections(), registry.len());
                    if slots > 0 {
                        admission.dispatch_ready(slots);
                    }
                }
            }));
        }

        {
            let metrics = self.metrics.clone();
            let clock = self.clock.clone();
            let events = self.events.clone();
            background.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    metrics.tick(clock.now());
                    events.emit(BalancerEvent::MetricsUpdated);
                }
            }));
        }

        if self.config.sticky_session.enabled {
            let sessions = self.sessions.clone();
            let interval = (self.config.sticky_session.ttl() / 2).max(Duration::from_secs(1));
            background.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    sessions.sweep();
                }
            }));
        }
    }

    /// Subscribe to balancer events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BalancerEvent> {
        self.events.subscribe()
    }

    /// Register a server: creates its breaker and metrics entry and, when
    /// enabled, starts its periodic health probe. Fails fast on duplicate
    /// ids and weights below 1.
    pub fn add_server(&self, id: &str, spec: ServerSpec) -> Result<Arc<Server>> {
        let server = self.registry.insert(id, spec)?;
        self.metrics.register(id);

        if self.config.health_check.enabled {
            let checker = self.checker.clone();
            let probe_server = server.clone();
            let breaker = self
                .registry
                .breaker(id)
                .ok_or_else(|| BalancerError::UnknownServer(id.to_string()))?;
            let handle = tokio::spawn(async move {
                checker.run(probe_server, breaker).await;
            });
            self.probe_tasks
                .lock()
                .unwrap()
                .insert(id.to_string(), handle);
        }

        tracing::info!(server = id, "server added");
        self.events.emit(BalancerEvent::ServerAdded {
            server_id: id.to_string(),
        });
        Ok(server)
    }

    /// Remove a server: stops its probe and deletes breaker, metrics and
    /// session entries. In-flight requests complete against their
    /// captured reference.
    pub fn remove_server(&self, id: &str) -> bool {
        if let Some(handle) = self.probe_tasks.lock().unwrap().remove(id) {
            handle.abort();
        }
        let removed = self.registry.remove(id).is_some();
        if removed {
            self.metrics.remove(id);
            self.sessions.remove_server(id);
            tracing::info!(server = id, "server removed");
            self.events.emit(BalancerEvent::ServerRemoved {
                server_id: id.to_string(),
            });
        }
        removed
    }

    /// Apply a partial config update to a registered server
    pub fn update_server_config(&self, id: &str, patch: ServerPatch) -> Result<()> {
        let server = self
            .registry
            .get(id)
            .ok_or_else(|| BalancerError::UnknownServer(id.to_string()))?;
        if let Some(weight) = patch.weight {
            if weight < 1 {
                return Err(BalancerError::Config(format!(
                    "server '{}' weight {} must be >= 1",
                    id, weight
                )));
            }
            server.set_weight(weight);
        }
        if let Some(region) = patch.region {
            server.set_region(Some(region));
        }
        if let Some(group) = patch.group {
            server.set_group(Some(group));
        }
        Ok(())
    }

    /// Select the next server for a request without dispatching
    pub fn next_server(&self, request: &Request) -> Result<Arc<Server>> {
        self.choose(request, None)
    }

    /// Full request path: admission, selection, forwarding, recording,
    /// and exactly one failover re-selection on forwarding failure
    pub async fn process_request(&self, request: Request) -> Result<Response> {
        self.metrics.record_request();

        if self
            .admission
            .over_threshold(self.registry.total_connections(), self.registry.len())
        {
            let ticket = self.admission.enqueue()?;
            match ticket.await {
                Ok(Ok(())) => {} // admitted; load is re-checked implicitly by selection
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(BalancerError::RequestTimeout(self.config.queuing.timeout_ms))
                }
            }
        }

        let server = self.choose(&request, None)?;
        match self.dispatch(&server, &request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                tracing::warn!(server = server.id, error = %err, "forwarding failed, retrying once");
                let retry = self.choose(&request, Some(&server.id))?;
                self.dispatch(&retry, &request).await
            }
        }
    }

    /// Aggregate statistics snapshot
    pub fn stats(&self) -> BalancerStats {
        BalancerStats {
            servers: self.registry.len(),
            available_servers: self.registry.available(None).len(),
            queue_depth: self.admission.len(),
            active_sessions: self.sessions.len(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Per-server snapshots
    pub fn server_details(&self) -> Vec<ServerSnapshot> {
        self.registry.snapshots()
    }

    /// The server registry
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// The session store
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// The metrics aggregator
    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    /// Whether shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Cancel all periodic tasks. Idempotent; in-flight requests keep
    /// their captured server references.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("balancer shutting down");
        for (_, handle) in self.probe_tasks.lock().unwrap().drain() {
            handle.abort();
        }
        for handle in self.background.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    /// Selection core shared by `next_server` and the failover retry.
    ///
    /// A valid sticky session overrides the algorithm when its server is
    /// still in the candidate set; otherwise a fresh choice is made and
    /// the session re-recorded.
    fn choose(&self, request: &Request, exclude: Option<&str>) -> Result<Arc<Server>> {
        let mut candidates = self.registry.available(request.group.as_deref());
        if let Some(exclude) = exclude {
            candidates.retain(|s| s.id != exclude);
        }

        let sticky = self.config.sticky_session.enabled;
        if sticky {
            if let Some(session_id) = request.session_id.as_deref() {
                if let Some(server_id) = self.sessions.lookup(session_id) {
                    if let Some(server) = candidates.iter().find(|s| s.id == server_id) {
                        return Ok(server.clone());
                    }
                    // Bound server gone or ineligible; drop the stale binding
                    self.sessions.unbind(session_id);
                }
            }
        }

        if candidates.is_empty() {
            return Err(BalancerError::NoAvailableServers(request.group.clone()));
        }

        let chosen = match self.config.algorithm {
            Algorithm::RoundRobin => {
                let counter = self.rr_counter.fetch_add(1, Ordering::Relaxed);
                select::round_robin(&candidates, counter)
            }
            Algorithm::LeastConnections => select::least_connections(&candidates),
            Algorithm::Weighted => select::weighted(&candidates, self.rng.as_ref()),
            Algorithm::IpHash => {
                let ip = request.client_ip.as_deref().unwrap_or("");
                select::ip_hash(&candidates, ip)
            }
            Algorithm::HealthBased => select::health_based(&candidates, &self.metrics),
            Algorithm::Geographic => {
                // Region preference only applies when geographic routing
                // is switched on; otherwise degrade to least connections
                let region = if self.config.geographic.enabled {
                    request.region.as_deref()
                } else {
                    None
                };
                select::geographic(&candidates, region)
            }
        }
        .ok_or_else(|| BalancerError::NoAvailableServers(request.group.clone()))?;

        if sticky {
            if let Some(session_id) = request.session_id.as_deref() {
                self.sessions.bind(session_id, &chosen.id);
            }
        }

        Ok(chosen)
    }

    /// Forward to one server and record the outcome into metrics, breaker
    /// and connection counters
    async fn dispatch(&self, server: &Arc<Server>, request: &Request) -> Result<Response> {
        if let Some(breaker) = self.registry.breaker(&server.id) {
            if !breaker.admit(self.clock.now()) {
                return Err(BalancerError::Forwarding {
                    server_id: server.id.clone(),
                    reason: "circuit breaker rejected the trial call".to_string(),
                });
            }
        }

        server.acquire_connection();
        let started = self.clock.now();
        let outcome = self.forwarder.forward(server, request).await;
        let latency_ms = self.clock.now().saturating_duration_since(started).as_millis() as u64;
        server.release_connection();

        let now = self.clock.now();
        match outcome {
            Ok(upstream) => {
                server.record_request(false);
                self.metrics.record_response(&server.id, latency_ms, false);
                if let Some(stats) = self.metrics.server_metrics(&server.id) {
                    server.set_avg_response_ms(stats.avg_response_ms as u64);
                }
                if let Some(breaker) = self.registry.breaker(&server.id) {
                    if breaker.record_success(now) == Some(Transition::Closed) {
                        self.events.emit(BalancerEvent::CircuitBreakerClosed {
                            server_id: server.id.clone(),
                        });
                    }
                }

                let session_cookie = self.new_session_cookie(request, &server.id);
                Ok(Response {
                    status: upstream.status,
                    body: upstream.body,
                    server_id: server.id.clone(),
                    latency_ms,
                    session_cookie,
                })
            }
            Err(reason) => {
                server.record_request(true);
                self.metrics.record_response(&server.id, latency_ms, true);
                if let Some(breaker) = self.registry.breaker(&server.id) {
                    if breaker.record_failure(now) == Some(Transition::Opened) {
                        self.events.emit(BalancerEvent::CircuitBreakerOpened {
                            server_id: server.id.clone(),
                        });
                    }
                }
                Err(BalancerError::Forwarding {
                    server_id: server.id.clone(),
                    reason,
                })
            }
        }
    }

    /// Mint a sticky session for cookie-less clients on successful dispatch
    fn new_session_cookie(&self, request: &Request, server_id: &str) -> Option<String> {
        if !self.config.sticky_session.enabled || request.session_id.is_some() {
            return None;
        }
        let session_id = self.sessions.generate_id();
        self.sessions.bind(&session_id, server_id);
        Some(self.sessions.build_cookie(&session_id))
    }
}

impl Drop for GatewayBalancer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
