//! Health checker — periodic per-server probes over an injectable transport
//!
//! One task per server. A probe failure (wrong status, transport error or
//! timeout) is never fatal: it counts toward the `retries` threshold that
//! flips the server unhealthy. A single success flips it back, emits
//! `server_healthy` and reports to the breaker, closing an open circuit
//! once its recovery timeout has elapsed.

use crate::breaker::{CircuitBreaker, Transition};
use crate::clock::Clock;
use crate::config::HealthCheckConfig;
use crate::events::{BalancerEvent, EventBus};
use crate::registry::Server;
use async_trait::async_trait;
use std::sync::Arc;

/// Probe transport. The default performs an HTTP GET; tests and embedders
/// inject their own.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe the server, returning the observed status code
    async fn probe(&self, server: &Server) -> std::result::Result<u16, String>;
}

/// Default transport: HTTP GET to the configured path
pub struct HttpProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpProbe {
    /// Build a probe from the health check config
    pub fn new(config: &HealthCheckConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .unwrap_or_default();
        Self {
            client,
            path: config.path.clone(),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, server: &Server) -> std::result::Result<u16, String> {
        let url = format!("{}{}", server.url(), self.path);
        match self.client.get(&url).send().await {
            Ok(resp) => Ok(resp.status().as_u16()),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Per-server health check driver
pub struct HealthChecker {
    config: HealthCheckConfig,
    probe: Arc<dyn HealthProbe>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl HealthChecker {
    /// Create a checker sharing one probe transport across servers
    pub fn new(
        config: HealthCheckConfig,
        probe: Arc<dyn HealthProbe>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            probe,
            clock,
            events,
        }
    }

    /// Probe loop for one server; runs until the owning task is aborted
    pub async fn run(&self, server: Arc<Server>, breaker: Arc<CircuitBreaker>) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut consecutive_failures = 0u32;

        loop {
            interval.tick().await;
            let ok = self.probe_once(&server).await;
            self.apply_result(&server, &breaker, ok, &mut consecutive_failures);
        }
    }

    /// One probe attempt with its own timeout, errors folded into failure
    pub async fn probe_once(&self, server: &Server) -> bool {
        let outcome = tokio::time::timeout(self.config.timeout(), self.probe.probe(server)).await;
        match outcome {
            Ok(Ok(status)) => status == self.config.expected_status,
            Ok(Err(reason)) => {
                tracing::debug!(server = server.id, reason, "health probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(server = server.id, "health probe timed out");
                false
            }
        }
    }

    /// Fold one probe outcome into server and breaker state
    pub fn apply_result(
        &self,
        server: &Server,
        breaker: &CircuitBreaker,
        ok: bool,
        consecutive_failures: &mut u32,
    ) {
        let now = self.clock.now();
        server.set_last_health_check(now);

        if ok {
            *consecutive_failures = 0;
            let was_healthy = server.set_healthy(true);
            if !was_healthy {
                tracing::info!(server = server.id, "server recovered");
                self.events.emit(BalancerEvent::ServerHealthy {
                    server_id: server.id.clone(),
                });
            }
            match breaker.record_probe_success(now) {
                Some(Transition::Closed) => {
                    self.events.emit(BalancerEvent::CircuitBreakerClosed {
                        server_id: server.id.clone(),
                    });
                }
                Some(_) | None => {}
            }
        } else {
            *consecutive_failures += 1;
            if *consecutive_failures >= self.config.retries && server.is_healthy() {
                server.set_healthy(false);
                tracing::warn!(
                    server = server.id,
                    failures = *consecutive_failures,
                    "server marked unhealthy"
                );
                self.events.emit(BalancerEvent::ServerUnhealthy {
                    server_id: server.id.clone(),
                });
            }
        }
    }
}
