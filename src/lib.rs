//! # edge-balancer
//!
//! A gateway load balancer: server registry with health state and circuit
//! breakers, pluggable selection algorithms, sticky sessions, admission
//! control with a bounded request queue, and rolling metrics.
//!
//! The [`GatewayBalancer`] is the composition root. Forwarding, health
//! probing, time and randomness are injected collaborators, so the whole
//! decision path is deterministic under test.
//!
//! ```no_run
//! use edge_balancer::{BalancerConfig, Forwarder, GatewayBalancer, Request, ServerSpec, UpstreamResponse};
//! use edge_balancer::registry::Server;
//! use std::sync::Arc;
//!
//! struct HttpForwarder;
//!
//! #[async_trait::async_trait]
//! impl Forwarder for HttpForwarder {
//!     async fn forward(
//!         &self,
//!         server: &Server,
//!         _request: &Request,
//!     ) -> Result<UpstreamResponse, String> {
//!         let resp = reqwest::get(server.url()).await.map_err(|e| e.to_string())?;
//!         Ok(UpstreamResponse {
//!             status: resp.status().as_u16(),
//!             body: resp.bytes().await.map_err(|e| e.to_string())?.to_vec(),
//!         })
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let balancer = GatewayBalancer::new(BalancerConfig::default(), Arc::new(HttpForwarder));
//! balancer.start();
//! balancer.add_server("s1", ServerSpec::new("10.0.0.1", 8080))?;
//! let response = balancer.process_request(Request::new()).await?;
//! println!("{} from {}", response.status, response.server_id);
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod select;
pub mod session;

pub use balancer::{BalancerStats, Forwarder, GatewayBalancer, Request, Response, UpstreamResponse};
pub use breaker::{CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, RandomSource, SequenceRandom, SystemClock, ThreadRandom};
pub use config::{Algorithm, BalancerConfig};
pub use error::{BalancerError, Result};
pub use events::{BalancerEvent, EventBus};
pub use health::{HealthChecker, HealthProbe, HttpProbe};
pub use registry::{Server, ServerPatch, ServerRegistry, ServerSnapshot, ServerSpec};
