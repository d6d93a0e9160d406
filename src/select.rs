//! Selection algorithms — pure functions over the available-server list
//!
//! Each function takes the candidate list in first-seen registry order and
//! whatever request metadata it needs. None of them mutate shared state;
//! the round-robin counter and random source are passed in so the caller
//! owns determinism.

use crate::clock::RandomSource;
use crate::metrics::MetricsAggregator;
use crate::registry::Server;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Round robin: monotone counter modulo list length
pub fn round_robin(candidates: &[Arc<Server>], counter: usize) -> Option<Arc<Server>> {
    if candidates.is_empty() {
        return None;
    }
    Some(candidates[counter % candidates.len()].clone())
}

/// Least connections; ties broken by first-seen order
pub fn least_connections(candidates: &[Arc<Server>]) -> Option<Arc<Server>> {
    candidates.iter().min_by_key(|s| s.connections()).cloned()
}

/// Weighted: cumulative-weight draw, converging to weight proportion
pub fn weighted(candidates: &[Arc<Server>], rng: &dyn RandomSource) -> Option<Arc<Server>> {
    if candidates.is_empty() {
        return None;
    }
    let total: u64 = candidates.iter().map(|s| u64::from(s.weight())).sum();
    if total == 0 {
        return candidates.first().cloned();
    }
    let mut remaining = rng.next_in(total);
    for server in candidates {
        let weight = u64::from(server.weight());
        if remaining < weight {
            return Some(server.clone());
        }
        remaining -= weight;
    }
    candidates.last().cloned()
}

/// IP hash: stable in-process hash of the client IP modulo list length.
///
/// Not consistent-hash-stable: adding or removing a server reshuffles the
/// mapping for most client IPs. Callers wanting rebalancing-minimal
/// affinity should layer a hash ring on top rather than rely on this.
pub fn ip_hash(candidates: &[Arc<Server>], client_ip: &str) -> Option<Arc<Server>> {
    if candidates.is_empty() {
        return None;
    }
    let mut hasher = DefaultHasher::new();
    client_ip.hash(&mut hasher);
    let idx = (hasher.finish() as usize) % candidates.len();
    Some(candidates[idx].clone())
}

/// Health-based: lowest composite score wins, ties to first seen.
///
/// Score = avg response time + error rate × 1000 + connections × 10; reads
/// exclusively from the metrics aggregator.
pub fn health_based(
    candidates: &[Arc<Server>],
    metrics: &MetricsAggregator,
) -> Option<Arc<Server>> {
    let mut best: Option<(&Arc<Server>, f64)> = None;
    for server in candidates {
        let stats = metrics.server_metrics(&server.id).unwrap_or_default();
        let score = stats.avg_response_ms
            + stats.error_rate * 1_000.0
            + server.connections() as f64 * 10.0;
        match best {
            Some((_, best_score)) if score >= best_score => {}
            _ => best = Some((server, score)),
        }
    }
    best.map(|(s, _)| s.clone())
}

/// Geographic: least-connections among servers in the request's region,
/// falling back to least-connections over all candidates when the region
/// subset is empty
pub fn geographic(candidates: &[Arc<Server>], region: Option<&str>) -> Option<Arc<Server>> {
    if let Some(region) = region {
        let local: Vec<Arc<Server>> = candidates
            .iter()
            .filter(|s| s.region().as_deref() == Some(region))
            .cloned()
            .collect();
        if !local.is_empty() {
            return least_connections(&local);
        }
    }
    least_connections(candidates)
}
