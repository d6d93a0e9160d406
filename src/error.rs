//! Centralized error types for the balancer

use thiserror::Error;

/// Balancer error taxonomy
#[derive(Debug, Error)]
pub enum BalancerError {
    /// No eligible server in the requested group
    #[error("no available servers{}", group_suffix(.0))]
    NoAvailableServers(Option<String>),

    /// The admission queue is at capacity
    #[error("request queue full (capacity {0})")]
    RequestQueueFull(usize),

    /// A queued request exceeded its timeout before dispatch
    #[error("request timed out after {0}ms in queue")]
    RequestTimeout(u64),

    /// The forwarding collaborator failed
    #[error("forwarding to server '{server_id}' failed: {reason}")]
    Forwarding { server_id: String, reason: String },

    /// Invalid configuration rejected at registration time
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation referenced a server id that is not registered
    #[error("unknown server '{0}'")]
    UnknownServer(String),
}

fn group_suffix(group: &Option<String>) -> String {
    match group {
        Some(g) => format!(" in group '{}'", g),
        None => String::new(),
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, BalancerError>;
