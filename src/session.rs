//! Session affinity store — sticky session id → server mapping with TTL
//!
//! Bindings are stamped with a fixed expiry at bind time. An expired
//! binding is treated as absent on lookup and lazily deleted; a periodic
//! sweep garbage-collects the rest. A binding never implies the server is
//! healthy — availability is always re-checked by the caller.

use crate::clock::Clock;
use crate::config::StickySessionConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

struct SessionBinding {
    server_id: String,
    expires_at: Instant,
}

/// Sticky session store
pub struct SessionStore {
    config: StickySessionConfig,
    clock: Arc<dyn Clock>,
    sessions: RwLock<HashMap<String, SessionBinding>>,
}

impl SessionStore {
    /// Create a store with the given config and clock
    pub fn new(config: StickySessionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Cookie name used for affinity
    pub fn cookie_name(&self) -> &str {
        &self.config.cookie_name
    }

    /// Look up the bound server for a session id.
    ///
    /// An expired binding is removed and reported as absent.
    pub fn lookup(&self, session_id: &str) -> Option<String> {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().unwrap();
        match sessions.get(session_id) {
            Some(binding) if now < binding.expires_at => Some(binding.server_id.clone()),
            Some(_) => {
                sessions.remove(session_id);
                None
            }
            None => None,
        }
    }

    /// Bind a session to a server with a fresh TTL
    pub fn bind(&self, session_id: &str, server_id: &str) {
        let expires_at = self.clock.now() + self.config.ttl();
        let mut sessions = self.sessions.write().unwrap();
        sessions.insert(
            session_id.to_string(),
            SessionBinding {
                server_id: server_id.to_string(),
                expires_at,
            },
        );
    }

    /// Remove a single binding
    pub fn unbind(&self, session_id: &str) {
        self.sessions.write().unwrap().remove(session_id);
    }

    /// Purge all bindings pointing at a removed server; returns the count
    pub fn remove_server(&self, server_id: &str) -> usize {
        let mut sessions = self.sessions.write().unwrap();
        let before = sessions.len();
        sessions.retain(|_, b| b.server_id != server_id);
        before - sessions.len()
    }

    /// Drop all expired bindings; returns the count. Called by the
    /// periodic sweep task.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().unwrap();
        let before = sessions.len();
        sessions.retain(|_, b| now < b.expires_at);
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(removed, "swept expired sessions");
        }
        removed
    }

    /// Number of live bindings (including not-yet-swept expired ones)
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.read().unwrap().is_empty()
    }

    /// Generate a fresh session id
    pub fn generate_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Build a `Set-Cookie` header value for a session id
    pub fn build_cookie(&self, session_id: &str) -> String {
        format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            self.config.cookie_name,
            session_id,
            self.config.ttl().as_secs()
        )
    }

    /// Extract the session id from a `Cookie` header value
    pub fn extract_session_id<'a>(&self, cookie_header: &'a str) -> Option<&'a str> {
        let prefix = format!("{}=", self.config.cookie_name);
        for part in cookie_header.split(';') {
            let trimmed = part.trim();
            if let Some(value) = trimmed.strip_prefix(&prefix) {
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn store_with_clock(ttl_ms: u64) -> (SessionStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = SessionStore::new(
            StickySessionConfig {
                enabled: true,
                cookie_name: "lb_session".to_string(),
                ttl_ms,
            },
            clock.clone(),
        );
        (store, clock)
    }

    // --- Bind and lookup ---

    #[test]
    fn test_bind_and_lookup() {
        let (store, _) = store_with_clock(60_000);
        store.bind("sid-1", "s1");
        assert_eq!(store.lookup("sid-1"), Some("s1".to_string()));
        assert_eq!(store.lookup("missing"), None);
    }

    #[test]
    fn test_rebind_replaces_server() {
        let (store, _) = store_with_clock(60_000);
        store.bind("sid-1", "s1");
        store.bind("sid-1", "s2");
        assert_eq!(store.lookup("sid-1"), Some("s2".to_string()));
        assert_eq!(store.len(), 1);
    }

    // --- Expiry ---

    #[test]
    fn test_expired_binding_treated_as_absent_and_deleted() {
        let (store, clock) = store_with_clock(1_000);
        store.bind("sid-1", "s1");
        clock.advance(Duration::from_millis(1_000));
        assert_eq!(store.lookup("sid-1"), None);
        // Lazily deleted on lookup
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_binding_valid_just_before_expiry() {
        let (store, clock) = store_with_clock(1_000);
        store.bind("sid-1", "s1");
        clock.advance(Duration::from_millis(999));
        assert_eq!(store.lookup("sid-1"), Some("s1".to_string()));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let (store, clock) = store_with_clock(1_000);
        store.bind("old", "s1");
        clock.advance(Duration::from_millis(600));
        store.bind("new", "s2");
        clock.advance(Duration::from_millis(500));

        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup("new"), Some("s2".to_string()));
    }

    // --- Server removal purge ---

    #[test]
    fn test_remove_server_purges_bindings() {
        let (store, _) = store_with_clock(60_000);
        store.bind("a", "s1");
        store.bind("b", "s1");
        store.bind("c", "s2");
        assert_eq!(store.remove_server("s1"), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup("c"), Some("s2".to_string()));
    }

    // --- Unbind ---

    #[test]
    fn test_unbind() {
        let (store, _) = store_with_clock(60_000);
        store.bind("sid-1", "s1");
        store.unbind("sid-1");
        assert!(store.is_empty());
    }

    // --- Cookie helpers ---

    #[test]
    fn test_build_cookie() {
        let (store, _) = store_with_clock(60_000);
        let cookie = store.build_cookie("abc-123");
        assert!(cookie.contains("lb_session=abc-123"));
        assert!(cookie.contains("Max-Age=60"));
        assert!(cookie.contains("HttpOnly"));
    }

    #[test]
    fn test_extract_session_id() {
        let (store, _) = store_with_clock(60_000);
        assert_eq!(
            store.extract_session_id("lb_session=abc; other=x"),
            Some("abc")
        );
        assert_eq!(store.extract_session_id("other=x"), None);
        assert_eq!(store.extract_session_id("lb_session="), None);
    }

    #[test]
    fn test_generate_id_unique() {
        let (store, _) = store_with_clock(60_000);
        assert_ne!(store.generate_id(), store.generate_id());
    }
}
