//! Admission control — bounded request queue with timeout-based rejection
//!
//! When aggregate connections exceed the configured fraction of estimated
//! capacity, new requests wait in a bounded queue instead of dispatching.
//! A periodic dispatcher admits waiters up to the capacity freed each
//! tick; a second periodic pass expires overdue items. Every queued item
//! leaves exactly one way — dispatch or timeout — so queue length always
//! returns to baseline.

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::{BalancerError, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::oneshot;

/// Completion handle held by a waiting caller
pub type AdmissionTicket = oneshot::Receiver<Result<()>>;

struct QueueItem {
    enqueued_at: Instant,
    timeout_at: Instant,
    permit: oneshot::Sender<Result<()>>,
}

/// Backpressure gate in front of selection
pub struct AdmissionController {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    queue: Mutex<VecDeque<QueueItem>>,
}

impl AdmissionController {
    /// Create a controller with the given config and clock
    pub fn new(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Estimated aggregate capacity for `server_count` servers
    pub fn estimated_capacity(&self, server_count: usize) -> usize {
        server_count * self.config.server_capacity
    }

    /// Whether a new request must queue given current load
    pub fn over_threshold(&self, total_connections: usize, server_count: usize) -> bool {
        if !self.config.enabled {
            return false;
        }
        let capacity = self.estimated_capacity(server_count);
        total_connections as f64 > capacity as f64 * self.config.threshold
    }

    /// Dispatch slots currently free under the admission threshold
    pub fn free_slots(&self, total_connections: usize, server_count: usize) -> usize {
        let limit = (self.estimated_capacity(server_count) as f64 * self.config.threshold) as usize;
        limit.saturating_sub(total_connections)
    }

    /// Queue a request; the returned ticket resolves on dispatch or fails
    /// on timeout. Immediately fails with `RequestQueueFull` at capacity.
    pub fn enqueue(&self) -> Result<AdmissionTicket> {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.config.max_queue_size {
            tracing::warn!(capacity = self.config.max_queue_size, "request queue full");
            return Err(BalancerError::RequestQueueFull(self.config.max_queue_size));
        }
        let now = self.clock.now();
        let (tx, rx) = oneshot::channel();
        queue.push_back(QueueItem {
            enqueued_at: now,
            timeout_at: now + self.config.timeout(),
            permit: tx,
        });
        Ok(rx)
    }

    /// Admit up to `slots` waiters in FIFO order; returns how many were
    /// released. Called by the periodic dispatcher.
    pub fn dispatch_ready(&self, slots: usize) -> usize {
        let mut released = Vec::new();
        {
            let mut queue = self.queue.lock().unwrap();
            for _ in 0..slots {
                match queue.pop_front() {
                    Some(item) => released.push(item),
                    None => break,
                }
            }
        }
        let count = released.len();
        for item in released {
            // Receiver may have been dropped by a cancelled caller
            let _ = item.permit.send(Ok(()));
        }
        if count > 0 {
            tracing::debug!(count, "dispatched queued requests");
        }
        count
    }

    /// Reject and remove every item past its deadline; returns the count
    pub fn expire_overdue(&self) -> usize {
        let now = self.clock.now();
        let mut expired = Vec::new();
        {
            let mut queue = self.queue.lock().unwrap();
            let mut remaining = VecDeque::with_capacity(queue.len());
            while let Some(item) = queue.pop_front() {
                if now >= item.timeout_at {
                    expired.push(item);
                } else {
                    remaining.push_back(item);
                }
            }
            *queue = remaining;
        }
        let count = expired.len();
        for item in expired {
            let waited = item
                .timeout_at
                .saturating_duration_since(item.enqueued_at)
                .as_millis() as u64;
            let _ = item.permit.send(Err(BalancerError::RequestTimeout(waited)));
        }
        if count > 0 {
            tracing::warn!(count, "expired queued requests");
        }
        count
    }

    /// Current queue depth
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn controller(max: usize, timeout_ms: u64) -> (AdmissionController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let config = QueueConfig {
            enabled: true,
            max_queue_size: max,
            timeout_ms,
            server_capacity: 10,
            threshold: 0.8,
            dispatch_interval_ms: 100,
        };
        (AdmissionController::new(config, clock.clone()), clock)
    }

    // --- Threshold ---

    #[test]
    fn test_over_threshold() {
        let (ctrl, _) = controller(10, 1_000);
        // 2 servers × 10 capacity × 0.8 = 16
        assert!(!ctrl.over_threshold(16, 2));
        assert!(ctrl.over_threshold(17, 2));
    }

    #[test]
    fn test_threshold_with_no_servers() {
        let (ctrl, _) = controller(10, 1_000);
        assert!(!ctrl.over_threshold(0, 0));
    }

    #[test]
    fn test_disabled_never_queues() {
        let clock = Arc::new(ManualClock::new());
        let ctrl = AdmissionController::new(QueueConfig::default(), clock);
        assert!(!ctrl.over_threshold(10_000, 1));
    }

    #[test]
    fn test_free_slots() {
        let (ctrl, _) = controller(10, 1_000);
        assert_eq!(ctrl.free_slots(10, 2), 6);
        assert_eq!(ctrl.free_slots(20, 2), 0);
    }

    // --- Bounded enqueue ---

    #[test]
    fn test_enqueue_respects_bound() {
        let (ctrl, _) = controller(2, 1_000);
        let _a = ctrl.enqueue().unwrap();
        let _b = ctrl.enqueue().unwrap();
        let err = ctrl.enqueue().unwrap_err();
        assert!(matches!(err, BalancerError::RequestQueueFull(2)));
        assert_eq!(ctrl.len(), 2);
    }

    // --- Dispatch ---

    #[tokio::test]
    async fn test_dispatch_releases_fifo() {
        let (ctrl, _) = controller(10, 1_000);
        let a = ctrl.enqueue().unwrap();
        let b = ctrl.enqueue().unwrap();
        let _c = ctrl.enqueue().unwrap();

        assert_eq!(ctrl.dispatch_ready(2), 2);
        assert_eq!(ctrl.len(), 1);
        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
    }

    #[test]
    fn test_dispatch_with_empty_queue() {
        let (ctrl, _) = controller(10, 1_000);
        assert_eq!(ctrl.dispatch_ready(5), 0);
    }

    #[tokio::test]
    async fn test_dispatch_survives_cancelled_caller() {
        let (ctrl, _) = controller(10, 1_000);
        let ticket = ctrl.enqueue().unwrap();
        drop(ticket);
        // Must not panic on the dropped receiver
        assert_eq!(ctrl.dispatch_ready(1), 1);
        assert!(ctrl.is_empty());
    }

    // --- Expiry ---

    #[tokio::test]
    async fn test_expiry_rejects_and_restores_baseline() {
        let (ctrl, clock) = controller(10, 500);
        let baseline = ctrl.len();
        let ticket = ctrl.enqueue().unwrap();
        assert_eq!(ctrl.len(), baseline + 1);

        clock.advance(Duration::from_millis(500));
        assert_eq!(ctrl.expire_overdue(), 1);
        assert_eq!(ctrl.len(), baseline);

        let outcome = ticket.await.unwrap();
        assert!(matches!(outcome, Err(BalancerError::RequestTimeout(_))));
    }

    #[tokio::test]
    async fn test_expiry_keeps_fresh_items() {
        let (ctrl, clock) = controller(10, 500);
        let _old = ctrl.enqueue().unwrap();
        clock.advance(Duration::from_millis(300));
        let _fresh = ctrl.enqueue().unwrap();
        clock.advance(Duration::from_millis(200));

        assert_eq!(ctrl.expire_overdue(), 1);
        assert_eq!(ctrl.len(), 1);
    }

    #[test]
    fn test_expiry_noop_before_deadline() {
        let (ctrl, clock) = controller(10, 1_000);
        let _ticket = ctrl.enqueue().unwrap();
        clock.advance(Duration::from_millis(999));
        assert_eq!(ctrl.expire_overdue(), 0);
        assert_eq!(ctrl.len(), 1);
    }
}
