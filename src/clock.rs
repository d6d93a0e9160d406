//! Injectable clock and randomness — keeps breaker timeouts, probe
//! intervals and weighted selection deterministic under test.

use rand::Rng;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Monotonic time source
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;
}

/// Wall-clock backed `Clock`
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a manual clock starting at the current instant
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Advance the clock by `d`
    pub fn advance(&self, d: Duration) {
        let mut offset = self.offset.lock().unwrap();
        *offset += d;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap()
    }
}

/// Uniform random draws for weighted selection
pub trait RandomSource: Send + Sync {
    /// Uniform value in `[0, bound)`; `bound` must be > 0
    fn next_in(&self, bound: u64) -> u64;
}

/// `rand`-backed random source
#[derive(Debug, Clone, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_in(&self, bound: u64) -> u64 {
        rand::thread_rng().gen_range(0..bound)
    }
}

/// Deterministic sequence of draws for tests; cycles when exhausted
pub struct SequenceRandom {
    values: Vec<u64>,
    index: Mutex<usize>,
}

impl SequenceRandom {
    /// Create from a fixed sequence of draws
    pub fn new(values: Vec<u64>) -> Self {
        Self {
            values,
            index: Mutex::new(0),
        }
    }
}

impl RandomSource for SequenceRandom {
    fn next_in(&self, bound: u64) -> u64 {
        let mut index = self.index.lock().unwrap();
        let v = self.values[*index % self.values.len()];
        *index += 1;
        v % bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - start, Duration::from_secs(5));
    }

    #[test]
    fn test_thread_random_in_bounds() {
        let rng = ThreadRandom;
        for _ in 0..100 {
            assert!(rng.next_in(10) < 10);
        }
    }

    #[test]
    fn test_sequence_random_cycles() {
        let rng = SequenceRandom::new(vec![1, 2, 3]);
        assert_eq!(rng.next_in(100), 1);
        assert_eq!(rng.next_in(100), 2);
        assert_eq!(rng.next_in(100), 3);
        assert_eq!(rng.next_in(100), 1);
    }

    #[test]
    fn test_sequence_random_wraps_bound() {
        let rng = SequenceRandom::new(vec![15]);
        assert_eq!(rng.next_in(10), 5);
    }
}
