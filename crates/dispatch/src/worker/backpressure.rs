//! Backpressure between a producer and the dispatcher draining it
//!
//! The dispatcher raises the [`BackpressureFlag`] while its [`InFlightCounter`]
//! is saturated; producers poll the flag before pulling more work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Shared pause signal
///
/// Cloning yields another handle to the same flag. The lock is only held
/// for the read or write itself.
///
/// # Example
///
/// ```
/// use inventory_dispatch::worker::BackpressureFlag;
///
/// let flag = BackpressureFlag::new();
/// assert!(flag.pause());
/// assert!(!flag.pause());
/// assert!(flag.value());
/// assert!(flag.unpause());
/// ```
#[derive(Debug, Clone, Default)]
pub struct BackpressureFlag {
    paused: Arc<RwLock<bool>>,
}

impl BackpressureFlag {
    /// Create an unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag; returns whether it changed
    pub fn pause(&self) -> bool {
        let mut paused = self.paused.write();
        !std::mem::replace(&mut *paused, true)
    }

    /// Clear the flag; returns whether it changed
    pub fn unpause(&self) -> bool {
        let mut paused = self.paused.write();
        std::mem::replace(&mut *paused, false)
    }

    /// Whether producers should hold off
    pub fn value(&self) -> bool {
        *self.paused.read()
    }
}

/// Count of running handlers against a fixed ceiling
///
/// Reads are lock-free; comparisons against the ceiling are a throttle and
/// may be momentarily stale.
#[derive(Debug, Clone)]
pub struct InFlightCounter {
    current: Arc<AtomicUsize>,
    ceiling: usize,
}

impl InFlightCounter {
    /// Create a counter; a zero ceiling is raised to one
    pub fn new(ceiling: usize) -> Self {
        Self {
            current: Arc::new(AtomicUsize::new(0)),
            ceiling: ceiling.max(1),
        }
    }

    /// Record a started handler; returns the new count
    pub fn increment(&self) -> usize {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record a finished handler; never drops below zero
    pub fn decrement(&self) -> usize {
        let previous = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Whether the ceiling has been reached
    pub fn is_saturated(&self) -> bool {
        self.current() >= self.ceiling
    }

    /// Slots left below the ceiling
    pub fn available(&self) -> usize {
        self.ceiling.saturating_sub(self.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_starts_clear() {
        assert!(!BackpressureFlag::new().value());
    }

    #[test]
    fn test_flag_reports_changes() {
        let flag = BackpressureFlag::new();
        assert!(!flag.unpause());
        assert!(flag.pause());
        assert!(!flag.pause());
        assert!(flag.unpause());
        assert!(!flag.value());
    }

    #[test]
    fn test_flag_clones_share_state() {
        let flag = BackpressureFlag::new();
        let other = flag.clone();
        flag.pause();
        assert!(other.value());
    }

    #[test]
    fn test_counter_saturation() {
        let counter = InFlightCounter::new(3);
        assert_eq!(counter.available(), 3);

        for _ in 0..3 {
            counter.increment();
        }
        assert!(counter.is_saturated());
        assert_eq!(counter.available(), 0);

        counter.decrement();
        assert!(!counter.is_saturated());
        assert_eq!(counter.current(), 2);
    }

    #[test]
    fn test_counter_never_negative() {
        let counter = InFlightCounter::new(2);
        assert_eq!(counter.decrement(), 0);
        assert_eq!(counter.current(), 0);
    }

    #[test]
    fn test_zero_ceiling_is_raised() {
        assert_eq!(InFlightCounter::new(0).ceiling(), 1);
    }
}
