//! Backpressure handling for write operations.
//!
//! Tracks frames queued for the writer task so that submitters slow down
//! when the socket cannot keep up, instead of growing the queue without
//! bound.
//!
//! # Configuration
//!
//! - `max_pending`: Maximum number of queued frames (default: 1024)
//! - Timeout: How long to wait when backpressure is active (default: 5s)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between backpressure checks.
const CHECK_INTERVAL: Duration = Duration::from_micros(100);

/// Shared counter of frames queued but not yet written.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl BackpressureController {
    /// Create a controller with a custom timeout.
    pub fn with_timeout(max_pending: usize, timeout: Duration) -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending,
            timeout,
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get current pending count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Try to reserve a slot without waiting.
    pub fn try_reserve(&self) -> Result<()> {
        if self.is_active() {
            return Err(Error::BackpressureTimeout);
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Reserve a slot, waiting up to the configured timeout.
    pub async fn reserve(&self) -> Result<()> {
        if self.try_reserve().is_ok() {
            return Ok(());
        }

        let start = Instant::now();
        loop {
            tokio::time::sleep(CHECK_INTERVAL).await;

            if self.try_reserve().is_ok() {
                return Ok(());
            }
            if start.elapsed() > self.timeout {
                tracing::warn!(
                    "Backpressure timeout: {} frames queued for {:?}",
                    self.pending_count(),
                    self.timeout
                );
                return Err(Error::BackpressureTimeout);
            }
        }
    }

    /// Release slots after frames were written.
    #[inline]
    pub fn release_many(&self, count: usize) {
        self.pending.fetch_sub(count, Ordering::Release);
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_MAX_PENDING, DEFAULT_TIMEOUT)
    }
}

/// Guard that releases a reserved slot on drop unless disarmed.
pub struct BackpressureGuard {
    controller: BackpressureController,
    armed: bool,
}

impl BackpressureGuard {
    pub fn new(controller: BackpressureController) -> Self {
        Self {
            controller,
            armed: true,
        }
    }

    /// Keep the slot reserved; the writer task releases it after writing.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for BackpressureGuard {
    fn drop(&mut self) {
        if self.armed {
            self.controller.release_many(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_default() {
        let ctrl = BackpressureController::default();
        assert_eq!(ctrl.pending_count(), 0);
        assert!(!ctrl.is_active());
    }

    #[test]
    fn test_try_reserve_at_capacity() {
        let ctrl = BackpressureController::with_timeout(5, DEFAULT_TIMEOUT);

        for _ in 0..5 {
            ctrl.try_reserve().unwrap();
        }
        assert!(ctrl.is_active());

        let result = ctrl.try_reserve();
        assert!(matches!(result, Err(Error::BackpressureTimeout)));
    }

    #[test]
    fn test_release_many() {
        let ctrl = BackpressureController::with_timeout(100, DEFAULT_TIMEOUT);

        for _ in 0..50 {
            ctrl.try_reserve().unwrap();
        }
        ctrl.release_many(30);
        assert_eq!(ctrl.pending_count(), 20);
    }

    #[test]
    fn test_clone_shares_state() {
        let ctrl1 = BackpressureController::with_timeout(10, DEFAULT_TIMEOUT);
        let ctrl2 = ctrl1.clone();

        ctrl1.try_reserve().unwrap();
        assert_eq!(ctrl2.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_reserve_timeout() {
        let ctrl = BackpressureController::with_timeout(1, Duration::from_millis(10));
        ctrl.try_reserve().unwrap();

        let start = Instant::now();
        let result = ctrl.reserve().await;

        assert!(matches!(result, Err(Error::BackpressureTimeout)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_reserve_wait_success() {
        let ctrl = BackpressureController::with_timeout(1, Duration::from_secs(1));
        ctrl.try_reserve().unwrap();

        let releaser = ctrl.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            releaser.release_many(1);
        });

        assert!(ctrl.reserve().await.is_ok());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let ctrl = BackpressureController::default();
        ctrl.try_reserve().unwrap();

        {
            let _guard = BackpressureGuard::new(ctrl.clone());
        }
        assert_eq!(ctrl.pending_count(), 0);
    }

    #[test]
    fn test_guard_disarm_keeps_slot() {
        let ctrl = BackpressureController::default();
        ctrl.try_reserve().unwrap();

        BackpressureGuard::new(ctrl.clone()).disarm();
        assert_eq!(ctrl.pending_count(), 1);
    }
}
