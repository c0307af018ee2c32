use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::AchievementError;

/// Deadline used when `now + timeout` does not fit in an [`Instant`].
const FAR_DEADLINE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Deadline and cancellation flag carried by one request.
///
/// The engine checks the scope before every store call, so once the flag is
/// raised or the deadline passes no further writes are issued.
#[derive(Debug, Clone)]
pub struct RequestScope {
    deadline: Instant,
    cancelled: Arc<AtomicBool>,
}

impl RequestScope {
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .or_else(|| now.checked_add(FAR_DEADLINE))
            .unwrap_or(now);
        Self {
            deadline,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle the transport layer keeps to cancel the request from outside.
    #[must_use]
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Fails closed when the request can no longer issue store calls.
    ///
    /// # Errors
    /// Returns [`AchievementError::StoreUnavailable`] when the request was
    /// cancelled or its deadline has elapsed.
    pub fn checkpoint(&self, operation: &str) -> Result<(), AchievementError> {
        if self.is_cancelled() {
            return Err(AchievementError::StoreUnavailable(format!(
                "{operation} aborted: request cancelled"
            )));
        }
        if Instant::now() >= self.deadline {
            return Err(AchievementError::StoreUnavailable(format!(
                "{operation} aborted: request deadline exceeded"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_fails_after_cancel() {
        let scope = RequestScope::with_timeout(Duration::from_secs(5));
        assert!(scope.checkpoint("insert").is_ok());

        scope.cancel_handle().store(true, Ordering::SeqCst);
        match scope.checkpoint("insert") {
            Err(AchievementError::StoreUnavailable(message)) => {
                assert!(message.contains("cancelled"));
            }
            other => panic!("expected store unavailable, got {other:?}"),
        }
    }

    #[test]
    fn huge_timeout_saturates_instead_of_overflowing() {
        let scope = RequestScope::with_timeout(Duration::MAX);
        assert!(scope.checkpoint("insert").is_ok());
        assert!(scope.remaining() > Duration::from_secs(60));
    }

    #[test]
    fn checkpoint_fails_after_deadline() {
        let scope = RequestScope::with_timeout(Duration::ZERO);
        assert!(matches!(
            scope.checkpoint("update"),
            Err(AchievementError::StoreUnavailable(_))
        ));
        assert_eq!(scope.remaining(), Duration::ZERO);
    }
}
