use crate::error::LogError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag, checked at phase boundaries.
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Checkpoint: returns `LogError::Cancelled` once cancellation was requested
    pub fn check(&self) -> Result<(), LogError> {
        if self.is_cancelled() {
            Err(LogError::Cancelled)
        } else {
            Ok(())
        }
    }
}
