//! Cancellation utilities
//!
//! A `CancelHandle` is the shared stop flag of one run. The registry keeps one
//! clone, the run driver another; cancelling from any task is visible to the
//! driver's next poll without any cooperation from the step producer.

use tokio_util::sync::CancellationToken;

/// A handle that can be used to request cancellation.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Create a new, not yet cancelled handle.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Request cancellation. Never blocks and never waits for the run to
    /// observe the request.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
