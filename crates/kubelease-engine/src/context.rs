//! Request context: caller cancellation plus a per-call time budget

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use kubelease_common::{Error, Result};

/// Default upper bound on a single remote call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for each rollback call, which runs outside the caller's context
pub const COMPENSATION_CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Cancellation and timeout context threaded through every remote call
#[derive(Clone, Debug)]
pub struct RequestContext {
    cancel: CancellationToken,
    call_timeout: Duration,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    /// A context that is never cancelled by a caller
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// A context cancelled when `cancel` is
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Override the per-call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Token observed by this context
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Per-call timeout
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Whether the caller has cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Context for rollback work
    ///
    /// Shares nothing with `self`: the caller's cancellation must not stop
    /// the cleanup of resources it caused to be created.
    pub fn detached(&self) -> Self {
        Self::new().with_call_timeout(COMPENSATION_CALL_TIMEOUT)
    }

    /// Run one remote call under this context
    ///
    /// Returns `Cancelled` if the caller cancels first, or the timed-out
    /// flavour if the call outlives the per-call budget.
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled(operation));
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(operation, "Remote call abandoned after cancellation");
                Err(Error::cancelled(operation))
            }
            result = tokio::time::timeout(self.call_timeout, fut) => match result {
                Ok(inner) => inner,
                Err(_) => {
                    debug!(operation, timeout = ?self.call_timeout, "Remote call timed out");
                    Err(Error::timed_out(operation))
                }
            },
        }
    }
}
