//! Per-call cancellation and deadlines for catalog operations.

use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Carries the cancellation signal and optional deadline of one request.
///
/// Cloning shares the token, so cancelling any clone cancels them all.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives a context from a parent token, e.g. the server shutdown token.
    /// Cancelling the parent cancels this context, not the other way around.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            deadline: None,
        }
    }

    /// Sets the deadline `timeout` from now, keeping an earlier one.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|at| Instant::now() >= at)
    }

    /// Resolves once the token is cancelled or the deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(at) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = sleep_until(at) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}
