//! Cooperative cancellation for workflow runs and their tasks.
//!
//! A [`CancellationTokenSource`] is owned by the engine for each run. Every
//! task of the run gets a [`ChildToken`], which observes the run-level
//! token and can also be cancelled on its own (`cancel_task`).
//!
//! Tokens are checked at suspension points: handler invocation, backoff
//! sleep and timeout races all `select!` on [`cancelled`](ChildToken::cancelled).
//!
//! # Example
//!
//! ```ignore
//! let source = CancellationTokenSource::new();
//! let child = source.child_token();
//!
//! tokio::select! {
//!     _ = child.cancelled() => return aborted(),
//!     out = handler.execute(&ctx) => out,
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Read-only view of a cancellation flag.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub(crate) fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Returns true once the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Completes when the token is cancelled.
    ///
    /// Returns immediately if it already is.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking the flag so a concurrent
            // `trigger` cannot slip between the check and the await.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    fn trigger(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Owner side of a run-level token.
#[derive(Clone, Debug)]
pub struct CancellationTokenSource {
    token: CancellationToken,
}

impl CancellationTokenSource {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token observing this source.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancels the run and every child token.
    pub fn cancel(&self) {
        self.token.trigger();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Creates a task-level token that is cancelled with this source or
    /// on its own.
    pub fn child_token(&self) -> ChildToken {
        ChildToken {
            parent: self.token.clone(),
            local: CancellationToken::new(),
        }
    }
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Task-level token.
///
/// Cancelling a child does not affect its parent or its siblings.
#[derive(Clone)]
pub struct ChildToken {
    parent: CancellationToken,
    local: CancellationToken,
}

impl ChildToken {
    /// A child of a source nobody else holds; only cancelled locally.
    pub fn detached() -> Self {
        CancellationTokenSource::new().child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.parent.is_cancelled() || self.local.is_cancelled()
    }

    /// Cancels this task only.
    pub fn cancel(&self) {
        self.local.trigger();
    }

    /// Completes when either this token or its parent is cancelled.
    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.parent.cancelled() => {}
            _ = self.local.cancelled() => {}
        }
    }
}

impl std::fmt::Debug for ChildToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildToken")
            .field("parent_cancelled", &self.parent.is_cancelled())
            .field("local_cancelled", &self.local.is_cancelled())
            .finish()
    }
}
