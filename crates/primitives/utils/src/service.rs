//! Scoped cancellation for apiary services.
//!
//! Every long-running task is handed a [`ServiceContext`]. Contexts form a
//! hierarchy: [`ServiceContext::child`] creates a local scope whose cancellation
//! does not affect the parent, while [`ServiceContext::cancel_global`] tears the
//! whole process down. Blocking waits must be raced against
//! [`ServiceContext::cancelled`] (or wrapped in
//! [`ServiceContext::run_until_cancelled`]) so that shutdown is always observable
//! within one poll interval.

use futures::Future;

#[derive(Clone)]
pub struct ServiceContext {
    token_global: tokio_util::sync::CancellationToken,
    token_local: Option<tokio_util::sync::CancellationToken>,
}

impl Default for ServiceContext {
    fn default() -> Self {
        Self { token_global: tokio_util::sync::CancellationToken::new(), token_local: None }
    }
}

impl ServiceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops every service sharing this context's global scope.
    pub fn cancel_global(&self) {
        tracing::info!("🔌 Gracefully shutting down");
        self.token_global.cancel();
    }

    /// Stops this service and its children without affecting the rest of the
    /// global scope.
    pub fn cancel_local(&self) {
        self.token_local.as_ref().unwrap_or(&self.token_global).cancel();
    }

    /// A future which completes when this service is cancelled, either locally
    /// or globally. Use it to race against other futures in a [`tokio::select`].
    pub async fn cancelled(&self) {
        let token_local = self.token_local.as_ref().unwrap_or(&self.token_global);
        tokio::select! {
            _ = self.token_global.cancelled() => {}
            _ = token_local.cancelled() => {}
        }
    }

    /// Synchronous check, for use in non-blocking scenarios only. Waiting on a
    /// blocking future should go through [`Self::cancelled`] instead.
    pub fn is_cancelled(&self) -> bool {
        self.token_global.is_cancelled()
            || self.token_local.as_ref().map(|t| t.is_cancelled()).unwrap_or(false)
    }

    /// Runs a future until this service is cancelled.
    ///
    /// The future must be cancel-safe: it may be interrupted at any suspension
    /// point. Returns the future's output in [`Some`], or [`None`] on
    /// cancellation.
    pub async fn run_until_cancelled<T, F>(&self, f: F) -> Option<T>
    where
        T: Sized + Send + Sync,
        F: Future<Output = T>,
    {
        tokio::select! {
            res = f => Some(res),
            _ = self.cancelled() => None
        }
    }

    /// Creates a new [`ServiceContext`] as a child of the current context.
    ///
    /// Services using the new context can cancel each other without affecting
    /// the rest of the global scope. A parent can always cancel its children;
    /// a child can never cancel its parent.
    pub fn child(&self) -> Self {
        let token_local = self.token_local.as_ref().unwrap_or(&self.token_global).child_token();
        Self { token_local: Some(token_local), ..Clone::clone(self) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn child_cancellation_stays_local() {
        let root = ServiceContext::new();
        let child = root.child();

        child.cancel_local();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn global_cancellation_reaches_children() {
        let root = ServiceContext::new();
        let child = root.child().child();

        root.cancel_global();
        assert!(child.is_cancelled());
        assert_eq!(child.run_until_cancelled(tokio::time::sleep(Duration::from_secs(5))).await, None);
    }
}
