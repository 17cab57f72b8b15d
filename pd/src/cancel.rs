//! Cooperative cancellation
//!
//! Every suspension point in the core (limiter acquisition, retry sleeps,
//! provider I/O waits) selects against a [`CancelToken`], so a cancelled
//! request settles within one provider-call timeout.

use tokio::sync::watch;

/// Owner side of a cancellation pair
///
/// Cloneable; `cancel` is idempotent.
#[derive(Clone)]
pub struct CancelHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // Repeated sends are harmless; watch keeps only the latest value
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
            _keep_alive: None,
        }
    }
}

/// Observer side of a cancellation pair
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    // Present only on never() tokens so the channel stays open
    _keep_alive: Option<std::sync::Arc<watch::Sender<bool>>>,
}

impl CancelToken {
    /// A token that is never cancelled
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keep_alive: Some(std::sync::Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation fires; never resolves otherwise
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without cancelling - stay pending so
                // select! arms fall through to the real work
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a linked handle/token pair
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    let handle = CancelHandle {
        tx: std::sync::Arc::new(tx),
    };
    let token = CancelToken { rx, _keep_alive: None };
    (handle, token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_fires() {
        let (handle, token) = cancel_pair();
        assert!(!token.is_cancelled());

        handle.cancel();
        assert!(token.is_cancelled());

        // Resolves immediately once cancelled
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_idempotent() {
        let (handle, token) = cancel_pair();
        handle.cancel();
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_never_token_stays_pending() {
        let token = CancelToken::never();
        let result = tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(result.is_err());
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_clone_observes_cancel() {
        let (handle, token) = cancel_pair();
        let cloned = token.clone();
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), cloned.cancelled())
            .await
            .unwrap();
    }
}
