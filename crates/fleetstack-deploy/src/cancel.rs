//! Operator abort

use fleetstack_core::{Result, StackError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Cancellation flag shared by every task of one deploy.
///
/// Once cancelled it stays cancelled.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSignal {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        if !self.sender.send_replace(true) {
            tracing::warn!("Deploy cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes once the signal is cancelled
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as any clone of the signal, so waiting
        // only fails if nobody can cancel anymore.
        let closed = receiver.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    /// Run `fut` unless the signal fires first; the future is dropped on abort
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(StackError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(StackError::Cancelled),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_guard_passes_result_through() {
        let signal = CancellationSignal::new();
        let value = signal.guard(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_pending_work() {
        let signal = CancellationSignal::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result: Result<()> = signal
            .guard(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await;
        assert_eq!(result.unwrap_err(), StackError::Cancelled);
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_never_starts() {
        let signal = CancellationSignal::new();
        signal.cancel();
        let started = std::sync::atomic::AtomicBool::new(false);
        let result = signal
            .guard(async {
                started.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(result.is_err());
        assert!(!started.load(std::sync::atomic::Ordering::SeqCst));
    }
}
