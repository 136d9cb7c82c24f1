use std::sync::Mutex;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Owns a cancellation token and the background tasks that honour it.
///
/// Loops check the token at the top of each iteration, so `stop` never
/// interrupts a storage call halfway.
#[derive(Debug, Default)]
pub struct Shutdown {
    token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn track(&self, handle: JoinHandle<()>) {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Cancel and wait for every tracked task.
    pub async fn stop(&self) {
        self.token.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        debug!(tasks = handles.len(), "Waiting for background tasks to stop");
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_waits_for_tasks() {
        let shutdown = Shutdown::new();
        let token = shutdown.token();
        let (tx, rx) = tokio::sync::oneshot::channel();
        shutdown.track(tokio::spawn(async move {
            token.cancelled().await;
            let _ = tx.send(());
        }));

        shutdown.stop().await;
        assert!(shutdown.is_stopping());
        assert!(rx.await.is_ok());
    }
}
