//! Teardown coordination using CancellationToken
//!
//! Every background task of a billing session holds a child token of one
//! root. Cancelling the root stops the connection driver, the purchase
//! processor and any outstanding catalog or restoration fan-out.

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owner of the root cancellation token of a billing session
#[derive(Clone, Debug)]
pub struct ShutdownController {
    token: CancellationToken,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Controller that also cancels on Ctrl+C
    pub fn with_ctrl_c() -> Self {
        let controller = Self::new();
        let token = controller.token.clone();

        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, shutting down billing session");
                    token.cancel();
                }
                Err(e) => {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
            }
        });

        controller
    }

    /// Token cancelled together with this controller, or on its own
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }
}

/// Run a future until the token is cancelled
///
/// Returns `None` if cancellation won the race; the future is dropped.
pub async fn run_until_cancelled<F, T>(token: &CancellationToken, future: F) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        _ = token.cancelled() => None,
        result = future => Some(result),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_cancels_children() {
        let controller = ShutdownController::new();
        let session = controller.child_token();
        let fetch = session.child_token();

        session.cancel();
        assert!(fetch.is_cancelled());
        assert!(!controller.is_cancelled());

        let other = controller.child_token();
        controller.shutdown();
        assert!(other.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_cancelled() {
        let token = CancellationToken::new();
        assert_eq!(run_until_cancelled(&token, async { 7 }).await, Some(7));

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = run_until_cancelled(&token, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            7
        })
        .await;
        assert_eq!(result, None);
    }
}
