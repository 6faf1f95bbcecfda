//! Signal handling for graceful shutdown and configuration reload.
//!
//! SIGINT and SIGTERM cancel the shared [`ShutdownToken`]; SIGHUP is
//! forwarded as a reload request so the daemon can re-read its config file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

/// A token that can be shared across tasks to check for and await shutdown.
#[derive(Clone)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Check if shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Request cancellation on this token and wake every waiter.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a task that cancels `token` on SIGINT/SIGTERM and forwards SIGHUP
/// to `reload_tx`.
///
/// If signal handlers cannot be registered (e.g., in restricted environments),
/// the task logs a warning and the corresponding signal is ignored.
pub fn spawn_signal_handler(token: ShutdownToken, reload_tx: mpsc::Sender<()>) {
    tokio::spawn(async move {
        let (mut sigint, mut sigterm, mut sighup) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        ) {
            (Ok(int), Ok(term), Ok(hup)) => (int, term, hup),
            _ => {
                warn!("Failed to register signal handlers - graceful shutdown disabled");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown...");
                    token.cancel();
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown...");
                    token.cancel();
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading configuration");
                    // A reload already queued covers this one
                    let _ = reload_tx.try_send(());
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_shutdown_token() {
        let token = ShutdownToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_shutdown_token_clone() {
        let token1 = ShutdownToken::new();
        let token2 = token1.clone();

        token1.cancel();

        assert!(token1.is_cancelled());
        assert!(token2.is_cancelled());
    }

    #[test]
    fn test_multiple_cancels() {
        let token = ShutdownToken::new();
        token.cancel();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = ShutdownToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = ShutdownToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("should not block");
    }

    #[test]
    fn test_tokens_are_independent() {
        let cancelled = ShutdownToken::new();
        cancelled.cancel();

        let fresh = ShutdownToken::new();
        assert!(cancelled.is_cancelled());
        assert!(!fresh.is_cancelled());
    }
}
