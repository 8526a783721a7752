//! Shutdown latch and termination signal handling.
//!
//! The latch is a one-way flag: once a shutdown has been requested it stays
//! requested for the rest of the process. SIGINT and SIGTERM both set it.

use std::io;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Process-wide shutdown flag.
///
/// Readers either poll [`SignalLatch::is_shutting_down`] or await
/// [`SignalLatch::wait`]. The sender half is owned here, so the channel
/// never closes while the latch is alive.
#[derive(Debug)]
pub struct SignalLatch {
    tx: watch::Sender<bool>,
}

impl SignalLatch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Set the latch. Returns `true` for the call that actually set it.
    pub fn request_shutdown(&self) -> bool {
        self.tx.send_if_modified(|set| {
            if *set {
                false
            } else {
                *set = true;
                true
            }
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the latch is set. Cancel-safe.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for SignalLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Register SIGINT/SIGTERM handlers that set `latch`.
///
/// Registration happens before this returns, so a failure here is a startup
/// error. The spawned task runs for the lifetime of the runtime.
pub fn listen(latch: Arc<SignalLatch>) -> io::Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                received = interrupt.recv() => match received {
                    Some(()) => "SIGINT",
                    None => break,
                },
                received = terminate.recv() => match received {
                    Some(()) => "SIGTERM",
                    None => break,
                },
            };

            if latch.request_shutdown() {
                info!(signal = name, "Shutdown requested");
            } else {
                debug!(signal = name, "Shutdown already requested");
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_latch_starts_unset() {
        let latch = SignalLatch::new();
        assert!(!latch.is_shutting_down());
    }

    #[test]
    fn test_request_is_idempotent() {
        let latch = SignalLatch::new();
        assert!(latch.request_shutdown());
        assert!(latch.is_shutting_down());

        assert!(!latch.request_shutdown());
        assert!(!latch.request_shutdown());
        assert!(latch.is_shutting_down());
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_set() {
        let latch = SignalLatch::new();
        latch.request_shutdown();
        tokio_test::assert_ok!(tokio::time::timeout(Duration::from_millis(100), latch.wait()).await);
    }

    #[tokio::test]
    async fn test_wait_blocks_until_set() {
        let latch = Arc::new(SignalLatch::new());

        let pending = tokio::time::timeout(Duration::from_millis(50), latch.wait()).await;
        assert!(pending.is_err());

        let setter = Arc::clone(&latch);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            setter.request_shutdown();
        });

        tokio_test::assert_ok!(tokio::time::timeout(Duration::from_secs(2), latch.wait()).await);
        assert!(latch.is_shutting_down());
    }

    #[tokio::test]
    async fn test_multiple_waiters_all_released() {
        let latch = Arc::new(SignalLatch::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let latch = Arc::clone(&latch);
                tokio::spawn(async move { latch.wait().await })
            })
            .collect();

        tokio::task::yield_now().await;
        latch.request_shutdown();

        for waiter in waiters {
            let joined = tokio::time::timeout(Duration::from_secs(2), waiter).await;
            tokio_test::assert_ok!(tokio_test::assert_ok!(joined));
        }
    }

    async fn send_to_self(signal: &str) {
        let status = tokio::process::Command::new("kill")
            .arg(format!("-{signal}"))
            .arg(std::process::id().to_string())
            .status()
            .await
            .unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_sigterm_and_sigint_set_latch() {
        for name in ["TERM", "INT"] {
            let latch = Arc::new(SignalLatch::new());
            let _signals = listen(Arc::clone(&latch)).unwrap();
            assert!(!latch.is_shutting_down());

            send_to_self(name).await;

            let waited = tokio::time::timeout(Duration::from_secs(5), latch.wait()).await;
            assert!(waited.is_ok(), "SIG{name} did not set the latch");
            assert!(latch.is_shutting_down());
        }
    }
}
