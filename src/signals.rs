/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) or SIGTERM flips a shared flag. An in-progress watch
/// observes it through [`ShutdownSignal::cancelled`] and aborts with
/// `Interrupted`; the batch loop checks it before starting the next file.
use tokio::sync::watch;

/// Cloneable view of the shutdown flag.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Sending half, used by the signal listener (and tests).
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl ShutdownSignal {
    /// A trigger/signal pair not wired to any OS signal.
    pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, ShutdownSignal { rx })
    }

    /// Install listeners for SIGINT and SIGTERM.
    pub fn install() -> std::io::Result<ShutdownSignal> {
        let (trigger, signal) = Self::channel();

        #[cfg(unix)]
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        tokio::spawn(async move {
            #[cfg(unix)]
            let which = tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            };
            #[cfg(not(unix))]
            let which = {
                let _ = tokio::signal::ctrl_c().await;
                "Ctrl-C"
            };
            tracing::warn!(signal = which, "shutdown requested");
            trigger.trigger();
        });

        Ok(signal)
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested. Never resolves if the trigger
    /// is dropped without firing.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|triggered| *triggered).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancelled_resolves_after_trigger() {
        let (trigger, signal) = ShutdownSignal::channel();
        assert!(!signal.is_triggered());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled() should resolve")
            .unwrap();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_if_already_triggered() {
        let (trigger, signal) = ShutdownSignal::channel();
        trigger.trigger();
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("already triggered");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trigger_never_cancels() {
        let (trigger, signal) = ShutdownSignal::channel();
        drop(trigger);
        let result = tokio::time::timeout(Duration::from_secs(60), signal.cancelled()).await;
        assert!(result.is_err());
        assert!(!signal.is_triggered());
    }
}
