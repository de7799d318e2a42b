/// Shutdown signalling.
///
/// SIGINT (Ctrl-C) and SIGTERM both request a clean stop: the tailer
/// detaches the tracer and returns instead of being killed mid-write.
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

/// Fires the shutdown. Dropping it without firing leaves waiters pending.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Cloneable view of the shutdown state.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    pub fn new() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, Shutdown { rx })
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|stopped| *stopped).await.is_err() {
            // Trigger dropped without firing: never resolve.
            std::future::pending::<()>().await;
        }
    }
}

/// Install SIGINT/SIGTERM handlers that fire the returned `Shutdown`.
pub fn install() -> std::io::Result<Shutdown> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let (trigger, shutdown) = Shutdown::new();

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        tracing::info!(signal = name, "shutdown requested");
        trigger.trigger();
    });

    Ok(shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_resolves_after_trigger() {
        let (trigger, mut shutdown) = Shutdown::new();
        assert!(!shutdown.is_triggered());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });

        tokio::time::timeout(Duration::from_secs(2), shutdown.wait())
            .await
            .expect("shutdown should resolve");
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_clones_observe_trigger() {
        let (trigger, shutdown) = Shutdown::new();
        let mut clone = shutdown.clone();
        trigger.trigger();
        clone.wait().await;
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_dropped_trigger_never_resolves() {
        let (trigger, mut shutdown) = Shutdown::new();
        drop(trigger);
        let waited = tokio::time::timeout(Duration::from_millis(50), shutdown.wait()).await;
        assert!(waited.is_err());
        assert!(!shutdown.is_triggered());
    }
}
