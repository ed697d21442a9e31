//! Runtime - graceful shutdown for the HTTP adapter.

use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info};

/// Shutdown signal broadcaster
#[derive(Clone)]
pub struct Shutdown {
    sender: broadcast::Sender<()>,
    triggered: Arc<RwLock<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self { Self::new() }
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender, triggered: Arc::new(RwLock::new(false)) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Idempotent.
    pub async fn trigger(&self) {
        let mut triggered = self.triggered.write().await;
        if !*triggered {
            *triggered = true;
            let _ = self.sender.send(());
        }
    }

    pub async fn is_triggered(&self) -> bool {
        *self.triggered.read().await
    }

    /// Resolves once `trigger` has been called, including before this call.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        if self.is_triggered().await {
            return;
        }
        let _ = rx.recv().await;
    }
}

/// Trigger `shutdown` on SIGINT / SIGTERM (Ctrl+C elsewhere).
pub fn install_signal_handlers() -> Shutdown {
    let shutdown = Shutdown::new();
    let handle = shutdown.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(term), Ok(int)) => (term, int),
                    (Err(e), _) | (_, Err(e)) => {
                        error!(error = %e, "cannot install signal handlers");
                        return;
                    }
                };

            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for Ctrl+C");
                return;
            }
            info!("received Ctrl+C");
        }

        handle.trigger().await;
    });

    shutdown
}
