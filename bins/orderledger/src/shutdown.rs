//! Shutdown of the `start` command

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Process-wide stop signal
///
/// Order watchers hold child tokens, so they stop as soon as the process
/// does while still being cancellable one by one.
#[derive(Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    /// Shutdown that only fires through [`Shutdown::trigger`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shutdown that also fires on Ctrl+C, or SIGTERM on unix
    pub fn on_signal() -> Self {
        let shutdown = Self::new();
        let trigger = shutdown.clone();

        tokio::spawn(async move {
            let signal = next_signal().await;
            trigger.trigger(signal);
        });

        shutdown
    }

    /// Token for one order watcher
    pub fn watcher_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn trigger(&self, reason: &str) {
        if !self.token.is_cancelled() {
            info!(reason, "Shutting down");
            self.token.cancel();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn next_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => tokio::select! {
            _ = ctrl_c() => "ctrl-c",
            _ = term.recv() => "SIGTERM",
        },
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            ctrl_c().await;
            "ctrl-c"
        }
    }
}

#[cfg(not(unix))]
async fn next_signal() -> &'static str {
    ctrl_c().await;
    "ctrl-c"
}
