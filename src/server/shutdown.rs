//! Coordinated shutdown
//!
//! SIGTERM or SIGINT flips a watch channel. The controller stream, the leader
//! election loop and in-flight reconcile passes all observe the same signal.

use tokio::sync::watch;
use tracing::info;

/// Receiving side; clone it into every task that must stop
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown has been requested or the controller was dropped
    pub async fn wait(&mut self) {
        // a closed channel can never be flipped any more, treat it as stopped
        let _ = self.receiver.wait_for(|stopping| *stopping).await;
    }

    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

pub struct ShutdownController {
    sender: watch::Sender<bool>,
}

impl ShutdownController {
    /// Idempotent; only the first call is logged
    pub fn shutdown(&self) {
        if !self.sender.send_replace(true) {
            info!("Shutdown requested");
        }
    }
}

pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownController { sender }, ShutdownSignal { receiver })
}

/// Wait for SIGTERM or SIGINT and return its name
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(name)
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("CTRL_C")
}
