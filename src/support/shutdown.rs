//! Process shutdown signaling
//!
//! One watch channel fans the "stop now" decision out to the listener and
//! every session loop. The flag is level-triggered: a waiter that shows up
//! after the trigger resolves immediately, so sessions created mid-shutdown
//! still wind down instead of hanging on a missed edge.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

/// Cloneable handle on the process-wide stop flag.
#[derive(Clone)]
pub struct ShutdownSignal {
    state: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Set the stop flag. Idempotent; every `triggered()` waiter wakes.
    pub fn trigger(&self) {
        let flipped = self.state.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });
        if flipped {
            info!("shutdown started");
        }
    }

    /// Resolves once the stop flag is set; immediately when it already is.
    pub async fn triggered(&self) {
        let mut observer = self.state.subscribe();
        let _ = observer.wait_for(|stopped| *stopped).await;
    }

    /// Tie this signal to the process: the first SIGTERM or SIGINT
    /// (Ctrl+C off unix) starts the shutdown sequence.
    pub fn listen_to_os_signals(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            match wait_for_os_signal().await {
                Ok(name) => {
                    info!(signal = name, "shutdown requested by OS signal");
                    shutdown.trigger();
                }
                Err(e) => error!(error = %e, "cannot install OS signal handlers"),
            }
        });
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_os_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

#[cfg(not(unix))]
async fn wait_for_os_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_wakes_waiters() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.triggered().await })
        };
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn late_waiter_resolves_immediately() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), signal.triggered())
            .await
            .expect("late waiter not woken");
    }

    #[tokio::test]
    async fn trigger_is_idempotent() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), signal.triggered())
            .await
            .expect("waiter not woken");
    }
}
