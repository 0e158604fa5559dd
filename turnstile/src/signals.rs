//! Shutdown signaling.
//!
//! Turnstile has exactly one phase transition: running, then shutting down.
//! Every long-running task holds a clone of [`Shutdown`] and races its work
//! against [`Shutdown::recv`]; the binaries translate ctrl-c into a single
//! [`Shutdown::signal`] call. The notice is a latched flag on a watch
//! channel, so handles cloned after the signal observe it too.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Broadcast-once shutdown notice.
#[derive(Debug, Clone)]
pub struct Shutdown {
    // Every handle keeps the sender alive, so any of them may signal and
    // `wait_for` below can never see a closed channel.
    notify: Arc<watch::Sender<bool>>,
    observed: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Create the root `Shutdown`. All participants should hold clones of
    /// the same instance.
    #[must_use]
    pub fn new() -> Self {
        let (notify, observed) = watch::channel(false);
        Self {
            notify: Arc::new(notify),
            observed,
        }
    }

    /// Wait for the shutdown notice. Returns immediately if it was already
    /// given.
    pub async fn recv(&mut self) {
        let _ = self.observed.wait_for(|signaled| *signaled).await;
    }

    /// Deliver the notice to every handle, current and future.
    pub fn signal(&self) {
        info!("signaling shutdown");
        self.notify.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_after_signal_returns_immediately() {
        let shutdown = Shutdown::new();
        let mut observer = shutdown.clone();
        shutdown.signal();
        observer.recv().await;
    }

    #[tokio::test]
    async fn signal_wakes_parked_receiver() {
        let shutdown = Shutdown::new();
        let mut observer = shutdown.clone();
        let waiter = tokio::spawn(async move { observer.recv().await });
        shutdown.signal();
        waiter.await.expect("receiver task panicked");
    }

    #[tokio::test]
    async fn handles_cloned_after_the_signal_observe_it() {
        let shutdown = Shutdown::new();
        shutdown.signal();
        let mut late = shutdown.clone();
        late.recv().await;
        // A second wait on the same handle is also satisfied.
        late.recv().await;
    }
}
