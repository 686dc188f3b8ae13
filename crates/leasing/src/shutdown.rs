use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Process-wide shutdown signal carrying the first reason given.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<Option<String>>>,
    rx: watch::Receiver<Option<String>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Requests shutdown. Later reasons are ignored.
    pub fn trigger(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let first = self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.clone());
                true
            } else {
                false
            }
        });
        if first {
            info!(%reason, "Shutdown requested");
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Resolves once shutdown is requested, returning its reason.
    pub async fn wait(&self) -> String {
        let mut rx = self.rx.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "shutdown signal dropped".to_string();
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn waiters_see_the_first_reason() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.trigger("node lease lost");
        shutdown.trigger("second reason");

        assert_eq!(waiter.await.unwrap(), "node lease lost");
        assert!(shutdown.is_triggered());
        assert_eq!(shutdown.reason().as_deref(), Some("node lease lost"));
        assert_eq!(shutdown.wait().await, "node lease lost");
    }
}
