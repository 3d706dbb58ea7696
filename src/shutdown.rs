//! Hierarchical shutdown signal
//!
//! A [`ShutdownSignal`] fires when its own trigger fires or when any of its
//! ancestors fire. Dropping a trigger counts as firing it, so a task can
//! never outlive the owner that was supposed to stop it.

use futures_util::future::select_all;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::watch;

/// Fires the paired [`ShutdownSignal`] (and all of its children).
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receivers: Vec<watch::Receiver<bool>>,
}

/// Creates a root trigger/signal pair.
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { receivers: vec![rx] })
}

impl ShutdownSignal {
    /// A child signal that also fires when this one does.
    pub fn child(&self) -> (ShutdownTrigger, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        let mut receivers = self.receivers.clone();
        receivers.push(rx);
        (ShutdownTrigger { tx }, ShutdownSignal { receivers })
    }

    pub fn is_shutdown(&self) -> bool {
        self.receivers
            .iter()
            .any(|rx| *rx.borrow() || rx.has_changed().is_err())
    }

    /// Resolves once this signal or any ancestor fires.
    pub async fn recv(&self) {
        if self.is_shutdown() {
            return;
        }
        if self.receivers.is_empty() {
            return std::future::pending().await;
        }
        let waits: Vec<Pin<Box<dyn Future<Output = ()> + Send>>> = self
            .receivers
            .iter()
            .cloned()
            .map(|mut rx| {
                Box::pin(async move {
                    let _ = rx.wait_for(|fired| *fired).await;
                }) as Pin<Box<dyn Future<Output = ()> + Send>>
            })
            .collect();
        select_all(waits).await;
    }

    /// Sleeps for `duration` unless shut down first. Returns `false` when
    /// the sleep was cut short.
    pub async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.recv() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
