//! Audio device topology change detection.
//!
//! [`DeviceWatcher`] polls the default CPAL input and output devices and
//! emits a [`DeviceChange`] when either changes, appears, or disappears.
//! The conversation engine reinitializes its streams on the next operation;
//! a change mid-recording surfaces as a `device_changed` error.
//!
//! Polling is used because CPAL's cross-platform API exposes no change
//! notifications. A 2 s interval is cheap and sufficient.

use cpal::traits::{DeviceTrait, HostTrait};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Snapshot of the default device names after a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChange {
    /// New default input device, if any.
    pub input: Option<String>,
    /// New default output device, if any.
    pub output: Option<String>,
}

/// Polls CPAL for default-device changes.
pub struct DeviceWatcher {
    tx: mpsc::UnboundedSender<DeviceChange>,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl DeviceWatcher {
    /// Create a watcher that reports changes via `tx`.
    ///
    /// Call [`run`](Self::run) to start polling.
    pub fn new(tx: mpsc::UnboundedSender<DeviceChange>, cancel: CancellationToken) -> Self {
        Self {
            tx,
            cancel,
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Override the poll interval (useful for testing).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run the watcher loop until cancelled. Intended to be spawned as a
    /// background task.
    pub async fn run(self) {
        let mut last = current_defaults();
        info!(input = ?last.input, output = ?last.output, "device watcher started");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("device watcher cancelled");
                    break;
                }
                () = tokio::time::sleep(self.poll_interval) => {
                    let current = current_defaults();
                    if current != last {
                        info!(
                            old_input = ?last.input,
                            new_input = ?current.input,
                            old_output = ?last.output,
                            new_output = ?current.output,
                            "audio device topology changed"
                        );
                        if self.tx.send(current.clone()).is_err() {
                            warn!("device watcher: receiver closed, stopping");
                            break;
                        }
                        last = current;
                    }
                }
            }
        }
    }
}

/// Names of the current default input/output devices.
fn current_defaults() -> DeviceChange {
    let host = cpal::default_host();
    DeviceChange {
        input: host
            .default_input_device()
            .and_then(|dev| dev.description().ok().map(|d| d.name().to_owned())),
        output: host
            .default_output_device()
            .and_then(|dev| dev.description().ok().map(|d| d.name().to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watcher_stops_on_cancel() {
        let (tx, _rx) = mpsc::unbounded_channel::<DeviceChange>();
        let cancel = CancellationToken::new();
        let watcher =
            DeviceWatcher::new(tx, cancel.clone()).with_poll_interval(Duration::from_secs(60));

        let task = tokio::spawn(async move { watcher.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), task).await;
        assert!(result.is_ok(), "watcher task should finish after cancel");
    }

    #[tokio::test]
    async fn watcher_stops_when_receiver_closed() {
        let (tx, rx) = mpsc::unbounded_channel::<DeviceChange>();
        let cancel = CancellationToken::new();
        let watcher =
            DeviceWatcher::new(tx, cancel.clone()).with_poll_interval(Duration::from_millis(10));

        // Drop the receiver — the watcher stops on the next send attempt,
        // or on cancel if no device change ever fires.
        drop(rx);

        let task = tokio::spawn(async move { watcher.run().await });
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), task).await;
        assert!(result.is_ok(), "watcher task should finish");
    }
}
