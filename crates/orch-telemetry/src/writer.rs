//! The background writer: drains the bounded event queue, persists to
//! Postgres (if configured), and forwards to a webhook (if configured).
//! A second task sends a heartbeat every 60s until told to stop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::Event;
use crate::persistence::EventStore;
use crate::webhook::WebhookClient;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

pub struct TelemetryWriter {
    drain_handle: JoinHandle<()>,
    heartbeat_handle: Option<JoinHandle<()>>,
    heartbeat_stop: Option<mpsc::Sender<()>>,
}

impl TelemetryWriter {
    /// Spawn the writer task (and, if a webhook is configured, the
    /// heartbeat task). `rx` is the receiving half of the queue built by
    /// `queue::bounded`.
    pub fn spawn(mut rx: mpsc::Receiver<Event>, mut store: Option<EventStore>, webhook: Option<Arc<WebhookClient>>) -> Self {
        let webhook_for_drain = webhook.clone();
        let drain_handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Some(store) = store.as_mut() {
                    store.persist(&event).await;
                }
                if let Some(webhook) = &webhook_for_drain {
                    webhook.publish(&event).await;
                }
            }
        });

        let (heartbeat_handle, heartbeat_stop) = match webhook {
            Some(webhook) => {
                let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
                let handle = tokio::spawn(async move {
                    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
                    loop {
                        tokio::select! {
                            _ = interval.tick() => webhook.publish_heartbeat().await,
                            _ = stop_rx.recv() => break,
                        }
                    }
                });
                (Some(handle), Some(stop_tx))
            }
            None => (None, None),
        };

        Self {
            drain_handle,
            heartbeat_handle,
            heartbeat_stop,
        }
    }

    /// Stop the heartbeat loop and wait for the queue to fully drain. The
    /// caller must drop every `EventEmitter` clone before calling this, or
    /// the drain loop will never observe channel closure.
    pub async fn shutdown(self) {
        if let Some(stop) = self.heartbeat_stop {
            let _ = stop.send(()).await;
        }
        if let Some(handle) = self.heartbeat_handle {
            let _ = handle.await;
        }
        let _ = self.drain_handle.await;
    }
}
