//! Cross-task event queue: a bounded, best-effort channel between event
//! producers (the Agent Manager, the Parallel Agent) and the single
//! background writer. Full queue means drop-and-log, never block the run.

use tokio::sync::mpsc;

use crate::events::Event;

pub const DEFAULT_QUEUE_MAXSIZE: usize = 1024;

/// Handed to every Journal/Parallel Agent that wants to emit telemetry.
/// Cloning is cheap (an `mpsc::Sender` clone); every clone shares the same
/// bounded queue and the same background writer.
#[derive(Clone)]
pub struct EventEmitter {
    sender: Option<mpsc::Sender<Event>>,
}

impl EventEmitter {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender: Some(sender) }
    }

    /// An emitter with no queue attached: local logging only, no persistence.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Log locally and enqueue for the writer. Never blocks: a full queue
    /// drops the event with a warning, matching the original's
    /// `queue.Full` handling.
    pub fn emit(&self, event: Event) {
        match &event {
            Event::RunLog(e) => match e.level.as_str() {
                "error" => tracing::error!(message = %e.message, "run log"),
                "warn" | "warning" => tracing::warn!(message = %e.message, "run log"),
                _ => tracing::info!(message = %e.message, "run log"),
            },
            Event::RunStageProgress(e) => {
                tracing::debug!(stage = %e.stage, iteration = e.iteration, max = e.max_iterations, "stage progress")
            }
            Event::ExperimentNodeCompleted(e) => {
                tracing::debug!(stage = %e.stage, node_id = ?e.node_id, "node completed")
            }
        }

        let Some(sender) = &self.sender else { return };
        if let Err(mpsc::error::TrySendError::Full(_)) = sender.try_send(event) {
            tracing::warn!("telemetry queue is full; dropping event");
        }
    }
}

/// Build a bounded queue and return `(emitter, receiver)`. The receiver is
/// handed to the writer task; the emitter is cloned into every producer.
pub fn bounded(maxsize: usize) -> (EventEmitter, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(maxsize);
    (EventEmitter::new(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let (emitter, mut rx) = bounded(1);
        emitter.emit(Event::RunLog(crate::events::RunLogEvent {
            message: "first".into(),
            level: "info".into(),
        }));
        emitter.emit(Event::RunLog(crate::events::RunLogEvent {
            message: "dropped".into(),
            level: "info".into(),
        }));
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, Event::RunLog(e) if e.message == "first"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disabled_emitter_never_panics() {
        let emitter = EventEmitter::disabled();
        emitter.emit(Event::RunLog(crate::events::RunLogEvent {
            message: "noop".into(),
            level: "info".into(),
        }));
    }
}
