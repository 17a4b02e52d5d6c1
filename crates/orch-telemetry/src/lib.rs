//! Telemetry pipeline: structured run events, a bounded cross-task queue,
//! and a background writer fanning out to Postgres and an optional webhook.

pub mod events;
pub mod persistence;
pub mod queue;
pub mod webhook;
pub mod writer;

pub use events::{Event, ExperimentNodeCompletedEvent, RunLogEvent, RunStageProgressEvent};
pub use queue::{bounded, EventEmitter, DEFAULT_QUEUE_MAXSIZE};
pub use persistence::EventStore;
pub use webhook::WebhookClient;
pub use writer::TelemetryWriter;
