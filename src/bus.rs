//! Event bus adapter: downstream delivery of run events.
//!
//! The outbox publisher hands every stored event to an [`EventBus`] as a
//! [`BusMessage`] keyed by correlation id. When the downstream bus supports
//! partitioning, implementations should use that key as the partition key
//! so per-run ordering survives transport. Consumers dedupe on
//! `(correlation_id, idempotency_key)` — delivery is at-least-once.
//!
//! [`InMemoryBus`] is the in-process implementation: a flume channel that
//! subscribers drain, plus synchronous [`BusSink`]s for console rendering
//! and capture in tests.

use std::sync::Mutex;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::events::Event;
use crate::telemetry::{PlainFormatter, TelemetryFormatter};
use crate::types::CorrelationId;

/// One published message: the full event plus its partitioning key.
#[derive(Clone, Debug, PartialEq)]
pub struct BusMessage {
    pub key: CorrelationId,
    pub event: Event,
}

#[derive(Debug, Error, Diagnostic)]
pub enum BusError {
    #[error("event bus unavailable: {message}")]
    #[diagnostic(
        code(gantry::bus::unavailable),
        help("The publisher retries failed publishes and quarantines after exhaustion.")
    )]
    Unavailable { message: String },
}

/// Downstream bus adapter contract.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError>;
}

/// Synchronous observer of published messages.
pub trait BusSink: Send {
    fn handle(&mut self, message: &BusMessage);
}

/// Sink that renders each message to stdout through a
/// [`TelemetryFormatter`].
pub struct ConsoleSink {
    formatter: Box<dyn TelemetryFormatter>,
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self {
            formatter: Box::new(PlainFormatter::new()),
        }
    }
}

impl ConsoleSink {
    #[must_use]
    pub fn with_formatter(formatter: Box<dyn TelemetryFormatter>) -> Self {
        Self { formatter }
    }
}

impl BusSink for ConsoleSink {
    fn handle(&mut self, message: &BusMessage) {
        println!("{}", self.formatter.render(message));
    }
}

/// In-process [`EventBus`] backed by an unbounded flume channel.
///
/// `subscribe()` returns the consuming end; messages are observed in
/// publish order. Sinks run synchronously inside `publish`, before the
/// channel send.
pub struct InMemoryBus {
    sender: flume::Sender<BusMessage>,
    receiver: flume::Receiver<BusMessage>,
    sinks: Mutex<Vec<Box<dyn BusSink>>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            sender,
            receiver,
            sinks: Mutex::new(Vec::new()),
        }
    }

    /// Attach a sink; every subsequent publish passes through it.
    pub fn add_sink(&self, sink: impl BusSink + 'static) {
        self.sinks
            .lock()
            .expect("bus sinks poisoned")
            .push(Box::new(sink));
    }

    /// The consuming end of the bus.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<BusMessage> {
        self.receiver.clone()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        {
            let mut sinks = self.sinks.lock().expect("bus sinks poisoned");
            for sink in sinks.iter_mut() {
                sink.handle(&message);
            }
        }
        self.sender
            .send(message)
            .map_err(|e| BusError::Unavailable {
                message: e.to_string(),
            })
    }
}

/// Helper: wrap a stored event into its bus message.
#[must_use]
pub fn message_for(event: Event) -> BusMessage {
    BusMessage {
        key: event.correlation_id.clone(),
        event,
    }
}
