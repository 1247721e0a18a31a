//! Event bus for task lifecycle events.
//!
//! This module contains:
//! - `BrokerChannel`/`Connector` traits: the seam between the bus and a broker
//! - `ConnectionController`: owns the single shared connection and channel
//! - `Topology`: the durable exchange, queues and bindings
//! - `EventPublisher` / `EventConsumer`: the publish and consume contracts
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::task::TaskEvent;

pub mod broker;
pub mod connection;
pub mod consumer;
pub mod memory;
pub mod publisher;
pub mod topology;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use broker::{BrokerChannel, Connector, Delivery, MessageProperties};
pub use connection::{ConnectionController, ConnectionSettings, ConnectionState, Supervisor};
pub use consumer::{ConsumeSettings, EventConsumer, Subscription};
pub use memory::InMemoryBroker;
pub use publisher::{EventPublisher, PublishSettings};
pub use topology::Topology;

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Topology conflict on {entity} '{name}': {message}")]
    TopologyConflict {
        entity: &'static str,
        name: String,
        message: String,
    },

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Queue '{0}' is not part of the declared topology")]
    UnknownQueue(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Task '{0}' has not been persisted")]
    NotPersisted(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),
}

impl BusError {
    /// Whether a fresh connection attempt might succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::Unavailable(_) | BusError::Publish(_) | BusError::ChannelClosed(_)
        )
    }
}

/// Error raised by an event handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// What the consumer should do with a message after its handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; remove from the queue.
    Ack,
    /// Not processed; put back on the queue for another attempt.
    Requeue,
    /// Will never succeed; move to the dead-letter queue.
    DeadLetter,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Ack => f.write_str("ack"),
            Disposition::Requeue => f.write_str("requeue"),
            Disposition::DeadLetter => f.write_str("dead-letter"),
        }
    }
}

/// Handler for processing task events from a queue.
///
/// Returning `Err` is treated as [`Disposition::Requeue`].
pub trait EventHandler: Send + Sync {
    /// Process a task event.
    fn handle(
        &self,
        event: Arc<TaskEvent>,
    ) -> BoxFuture<'static, std::result::Result<Disposition, HandlerError>>;
}

/// Handler built from an async closure. See [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Arc<TaskEvent>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Disposition, HandlerError>> + Send + 'static,
{
    HandlerFn { f }
}

impl<F, Fut> EventHandler for HandlerFn<F>
where
    F: Fn(Arc<TaskEvent>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Disposition, HandlerError>> + Send + 'static,
{
    fn handle(
        &self,
        event: Arc<TaskEvent>,
    ) -> BoxFuture<'static, std::result::Result<Disposition, HandlerError>> {
        Box::pin((self.f)(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{EventKind, TaskRecord};

    #[test]
    fn test_retryable_classification() {
        assert!(BusError::Unavailable("down".into()).is_retryable());
        assert!(BusError::Publish("nack".into()).is_retryable());
        assert!(BusError::ChannelClosed("gone".into()).is_retryable());
        assert!(!BusError::UnknownQueue("q".into()).is_retryable());
        assert!(!BusError::NotPersisted("t1".into()).is_retryable());
        assert!(!BusError::TopologyConflict {
            entity: "queue",
            name: "task_created".into(),
            message: "durable mismatch".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = BusError::TopologyConflict {
            entity: "exchange",
            name: "task_events".into(),
            message: "kind mismatch".into(),
        };
        assert_eq!(
            err.to_string(),
            "Topology conflict on exchange 'task_events': kind mismatch"
        );
    }

    #[tokio::test]
    async fn test_handler_fn_forwards_event() {
        let handler = handler_fn(|event: Arc<TaskEvent>| async move {
            if event.payload.title.is_empty() {
                Err(HandlerError::new("empty title"))
            } else {
                Ok(Disposition::Ack)
            }
        });

        let ok = Arc::new(TaskEvent::new(
            EventKind::TaskCreated,
            TaskRecord::new("t1", "Draft", "alice"),
        ));
        assert_eq!(handler.handle(ok).await, Ok(Disposition::Ack));

        let bad = Arc::new(TaskEvent::new(
            EventKind::TaskCreated,
            TaskRecord::new("t2", "", "alice"),
        ));
        assert_eq!(
            handler.handle(bad).await,
            Err(HandlerError::new("empty title"))
        );
    }
}
