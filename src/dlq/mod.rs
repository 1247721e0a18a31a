//! Dead letter queue (DLQ) infrastructure.
//!
//! A consumer gives up on a message when it cannot be decoded, when the
//! handler asks for it, or after too many failed attempts. The message is then
//! republished unchanged to the `task_events.dlq` exchange with the original
//! routing key, which lands it in `<queue>.dlq` for manual review and replay.
//!
//! ## Headers
//!
//! - `x-death-reason`: why the consumer gave up
//! - `x-original-queue`: queue the message was consumed from
//! - `x-delivery-attempts`: how many times a handler saw it

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bus::broker::MessageProperties;
use crate::bus::topology::{dead_letter_queue_for, DEAD_LETTER_EXCHANGE};
use crate::bus::{BusError, ConnectionController};
use crate::task::EventKind;

pub const DEATH_REASON_HEADER: &str = "x-death-reason";
pub const ORIGINAL_QUEUE_HEADER: &str = "x-original-queue";
pub const DELIVERY_ATTEMPTS_HEADER: &str = "x-delivery-attempts";

/// Errors that can occur during DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("DLQ not configured")]
    NotConfigured,

    #[error("Failed to publish to DLQ: {0}")]
    PublishFailed(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// A message a consumer gave up on.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Queue the message was consumed from.
    pub queue: String,
    pub routing_key: String,
    /// Original body, byte for byte.
    pub body: Vec<u8>,
    /// Original properties.
    pub properties: MessageProperties,
    pub reason: String,
    pub attempts: u32,
    pub occurred_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        body: Vec<u8>,
        properties: MessageProperties,
        reason: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            queue: queue.into(),
            routing_key: routing_key.into(),
            body,
            properties,
            reason: reason.into(),
            attempts,
            occurred_at: Utc::now(),
        }
    }

    /// Queue this dead letter ends up in.
    ///
    /// Dead letters are routed by their original routing key, so a message
    /// from a service's own queue copy lands in the shared dead-letter queue.
    pub fn dead_letter_queue(&self) -> String {
        match EventKind::from_routing_key(&self.routing_key) {
            Some(kind) => dead_letter_queue_for(kind.queue()),
            None => dead_letter_queue_for(&self.queue),
        }
    }

    /// Original properties plus the dead-letter headers.
    pub fn properties_with_headers(&self) -> MessageProperties {
        self.properties
            .clone()
            .with_header(DEATH_REASON_HEADER, self.reason.clone())
            .with_header(ORIGINAL_QUEUE_HEADER, self.queue.clone())
            .with_header(DELIVERY_ATTEMPTS_HEADER, self.attempts.to_string())
    }
}

/// Trait for publishing messages to a dead letter queue.
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    /// Publish a dead letter to the queue.
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError>;

    /// Check if the publisher is configured and ready.
    fn is_configured(&self) -> bool {
        true
    }
}

/// No-op DLQ publisher that logs but doesn't actually send anywhere.
///
/// Consumers seeing an unconfigured publisher reject the message without
/// requeue instead, leaving it to any broker-side dead-letter policy.
pub struct NoopDeadLetterPublisher;

#[async_trait]
impl DeadLetterPublisher for NoopDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        warn!(
            queue = %dead_letter.queue,
            reason = %dead_letter.reason,
            attempts = dead_letter.attempts,
            "DLQ not configured, logging dead letter"
        );
        Ok(())
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// In-memory DLQ publisher using a channel.
///
/// Used for testing.
pub struct ChannelDeadLetterPublisher {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterPublisher {
    /// Returns the publisher and a receiver for consuming dead letters.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterPublisher for ChannelDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        info!(
            queue = %dead_letter.queue,
            reason = %dead_letter.reason,
            "Publishing to channel DLQ"
        );
        self.sender
            .send(dead_letter)
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }
}

/// Publishes dead letters to the `task_events.dlq` exchange over the shared
/// broker connection. The connection's topology must include dead letters.
pub struct BrokerDeadLetterPublisher {
    connection: Arc<ConnectionController>,
    timeout: Duration,
}

impl BrokerDeadLetterPublisher {
    pub fn new(connection: Arc<ConnectionController>) -> Self {
        Self {
            connection,
            timeout: Duration::from_secs(5),
        }
    }

    /// Upper bound on one publish-and-confirm round trip.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl DeadLetterPublisher for BrokerDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        if !self.connection.topology().has_dead_letters() {
            return Err(DlqError::NotConfigured);
        }

        let channel = self
            .connection
            .ensure_topology()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        let properties = dead_letter.properties_with_headers();
        let published = tokio::time::timeout(
            self.timeout,
            channel.publish(
                DEAD_LETTER_EXCHANGE,
                &dead_letter.routing_key,
                &dead_letter.body,
                &properties,
            ),
        )
        .await
        .unwrap_or_else(|_| {
            Err(BusError::Publish(format!(
                "no confirmation within {:?}",
                self.timeout
            )))
        });
        if let Err(e) = published {
            self.connection.invalidate(&channel).await;
            return Err(DlqError::PublishFailed(e.to_string()));
        }

        warn!(
            queue = %dead_letter.dead_letter_queue(),
            reason = %dead_letter.reason,
            attempts = dead_letter.attempts,
            "Message moved to dead letter queue"
        );
        Ok(())
    }

    fn is_configured(&self) -> bool {
        self.connection.topology().has_dead_letters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::InMemoryBroker;
    use crate::bus::{ConnectionSettings, Topology};

    fn make_dead_letter(reason: &str) -> DeadLetter {
        DeadLetter::new(
            "task_created",
            "task.created",
            b"{\"id\":\"t1\"}".to_vec(),
            MessageProperties {
                message_id: Some("m-1".into()),
                persistent: true,
                ..Default::default()
            },
            reason,
            3,
        )
    }

    #[test]
    fn test_dead_letter_headers() {
        let dl = make_dead_letter("handler gave up");
        let props = dl.properties_with_headers();

        assert_eq!(dl.dead_letter_queue(), "task_created.dlq");
        assert_eq!(props.message_id.as_deref(), Some("m-1"));
        assert_eq!(props.headers[DEATH_REASON_HEADER], "handler gave up");
        assert_eq!(props.headers[ORIGINAL_QUEUE_HEADER], "task_created");
        assert_eq!(props.headers[DELIVERY_ATTEMPTS_HEADER], "3");
    }

    #[test]
    fn test_service_copy_shares_dead_letter_queue() {
        let mut dl = make_dead_letter("x");
        dl.queue = "task_created.member".into();
        assert_eq!(dl.dead_letter_queue(), "task_created.dlq");
    }

    #[tokio::test]
    async fn test_noop_publisher_succeeds() {
        let publisher = NoopDeadLetterPublisher;
        assert!(publisher.publish(make_dead_letter("x")).await.is_ok());
        assert!(!publisher.is_configured());
    }

    #[tokio::test]
    async fn test_channel_publisher_sends_in_order() {
        let (publisher, mut receiver) = ChannelDeadLetterPublisher::new();
        assert!(publisher.is_configured());

        for i in 0..3 {
            publisher
                .publish(make_dead_letter(&format!("reason-{}", i)))
                .await
                .unwrap();
        }

        for i in 0..3 {
            let received = receiver.recv().await.expect("Should receive");
            assert_eq!(received.reason, format!("reason-{}", i));
        }
    }

    #[tokio::test]
    async fn test_broker_publisher_routes_to_dead_letter_queue() {
        let broker = InMemoryBroker::new();
        let connection = Arc::new(ConnectionController::new(
            Arc::new(broker.connector()),
            Topology::task_events().with_dead_letters(),
            ConnectionSettings::default(),
        ));
        let publisher = BrokerDeadLetterPublisher::new(connection);
        assert!(publisher.is_configured());

        publisher.publish(make_dead_letter("bad json")).await.unwrap();

        let messages = broker.ready_messages("task_created.dlq");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, b"{\"id\":\"t1\"}");
        assert_eq!(messages[0].properties.headers[DEATH_REASON_HEADER], "bad json");
        assert_eq!(broker.ready_count("task_created"), 0);
    }

    #[tokio::test]
    async fn test_broker_publisher_without_dead_letter_topology() {
        let broker = InMemoryBroker::new();
        let connection = Arc::new(ConnectionController::new(
            Arc::new(broker.connector()),
            Topology::task_events(),
            ConnectionSettings::default(),
        ));
        let publisher = BrokerDeadLetterPublisher::new(connection);

        assert!(!publisher.is_configured());
        assert!(matches!(
            publisher.publish(make_dead_letter("x")).await,
            Err(DlqError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_broker_publisher_gives_up_on_missing_confirm() {
        let broker = InMemoryBroker::new();
        let connection = Arc::new(ConnectionController::new(
            Arc::new(broker.connector()),
            Topology::task_events().with_dead_letters(),
            ConnectionSettings::default(),
        ));
        let publisher = BrokerDeadLetterPublisher::new(Arc::clone(&connection))
            .with_timeout(Duration::from_millis(50));
        connection.ensure_topology().await.unwrap();
        broker.stall_publishes(true);

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            publisher.publish(make_dead_letter("bad json")),
        )
        .await
        .expect("dead-letter publish was not bounded");

        assert!(matches!(result, Err(DlqError::PublishFailed(ref m)) if m.contains("no confirmation")));
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[test]
    fn test_dlq_error_display() {
        assert_eq!(DlqError::NotConfigured.to_string(), "DLQ not configured");
        assert_eq!(
            DlqError::PublishFailed("nack".into()).to_string(),
            "Failed to publish to DLQ: nack"
        );
    }
}
