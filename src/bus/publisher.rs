//! Event publisher: emits a task event after the store write has committed.
//!
//! The body is the bare JSON task record; the event kind travels as the
//! routing key (and the AMQP `type` property). Messages are persistent, and
//! `publish` returns once the broker confirmed it accepted the message for
//! routing, not once anyone consumed it.

use std::iter;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::broker::{MessageProperties, JSON_CONTENT_TYPE};
use super::connection::ConnectionController;
use super::topology::TASK_EXCHANGE;
use super::{BusError, Result};
use crate::store::TaskStore;
use crate::task::{EventKind, TaskRecord};
use crate::utils::retry::exponential_backoff;

/// Tuning for publishing.
#[derive(Debug, Clone)]
pub struct PublishSettings {
    /// Upper bound on one publish-and-confirm round trip.
    pub timeout: Duration,
    /// Upper bound on the whole call: waiting for earlier publishes,
    /// connecting, and every retry.
    pub deadline: Duration,
    /// Retries after the first failed attempt, each on a fresh channel.
    pub retries: usize,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            deadline: Duration::from_secs(15),
            retries: 3,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl PublishSettings {
    fn backoff(&self) -> ExponentialBuilder {
        exponential_backoff(self.min_backoff, self.max_backoff, Some(self.retries))
    }
}

/// Publishes task events through a shared [`ConnectionController`].
pub struct EventPublisher {
    connection: Arc<ConnectionController>,
    settings: PublishSettings,
    store: Option<Arc<dyn TaskStore>>,
    /// Serializes publishes so one publisher's messages keep their order.
    order: Mutex<()>,
}

impl EventPublisher {
    pub fn new(connection: Arc<ConnectionController>, settings: PublishSettings) -> Self {
        Self {
            connection,
            settings,
            store: None,
            order: Mutex::new(()),
        }
    }

    /// Refuse to publish records the store does not know about.
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn publish_created(&self, record: &TaskRecord) -> Result<()> {
        self.publish(EventKind::TaskCreated, record).await
    }

    pub async fn publish_updated(&self, record: &TaskRecord) -> Result<()> {
        self.publish(EventKind::TaskUpdated, record).await
    }

    /// Publish `record` as an event of `kind`.
    ///
    /// Retries on a fresh channel with backoff. Once retries are exhausted, or
    /// the whole call outlives `deadline`, the failure is returned as
    /// [`BusError::Publish`], which callers may retry later.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(kind = %kind, task_id = %record.id))]
    pub async fn publish(&self, kind: EventKind, record: &TaskRecord) -> Result<()> {
        self.check_persisted(record).await?;

        let body = serde_json::to_vec(record)?;
        let routing_key = kind.routing_key();
        let properties = MessageProperties {
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            message_id: Some(uuid::Uuid::new_v4().to_string()),
            kind: Some(routing_key.to_string()),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .ok()
                .map(|d| d.as_secs()),
            persistent: true,
            headers: Default::default(),
        };

        let deadline = self.settings.deadline;
        match tokio::time::timeout(deadline, self.send(routing_key, &body, &properties)).await {
            Ok(result) => result,
            Err(_) => {
                error!(routing_key = %routing_key, ?deadline, "Publish deadline exceeded");
                Err(BusError::Publish(format!(
                    "not confirmed within {:?}",
                    deadline
                )))
            }
        }
    }

    /// Publish with retries, holding the order lock throughout.
    async fn send(
        &self,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        let _order = self.order.lock().await;
        let max_attempts = self.settings.retries + 1;
        let backoff = self.settings.backoff().build();
        let mut last_error = None;

        for (attempt, delay) in iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            let channel = match self.connection.ensure_topology().await {
                Ok(channel) => channel,
                Err(e @ BusError::TopologyConflict { .. }) => return Err(e),
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "No broker channel for publish, retrying..."
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            let outcome = tokio::time::timeout(
                self.settings.timeout,
                channel.publish(TASK_EXCHANGE, routing_key, body, properties),
            )
            .await
            .unwrap_or_else(|_| {
                Err(BusError::Publish(format!(
                    "no confirmation within {:?}",
                    self.settings.timeout
                )))
            });

            match outcome {
                Ok(()) => {
                    info!(
                        exchange = TASK_EXCHANGE,
                        routing_key = %routing_key,
                        "Task event published"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "Publish failed, retrying..."
                    );
                    self.connection.invalidate(&channel).await;
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "max retries exceeded".to_string());
        error!(routing_key = %routing_key, error = %reason, "Giving up on publish");
        Err(BusError::Publish(format!(
            "{} after {} attempts",
            reason, max_attempts
        )))
    }

    async fn check_persisted(&self, record: &TaskRecord) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        match store.record_exists(&record.id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(BusError::NotPersisted(record.id.clone())),
            Err(e) => {
                warn!(task_id = %record.id, error = %e, "Store lookup failed before publish");
                Err(BusError::Unavailable(format!("task store: {}", e)))
            }
        }
    }
}
