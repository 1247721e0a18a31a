//! Event consumer: drives a handler from one task event queue.
//!
//! Messages are acknowledged manually after the handler returns. With the
//! default prefetch of 1 a consumer holds at most one unacknowledged message,
//! so a slow handler applies backpressure instead of buffering.
//!
//! A failing message goes back to the head of the queue. To keep one bad
//! message from blocking the queue forever, handler invocations are counted
//! per message id and the message is dead-lettered once it reaches
//! `max_attempts`. Bodies that do not decode are dead-lettered immediately.
//!
//! A requeued message may be settled by another consumer, so counts expire
//! after `attempt_ttl` and at most `max_tracked_attempts` are kept.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::{FutureExt, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::broker::{BrokerChannel, Delivery, DeliveryStream};
use super::connection::ConnectionController;
use super::{BusError, Disposition, EventHandler, HandlerError, Result};
use crate::dlq::{DeadLetter, DeadLetterPublisher};
use crate::task::{EventKind, TaskEvent, TaskRecord};
use crate::utils::retry::exponential_backoff;

/// Tuning for consumers.
#[derive(Debug, Clone)]
pub struct ConsumeSettings {
    /// Unacknowledged messages the broker may hand one consumer.
    pub prefetch: u16,
    /// Handler invocations before a message is dead-lettered.
    pub max_attempts: u32,
    /// Pause before a failed message is put back on the queue.
    pub requeue_delay: Duration,
    pub min_reconnect_backoff: Duration,
    pub max_reconnect_backoff: Duration,
    pub consumer_tag_prefix: String,
    /// How long an attempt count survives without another attempt.
    pub attempt_ttl: Duration,
    /// Most attempt counts kept; the stalest is dropped beyond this.
    pub max_tracked_attempts: usize,
}

impl Default for ConsumeSettings {
    fn default() -> Self {
        Self {
            prefetch: 1,
            max_attempts: 5,
            requeue_delay: Duration::from_secs(1),
            min_reconnect_backoff: Duration::from_millis(100),
            max_reconnect_backoff: Duration::from_secs(30),
            consumer_tag_prefix: "tasksync".to_string(),
            attempt_ttl: Duration::from_secs(600),
            max_tracked_attempts: 10_000,
        }
    }
}

impl ConsumeSettings {
    fn reconnect_backoff(&self) -> ExponentialBuilder {
        exponential_backoff(self.min_reconnect_backoff, self.max_reconnect_backoff, None)
    }
}

struct AttemptEntry {
    count: u32,
    last_seen: Instant,
}

/// Failed-attempt counts per message, bounded by age and size.
pub(crate) struct AttemptTracker {
    entries: Mutex<HashMap<String, AttemptEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl AttemptTracker {
    pub(crate) fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, AttemptEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn purge_expired(&self, entries: &mut HashMap<String, AttemptEntry>, now: Instant) {
        entries.retain(|_, entry| now.duration_since(entry.last_seen) < self.ttl);
    }

    /// Count one more attempt for `key` and return the total.
    pub(crate) fn record(&self, key: &str) -> u32 {
        let now = Instant::now();
        let mut entries = self.entries();
        self.purge_expired(&mut entries, now);

        if !entries.contains_key(key) && entries.len() >= self.capacity {
            let stalest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_seen)
                .map(|(key, _)| key.clone());
            if let Some(stalest) = stalest {
                entries.remove(&stalest);
            }
        }

        let entry = entries.entry(key.to_string()).or_insert(AttemptEntry {
            count: 0,
            last_seen: now,
        });
        entry.count += 1;
        entry.last_seen = now;
        entry.count
    }

    pub(crate) fn forget(&self, key: &str) {
        self.entries().remove(key);
    }

    /// Live counts, after dropping expired ones.
    pub(crate) fn len(&self) -> usize {
        let mut entries = self.entries();
        self.purge_expired(&mut entries, Instant::now());
        entries.len()
    }
}

/// Subscribes handlers to task event queues.
pub struct EventConsumer {
    connection: Arc<ConnectionController>,
    settings: ConsumeSettings,
    dead_letters: Arc<dyn DeadLetterPublisher>,
    attempts: Arc<AttemptTracker>,
}

impl EventConsumer {
    pub fn new(
        connection: Arc<ConnectionController>,
        settings: ConsumeSettings,
        dead_letters: Arc<dyn DeadLetterPublisher>,
    ) -> Self {
        let attempts = Arc::new(AttemptTracker::new(
            settings.attempt_ttl,
            settings.max_tracked_attempts,
        ));
        Self {
            connection,
            settings,
            dead_letters,
            attempts,
        }
    }

    pub fn settings(&self) -> &ConsumeSettings {
        &self.settings
    }

    /// Messages with a live failed-attempt count.
    pub fn tracked_attempts(&self) -> usize {
        self.attempts.len()
    }

    /// Start delivering messages from `queue` to `handler`.
    ///
    /// Fails if the queue is not part of the connection's topology or the
    /// first consumer cannot be registered. After that the subscription
    /// reconnects on its own until cancelled.
    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription> {
        if !self.connection.topology().has_queue(queue) {
            return Err(BusError::UnknownQueue(queue.to_string()));
        }

        let tag = format!(
            "{}-{}-{}",
            self.settings.consumer_tag_prefix,
            queue,
            uuid::Uuid::new_v4().simple()
        );
        let (channel, stream) = open_consumer(&self.connection, queue, &tag, &self.settings).await?;

        info!(queue = %queue, consumer_tag = %tag, "Consumer registered");

        let worker = ConsumeWorker {
            connection: Arc::clone(&self.connection),
            queue: queue.to_string(),
            tag,
            settings: self.settings.clone(),
            handler,
            dead_letters: Arc::clone(&self.dead_letters),
            attempts: Arc::clone(&self.attempts),
        };
        let span = tracing::info_span!("bus.subscription", queue = %queue);
        let handle = tokio::spawn(worker.run(channel, stream).instrument(span));

        Ok(Subscription {
            queue: queue.to_string(),
            handle,
        })
    }
}

/// A running consumer. Dropping it leaves the consumer running; call
/// [`Subscription::cancel`] to stop it.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop consuming. A message being handled is abandoned unacknowledged
    /// and is redelivered once its channel closes.
    pub async fn cancel(self) {
        self.handle.abort();
        let _ = self.handle.await;
        debug!(queue = %self.queue, "Subscription cancelled");
    }
}

async fn open_consumer(
    connection: &ConnectionController,
    queue: &str,
    tag: &str,
    settings: &ConsumeSettings,
) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream)> {
    let channel = connection.ensure_topology().await?;
    match channel.consume(queue, tag, settings.prefetch).await {
        Ok(stream) => Ok((channel, stream)),
        Err(e) => {
            connection.invalidate(&channel).await;
            Err(e)
        }
    }
}

struct ConsumeWorker {
    connection: Arc<ConnectionController>,
    queue: String,
    tag: String,
    settings: ConsumeSettings,
    handler: Arc<dyn EventHandler>,
    dead_letters: Arc<dyn DeadLetterPublisher>,
    attempts: Arc<AttemptTracker>,
}

impl ConsumeWorker {
    async fn run(self, mut channel: Arc<dyn BrokerChannel>, mut stream: DeliveryStream) {
        let backoff_builder = self.settings.reconnect_backoff();

        loop {
            while let Some(delivery) = stream.next().await {
                match delivery {
                    Ok(delivery) => self.process(delivery).await,
                    Err(e) => {
                        error!(queue = %self.queue, error = %e, "Consumer delivery error, will reconnect");
                        break;
                    }
                }
            }

            info!(queue = %self.queue, "Consumer stream ended, reconnecting...");
            self.connection.invalidate(&channel).await;

            let mut backoff_iter = backoff_builder.build();
            loop {
                let delay = backoff_iter
                    .next()
                    .unwrap_or(self.settings.max_reconnect_backoff);
                tokio::time::sleep(delay).await;

                match open_consumer(&self.connection, &self.queue, &self.tag, &self.settings).await
                {
                    Ok((new_channel, new_stream)) => {
                        info!(queue = %self.queue, "Consumer reconnected, processing messages");
                        channel = new_channel;
                        stream = new_stream;
                        break;
                    }
                    Err(e) => {
                        error!(
                            error = %e,
                            backoff_ms = %delay.as_millis(),
                            queue = %self.queue,
                            "Failed to set up consumer, retrying after backoff"
                        );
                    }
                }
            }
        }
    }

    async fn process(&self, delivery: Delivery) {
        let event = match decode(&self.queue, &delivery) {
            Ok(event) => Arc::new(event),
            Err(reason) => {
                error!(queue = %self.queue, error = %reason, "Failed to decode task event");
                self.dead_letter(&delivery, reason, 0).await;
                return;
            }
        };

        let key = attempt_key(&delivery);
        let consume_span = tracing::info_span!(
            "bus.consume",
            queue = %self.queue,
            kind = %event.kind,
            task_id = %event.payload.id,
            redelivered = event.redelivered,
        );

        let (disposition, failure) = self
            .invoke(Arc::clone(&event))
            .instrument(consume_span)
            .await;

        match disposition {
            Disposition::Ack => {
                self.forget(&key);
                if let Err(e) = delivery.ack().await {
                    error!(error = %e, "Failed to ack message");
                }
            }
            Disposition::DeadLetter => {
                let attempts = self.record_attempt(&key);
                self.forget(&key);
                let reason = failure.unwrap_or_else(|| "rejected by handler".to_string());
                self.dead_letter(&delivery, reason, attempts).await;
            }
            Disposition::Requeue => {
                let attempts = self.record_attempt(&key);
                let reason = failure.unwrap_or_else(|| "handler requested requeue".to_string());
                if attempts >= self.settings.max_attempts {
                    self.forget(&key);
                    warn!(
                        queue = %self.queue,
                        task_id = %event.payload.id,
                        attempts,
                        "Giving up on message"
                    );
                    self.dead_letter(
                        &delivery,
                        format!("gave up after {} attempts: {}", attempts, reason),
                        attempts,
                    )
                    .await;
                } else {
                    self.requeue(&delivery, attempts).await;
                }
            }
        }
    }

    /// Run the handler, turning errors and panics into a requeue.
    async fn invoke(&self, event: Arc<TaskEvent>) -> (Disposition, Option<String>) {
        let handler = Arc::clone(&self.handler);
        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
            Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
            Err(panic) => Err(panic),
        };

        match outcome {
            Ok(Ok(disposition)) => {
                debug!(%disposition, "Handler finished");
                (disposition, None)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Handler failed");
                (Disposition::Requeue, Some(e.to_string()))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "Handler panicked");
                (
                    Disposition::Requeue,
                    Some(HandlerError::new(format!("handler panicked: {}", message)).to_string()),
                )
            }
        }
    }

    async fn requeue(&self, delivery: &Delivery, attempts: u32) {
        debug!(
            attempts,
            max_attempts = self.settings.max_attempts,
            delay_ms = %self.settings.requeue_delay.as_millis(),
            "Requeueing message"
        );
        tokio::time::sleep(self.settings.requeue_delay).await;
        if let Err(e) = delivery.nack(true).await {
            error!(error = %e, "Failed to requeue message");
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: String, attempts: u32) {
        if !self.dead_letters.is_configured() {
            warn!(queue = %self.queue, reason = %reason, "Rejecting message without requeue");
            if let Err(e) = delivery.nack(false).await {
                error!(error = %e, "Failed to reject message");
            }
            return;
        }

        let dead_letter = DeadLetter::new(
            self.queue.clone(),
            delivery.routing_key.clone(),
            delivery.body.clone(),
            delivery.properties.clone(),
            reason,
            attempts,
        );
        match self.dead_letters.publish(dead_letter).await {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    error!(error = %e, "Failed to ack dead-lettered message");
                }
            }
            Err(e) => {
                error!(error = %e, "Dead letter publish failed, requeueing");
                tokio::time::sleep(self.settings.requeue_delay).await;
                if let Err(e) = delivery.nack(true).await {
                    error!(error = %e, "Failed to requeue message");
                }
            }
        }
    }

    fn record_attempt(&self, key: &str) -> u32 {
        self.attempts.record(key)
    }

    fn forget(&self, key: &str) {
        self.attempts.forget(key);
    }
}

/// Decode a delivery into a task event. The kind comes from the routing key,
/// falling back to the queue it was consumed from.
fn decode(queue: &str, delivery: &Delivery) -> std::result::Result<TaskEvent, String> {
    let kind = EventKind::from_routing_key(&delivery.routing_key)
        .or_else(|| EventKind::from_queue(queue))
        .ok_or_else(|| format!("unknown routing key '{}'", delivery.routing_key))?;
    let payload: TaskRecord =
        serde_json::from_slice(&delivery.body).map_err(|e| format!("invalid task JSON: {}", e))?;

    Ok(TaskEvent {
        kind,
        payload,
        message_id: delivery.properties.message_id.clone(),
        redelivered: delivery.redelivered,
    })
}

/// Message id, or routing key plus a hash of the body when the publisher set none.
fn attempt_key(delivery: &Delivery) -> String {
    match &delivery.properties.message_id {
        Some(id) => id.clone(),
        None => {
            let mut hasher = DefaultHasher::new();
            delivery.body.hash(&mut hasher);
            format!("{}:{:016x}", delivery.routing_key, hasher.finish())
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
