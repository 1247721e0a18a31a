//! In-memory broker for standalone runs and tests.
//!
//! Models the AMQP semantics the bus relies on, within a single process:
//! - direct exchanges routing by exact routing key
//! - durable vs transient exchanges and queues, persistent vs transient messages
//!   (only durable entities and persistent messages survive [`InMemoryBroker::restart`])
//! - redeclaring with different parameters fails and closes the channel
//! - prefetch-limited consumers; unacknowledged messages are requeued with
//!   `redelivered = true` when their channel closes
//! - `nack(requeue)` puts the message back at the head of its queue
//!
//! Reachability can be switched off and publishes stalled to exercise timeout
//! paths; severing open channels exercises reconnects.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::broker::{Acker, BrokerChannel, Connector, Delivery, DeliveryStream, MessageProperties};
use super::topology::{Binding, ExchangeKind, ExchangeSpec, QueueSpec};
use super::{BusError, Result};

/// A message held by a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

struct Unacked {
    channel_id: u64,
    consumer_tag: String,
    message: QueuedMessage,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<QueuedMessage>,
    unacked: HashMap<u64, Unacked>,
    /// Bumped whenever a consumer may be able to make progress.
    version: watch::Sender<u64>,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            version,
        }
    }

    fn wake(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn in_flight(&self, channel_id: u64, consumer_tag: &str) -> usize {
        self.unacked
            .values()
            .filter(|u| u.channel_id == channel_id && u.consumer_tag == consumer_tag)
            .count()
    }

    /// Return a channel's unacknowledged messages to the queue, oldest first.
    fn requeue_channel(&mut self, channel_id: u64) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        if tags.is_empty() {
            return;
        }
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some(entry) = self.unacked.remove(&tag) {
                let mut message = entry.message;
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }
        self.wake();
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    open_channels: HashSet<u64>,
    next_delivery_tag: u64,
}

impl BrokerState {
    fn close_channel(&mut self, channel_id: u64) -> bool {
        if !self.open_channels.remove(&channel_id) {
            return false;
        }
        for queue in self.queues.values_mut() {
            queue.requeue_channel(channel_id);
            queue.wake();
        }
        true
    }

    fn route(&mut self, exchange: &str, routing_key: &str) -> Vec<String> {
        let Some(spec) = self.exchanges.get(exchange) else {
            return Vec::new();
        };
        let kind = spec.kind;
        self.bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match kind {
                ExchangeKind::Direct | ExchangeKind::Topic => b.routing_key == routing_key,
                ExchangeKind::Fanout => true,
            })
            .map(|b| b.queue.clone())
            .collect()
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    reachable: AtomicBool,
    next_channel_id: AtomicU64,
    connections_opened: AtomicUsize,
    publish_failures: AtomicUsize,
    publish_stalled: AtomicBool,
}

impl BrokerInner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                reachable: AtomicBool::new(true),
                next_channel_id: AtomicU64::new(1),
                connections_opened: AtomicUsize::new(0),
                publish_failures: AtomicUsize::new(0),
                publish_stalled: AtomicBool::new(false),
            }),
        }
    }

    /// Connector opening channels on this broker.
    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            broker: self.clone(),
        }
    }

    /// When unreachable, new connections fail with `Unavailable`.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next `count` publishes with a channel-level error.
    pub fn fail_next_publishes(&self, count: usize) {
        self.inner.publish_failures.store(count, Ordering::SeqCst);
    }

    /// While set, publishes never complete, as when the broker stops sending
    /// confirms.
    pub fn stall_publishes(&self, stalled: bool) {
        self.inner.publish_stalled.store(stalled, Ordering::SeqCst);
    }

    /// Close every open channel, as a dropped TCP connection would.
    pub fn sever_connections(&self) {
        let mut state = self.inner.state();
        let ids: Vec<u64> = state.open_channels.iter().copied().collect();
        for id in ids {
            state.close_channel(id);
        }
        warn!("In-memory broker severed all connections");
    }

    /// Simulate a broker restart: connections drop, transient entities and
    /// transient messages are lost.
    pub fn restart(&self) {
        let mut state = self.inner.state();
        let ids: Vec<u64> = state.open_channels.iter().copied().collect();
        for id in ids {
            state.close_channel(id);
        }

        state.exchanges.retain(|_, e| e.durable);
        state.queues.retain(|_, q| q.spec.durable);
        for queue in state.queues.values_mut() {
            queue.ready.retain(|m| m.properties.persistent);
        }

        let BrokerState {
            exchanges,
            queues,
            bindings,
            ..
        } = &mut *state;
        bindings.retain(|b| exchanges.contains_key(&b.exchange) && queues.contains_key(&b.queue));
    }

    pub fn connections_opened(&self) -> usize {
        self.inner.connections_opened.load(Ordering::SeqCst)
    }

    pub fn open_channel_count(&self) -> usize {
        self.inner.state().open_channels.len()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.inner.state().exchanges.get(name).cloned()
    }

    pub fn exchange_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state().exchanges.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn binding_count(&self) -> usize {
        self.inner.state().bindings.len()
    }

    /// Messages waiting in a queue (not yet delivered, or requeued).
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner
            .state()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Messages delivered to a consumer but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .state()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    /// Snapshot of the messages waiting in a queue.
    pub fn ready_messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.inner
            .state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn open_channel(&self) -> Result<InMemoryChannel> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable(
                "in-memory broker is unreachable".to_string(),
            ));
        }
        let id = self.inner.next_channel_id.fetch_add(1, Ordering::SeqCst);
        self.inner.state().open_channels.insert(id);
        self.inner.connections_opened.fetch_add(1, Ordering::SeqCst);
        debug!(channel_id = id, "Opened in-memory channel");
        Ok(InMemoryChannel {
            id,
            inner: Arc::clone(&self.inner),
        })
    }
}

/// Connector for [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
}

#[async_trait]
impl Connector for InMemoryConnector {
    fn describe(&self) -> String {
        "memory://".to_string()
    }

    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>> {
        Ok(Arc::new(self.broker.open_channel()?))
    }
}

/// A channel on an [`InMemoryBroker`].
pub struct InMemoryChannel {
    id: u64,
    inner: Arc<BrokerInner>,
}

impl InMemoryChannel {
    fn closed_error(&self) -> BusError {
        BusError::ChannelClosed(format!("in-memory channel {} is closed", self.id))
    }

    /// Lock state, failing when this channel is closed.
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = self.inner.state();
        if state.open_channels.contains(&self.id) {
            Ok(state)
        } else {
            Err(self.closed_error())
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        let mut state = self.open_state()?;
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => {
                let message = format!(
                    "exists as {} durable={}, declared as {} durable={}",
                    existing.kind, existing.durable, exchange.kind, exchange.durable
                );
                state.close_channel(self.id);
                Err(BusError::TopologyConflict {
                    entity: "exchange",
                    name: exchange.name.clone(),
                    message,
                })
            }
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        let mut state = self.open_state()?;
        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec != *queue => {
                let message = format!(
                    "exists with durable={}, declared with durable={}",
                    existing.spec.durable, queue.durable
                );
                state.close_channel(self.id);
                Err(BusError::TopologyConflict {
                    entity: "queue",
                    name: queue.name.clone(),
                    message,
                })
            }
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(queue.name.clone(), QueueState::new(queue.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<()> {
        let mut state = self.open_state()?;
        if !state.exchanges.contains_key(&binding.exchange) {
            state.close_channel(self.id);
            return Err(BusError::NotFound(format!(
                "exchange '{}'",
                binding.exchange
            )));
        }
        if !state.queues.contains_key(&binding.queue) {
            state.close_channel(self.id);
            return Err(BusError::NotFound(format!("queue '{}'", binding.queue)));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        if self.inner.publish_stalled.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        let mut state = self.open_state()?;

        let injected = self
            .inner
            .publish_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            state.close_channel(self.id);
            return Err(BusError::Publish("injected channel failure".to_string()));
        }

        if !state.exchanges.contains_key(exchange) {
            state.close_channel(self.id);
            return Err(BusError::Publish(format!(
                "no exchange '{}'",
                exchange
            )));
        }

        let targets = state.route(exchange, routing_key);
        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Message unroutable, dropped");
        }
        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.ready.push_back(QueuedMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    properties: properties.clone(),
                    redelivered: false,
                });
                queue.wake();
            }
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        let version = {
            let mut state = self.open_state()?;
            match state.queues.get(queue) {
                Some(q) => q.version.subscribe(),
                None => {
                    state.close_channel(self.id);
                    return Err(BusError::NotFound(format!("queue '{}'", queue)));
                }
            }
        };

        let cursor = ConsumerCursor {
            inner: Arc::clone(&self.inner),
            channel_id: self.id,
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            prefetch: usize::from(prefetch),
            version,
            finished: false,
        };

        Ok(futures::stream::unfold(cursor, |mut cursor| async move {
            let item = cursor.next_delivery().await?;
            Some((item, cursor))
        })
        .boxed())
    }

    fn is_open(&self) -> bool {
        self.inner.state().open_channels.contains(&self.id)
    }

    async fn close(&self) {
        if self.inner.state().close_channel(self.id) {
            debug!(channel_id = self.id, "Closed in-memory channel");
        }
    }
}

enum Take {
    Delivery(Delivery),
    Empty,
    Closed,
    QueueGone,
}

struct ConsumerCursor {
    inner: Arc<BrokerInner>,
    channel_id: u64,
    queue: String,
    consumer_tag: String,
    prefetch: usize,
    version: watch::Receiver<u64>,
    finished: bool,
}

impl ConsumerCursor {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        loop {
            if self.finished {
                return None;
            }

            // Mark the current version seen before looking, so a publish that
            // lands after the look still wakes `changed()` below.
            self.version.borrow_and_update();

            match self.try_take() {
                Take::Delivery(delivery) => return Some(Ok(delivery)),
                Take::Closed => {
                    self.finished = true;
                    return Some(Err(BusError::ChannelClosed(format!(
                        "in-memory channel {} closed",
                        self.channel_id
                    ))));
                }
                Take::QueueGone => {
                    self.finished = true;
                    return None;
                }
                Take::Empty => {}
            }

            if self.version.changed().await.is_err() {
                self.finished = true;
                return None;
            }
        }
    }

    fn try_take(&mut self) -> Take {
        let mut state = self.inner.state();
        if !state.open_channels.contains(&self.channel_id) {
            return Take::Closed;
        }
        let tag = state.next_delivery_tag + 1;
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Take::QueueGone;
        };
        if self.prefetch > 0 && queue.in_flight(self.channel_id, &self.consumer_tag) >= self.prefetch
        {
            return Take::Empty;
        }
        let Some(message) = queue.ready.pop_front() else {
            return Take::Empty;
        };

        queue.unacked.insert(
            tag,
            Unacked {
                channel_id: self.channel_id,
                consumer_tag: self.consumer_tag.clone(),
                message: message.clone(),
            },
        );
        state.next_delivery_tag = tag;

        let acker = InMemoryAcker {
            inner: Arc::clone(&self.inner),
            channel_id: self.channel_id,
            queue: self.queue.clone(),
            delivery_tag: tag,
        };

        Take::Delivery(Delivery::new(
            tag,
            message.exchange,
            message.routing_key,
            message.redelivered,
            message.properties,
            message.body,
            Box::new(acker),
        ))
    }
}

struct InMemoryAcker {
    inner: Arc<BrokerInner>,
    channel_id: u64,
    queue: String,
    delivery_tag: u64,
}

impl InMemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<()> {
        let mut state = self.inner.state();
        if !state.open_channels.contains(&self.channel_id) {
            return Err(BusError::ChannelClosed(format!(
                "in-memory channel {} closed before settling delivery {}",
                self.channel_id, self.delivery_tag
            )));
        }
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BusError::NotFound(format!("queue '{}'", self.queue)))?;
        let entry = queue.unacked.remove(&self.delivery_tag).ok_or_else(|| {
            BusError::Ack(format!("unknown delivery tag {}", self.delivery_tag))
        })?;

        if requeue == Some(true) {
            let mut message = entry.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }
        queue.wake();
        Ok(())
    }
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Some(requeue))
    }
}

#[cfg(test)]
mod tests;
