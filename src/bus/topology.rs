//! Broker topology: the durable exchange, queues and bindings for task events.
//!
//! The names and flags here are a wire contract shared with every service
//! that talks to the same broker. Changing any of them makes declarations
//! fail against an existing broker with `TopologyConflict`.

use std::fmt;

use tracing::{debug, info};

use super::broker::BrokerChannel;
use super::Result;

/// Exchange every task event is published to.
pub const TASK_EXCHANGE: &str = "task_events";
/// Queue receiving task creation events.
pub const TASK_CREATED_QUEUE: &str = "task_created";
/// Queue receiving task status update events.
pub const TASK_UPDATED_QUEUE: &str = "task_updated";
/// Routing key for task creation events.
pub const TASK_CREATED_ROUTING_KEY: &str = "task.created";
/// Routing key for task update events.
pub const TASK_UPDATED_ROUTING_KEY: &str = "task.updated";

/// Exchange receiving messages a consumer gave up on.
pub const DEAD_LETTER_EXCHANGE: &str = "task_events.dlq";
/// Suffix appended to a queue name to get its dead-letter queue.
pub const DEAD_LETTER_QUEUE_SUFFIX: &str = ".dlq";

/// Dead-letter queue name for a queue.
pub fn dead_letter_queue_for(queue: &str) -> String {
    format!("{}{}", queue, DEAD_LETTER_QUEUE_SUFFIX)
}

/// A service's own copy of a task queue, bound with the same routing key.
pub fn service_queue_for(queue: &str, service: &str) -> String {
    format!("{}.{}", queue, service)
}

/// Exchange routing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
            ExchangeKind::Fanout => f.write_str("fanout"),
            ExchangeKind::Topic => f.write_str("topic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn durable(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl Binding {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// A set of exchanges, queues and bindings declared together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    exchanges: Vec<ExchangeSpec>,
    queues: Vec<QueueSpec>,
    bindings: Vec<Binding>,
}

impl Topology {
    /// The task event topology: `task_events` (direct, durable) routing
    /// `task.created` to `task_created` and `task.updated` to `task_updated`.
    pub fn task_events() -> Self {
        Self::default()
            .exchange(ExchangeSpec::durable(TASK_EXCHANGE, ExchangeKind::Direct))
            .queue(QueueSpec::durable(TASK_CREATED_QUEUE))
            .queue(QueueSpec::durable(TASK_UPDATED_QUEUE))
            .binding(Binding::new(
                TASK_CREATED_QUEUE,
                TASK_EXCHANGE,
                TASK_CREATED_ROUTING_KEY,
            ))
            .binding(Binding::new(
                TASK_UPDATED_QUEUE,
                TASK_EXCHANGE,
                TASK_UPDATED_ROUTING_KEY,
            ))
    }

    /// Add a dead-letter exchange with one dead-letter queue per queue bound
    /// to `task_events`. Leaves the existing entities untouched.
    pub fn with_dead_letters(self) -> Self {
        let dead_letter_bindings: Vec<Binding> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == TASK_EXCHANGE)
            .map(|b| {
                Binding::new(
                    dead_letter_queue_for(&b.queue),
                    DEAD_LETTER_EXCHANGE,
                    b.routing_key.clone(),
                )
            })
            .collect();

        let mut topology =
            self.exchange(ExchangeSpec::durable(DEAD_LETTER_EXCHANGE, ExchangeKind::Direct));
        for binding in dead_letter_bindings {
            topology = topology
                .queue(QueueSpec::durable(binding.queue.clone()))
                .binding(binding);
        }
        topology
    }

    /// Add `<queue>.<service>` for each task queue, bound to `task_events`
    /// with the same routing key, so the service receives every event even
    /// while other services compete for the shared queues.
    ///
    /// Add after [`Topology::with_dead_letters`]: dead letters from these
    /// queues go to the shared dead-letter queues.
    pub fn with_service_queues(self, service: &str) -> Self {
        let copies: Vec<Binding> = [
            (TASK_CREATED_QUEUE, TASK_CREATED_ROUTING_KEY),
            (TASK_UPDATED_QUEUE, TASK_UPDATED_ROUTING_KEY),
        ]
        .into_iter()
        .map(|(queue, routing_key)| {
            Binding::new(service_queue_for(queue, service), TASK_EXCHANGE, routing_key)
        })
        .collect();

        let mut topology = self;
        for binding in copies {
            topology = topology
                .queue(QueueSpec::durable(binding.queue.clone()))
                .binding(binding);
        }
        topology
    }

    pub fn exchange(mut self, exchange: ExchangeSpec) -> Self {
        if !self.exchanges.contains(&exchange) {
            self.exchanges.push(exchange);
        }
        self
    }

    pub fn queue(mut self, queue: QueueSpec) -> Self {
        if !self.queues.contains(&queue) {
            self.queues.push(queue);
        }
        self
    }

    pub fn binding(mut self, binding: Binding) -> Self {
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        self
    }

    pub fn exchanges(&self) -> &[ExchangeSpec] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueSpec] {
        &self.queues
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.iter().any(|q| q.name == name)
    }

    pub fn has_dead_letters(&self) -> bool {
        self.exchanges.iter().any(|e| e.name == DEAD_LETTER_EXCHANGE)
    }

    /// Declare every exchange, then every queue, then every binding.
    ///
    /// Declarations are idempotent on the broker side; the first incompatible
    /// entity stops the sequence with `TopologyConflict`.
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> Result<()> {
        for exchange in &self.exchanges {
            channel.declare_exchange(exchange).await?;
            debug!(exchange = %exchange.name, kind = %exchange.kind, "Declared exchange");
        }

        for queue in &self.queues {
            channel.declare_queue(queue).await?;
            debug!(queue = %queue.name, "Declared queue");
        }

        for binding in &self.bindings {
            channel.bind_queue(binding).await?;
            debug!(
                queue = %binding.queue,
                exchange = %binding.exchange,
                routing_key = %binding.routing_key,
                "Bound queue to exchange"
            );
        }

        info!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.bindings.len(),
            "Topology declared"
        );

        Ok(())
    }
}
