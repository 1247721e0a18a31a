//! Broker configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::{ConnectionSettings, ConsumeSettings, PublishSettings, Topology};

/// Broker type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    /// RabbitMQ over AMQP 0-9-1.
    #[default]
    Amqp,
    /// In-process broker; events never leave the process.
    Memory,
}

/// Broker connection and delivery tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    #[serde(rename = "type")]
    pub broker_type: BrokerType,
    /// AMQP connection URL.
    pub url: String,
    pub connect_timeout_ms: u64,
    pub connect_retries: usize,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub publish_timeout_ms: u64,
    /// Bound on a whole publish call, retries included.
    pub publish_deadline_ms: u64,
    pub publish_retries: usize,
    pub prefetch: u16,
    /// Handler invocations before a message is dead-lettered.
    pub max_delivery_attempts: u32,
    pub requeue_delay_ms: u64,
    /// Declare `task_events.dlq` and the `<queue>.dlq` queues.
    pub dead_letter: bool,
    /// Connection supervisor check interval.
    pub health_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_type: BrokerType::Amqp,
            url: "amqp://localhost:5672".to_string(),
            connect_timeout_ms: 10_000,
            connect_retries: 5,
            min_backoff_ms: 100,
            max_backoff_ms: 5_000,
            publish_timeout_ms: 5_000,
            publish_deadline_ms: 15_000,
            publish_retries: 3,
            prefetch: 1,
            max_delivery_attempts: 5,
            requeue_delay_ms: 1_000,
            dead_letter: true,
            health_interval_ms: 5_000,
        }
    }
}

impl BrokerConfig {
    pub fn topology(&self) -> Topology {
        let topology = Topology::task_events();
        if self.dead_letter {
            topology.with_dead_letters()
        } else {
            topology
        }
    }

    /// The shared topology plus the service's own copy of each task queue.
    pub fn service_topology(&self, service: &str) -> Topology {
        self.topology().with_service_queues(service)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            connect_retries: self.connect_retries,
            min_backoff: Duration::from_millis(self.min_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            health_interval: Duration::from_millis(self.health_interval_ms),
        }
    }

    pub fn publish_settings(&self) -> PublishSettings {
        PublishSettings {
            timeout: Duration::from_millis(self.publish_timeout_ms),
            deadline: Duration::from_millis(self.publish_deadline_ms),
            retries: self.publish_retries,
            min_backoff: Duration::from_millis(self.min_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    /// Consumer settings, tagging consumers with the service name.
    pub fn consume_settings(&self, service: &str) -> ConsumeSettings {
        ConsumeSettings {
            prefetch: self.prefetch,
            max_attempts: self.max_delivery_attempts.max(1),
            requeue_delay: Duration::from_millis(self.requeue_delay_ms),
            consumer_tag_prefix: service.to_string(),
            ..ConsumeSettings::default()
        }
    }
}
