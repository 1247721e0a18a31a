//! Connection lifecycle: one shared broker channel per controller.
//!
//! The controller owns the channel. Publishers and consumers borrow it via
//! [`ConnectionController::connect`] / [`ConnectionController::ensure_topology`]
//! and report failures through [`ConnectionController::invalidate`]; they never
//! close it themselves.
//!
//! ```text
//! Disconnected --connect()--> Connected --(failure / invalidate)--> Disconnected
//! ```
//!
//! Concurrent `connect()` callers are serialized on an async mutex, so at most
//! one connection attempt is in flight.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::broker::{BrokerChannel, Connector};
use super::topology::Topology;
use super::{BusError, Result};
use crate::utils::retry::exponential_backoff;

/// Tuning for connection establishment and supervision.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Upper bound on a single connection handshake.
    pub connect_timeout: Duration,
    /// Retries after the first failed attempt.
    pub connect_retries: usize,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// How often the supervisor checks the connection.
    pub health_interval: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            connect_retries: 5,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            health_interval: Duration::from_secs(5),
        }
    }
}

impl ConnectionSettings {
    /// Exponential backoff with jitter for connection attempts.
    pub fn backoff(&self) -> ExponentialBuilder {
        exponential_backoff(self.min_backoff, self.max_backoff, Some(self.connect_retries))
    }
}

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

struct Session {
    channel: Arc<dyn BrokerChannel>,
    topology_declared: bool,
}

/// Owns the broker connection and its single channel.
pub struct ConnectionController {
    connector: Arc<dyn Connector>,
    topology: Topology,
    settings: ConnectionSettings,
    session: Mutex<Option<Session>>,
}

impl ConnectionController {
    /// Create a controller. Nothing is opened until first use.
    pub fn new(
        connector: Arc<dyn Connector>,
        topology: Topology,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            connector,
            topology,
            settings,
            session: Mutex::new(None),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Broker address with credentials removed.
    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    pub async fn state(&self) -> ConnectionState {
        match self.session.lock().await.as_ref() {
            Some(session) if session.channel.is_open() => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Return the open channel, establishing it first if needed.
    ///
    /// Fails with [`BusError::Unavailable`] once the retry policy is exhausted.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut session = self.session.lock().await;
        self.connect_locked(&mut session).await
    }

    /// Connect and make sure the topology is declared on the current connection.
    ///
    /// Declaration happens once per connection; after a reconnect it runs again.
    pub async fn ensure_topology(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut session = self.session.lock().await;
        let channel = self.connect_locked(&mut session).await?;

        if session.as_ref().is_some_and(|s| s.topology_declared) {
            return Ok(channel);
        }

        match self.topology.declare(channel.as_ref()).await {
            Ok(()) => {
                if let Some(current) = session.as_mut() {
                    current.topology_declared = true;
                }
                Ok(channel)
            }
            Err(e) => {
                error!(error = %e, "Failed to declare topology");
                if !channel.is_open() {
                    *session = None;
                }
                Err(e)
            }
        }
    }

    /// Report that `channel` failed. If it is still the current channel it is
    /// dropped, and the next caller reconnects.
    pub async fn invalidate(&self, channel: &Arc<dyn BrokerChannel>) {
        let mut session = self.session.lock().await;
        let is_current = session
            .as_ref()
            .is_some_and(|s| same_channel(&s.channel, channel));
        if !is_current {
            return;
        }
        if let Some(stale) = session.take() {
            warn!(target = %self.connector.describe(), "Broker channel invalidated");
            stale.channel.close().await;
        }
    }

    /// Close the channel, then the connection. Safe to call repeatedly.
    pub async fn close(&self) {
        let Some(session) = self.session.lock().await.take() else {
            debug!("Broker connection already closed");
            return;
        };
        session.channel.close().await;
        info!(target = %self.connector.describe(), "Broker connection closed");
    }

    /// Start a background task that re-establishes a lost connection.
    pub fn supervise(self: &Arc<Self>) -> Supervisor {
        let controller = Arc::clone(self);
        let interval = self.settings.health_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if controller.state().await == ConnectionState::Connected {
                    continue;
                }
                match controller.ensure_topology().await {
                    Ok(_) => info!("Supervisor re-established broker connection"),
                    Err(e) => error!(error = %e, "Supervisor could not reach broker"),
                }
            }
        });

        Supervisor { handle }
    }

    async fn connect_locked(
        &self,
        session: &mut Option<Session>,
    ) -> Result<Arc<dyn BrokerChannel>> {
        if let Some(current) = session.as_ref() {
            if current.channel.is_open() {
                return Ok(Arc::clone(&current.channel));
            }
        }
        if let Some(stale) = session.take() {
            debug!("Discarding closed broker channel");
            stale.channel.close().await;
        }

        let target = self.connector.describe();
        let channel = (|| self.open_once())
            .retry(self.settings.backoff())
            .when(BusError::is_retryable)
            .notify(|err: &BusError, delay: Duration| {
                warn!(target = %target, error = %err, delay = ?delay, "Broker connection failed, retrying");
            })
            .await
            .map_err(|e| {
                error!(target = %target, error = %e, "Giving up on broker connection");
                match e {
                    BusError::Unavailable(_) => e,
                    other => BusError::Unavailable(other.to_string()),
                }
            })?;

        info!(target = %target, "Connected to broker");
        *session = Some(Session {
            channel: Arc::clone(&channel),
            topology_declared: false,
        });
        Ok(channel)
    }

    async fn open_once(&self) -> Result<Arc<dyn BrokerChannel>> {
        match tokio::time::timeout(self.settings.connect_timeout, self.connector.connect()).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Unavailable(format!(
                "connection to {} timed out after {:?}",
                self.connector.describe(),
                self.settings.connect_timeout
            ))),
        }
    }
}

fn same_channel(a: &Arc<dyn BrokerChannel>, b: &Arc<dyn BrokerChannel>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Handle to the background reconnect task.
pub struct Supervisor {
    handle: JoinHandle<()>,
}

impl Supervisor {
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel the supervisor and wait for it to stop.
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::InMemoryBroker;
    use async_trait::async_trait;

    fn fast_settings() -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_millis(100),
            connect_retries: 2,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            health_interval: Duration::from_millis(20),
        }
    }

    fn controller(broker: &InMemoryBroker) -> Arc<ConnectionController> {
        Arc::new(ConnectionController::new(
            Arc::new(broker.connector()),
            Topology::task_events(),
            fast_settings(),
        ))
    }

    struct HangingConnector;

    #[async_trait]
    impl Connector for HangingConnector {
        fn describe(&self) -> String {
            "hanging://".to_string()
        }

        async fn connect(&self) -> Result<Arc<dyn BrokerChannel>> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_connection_is_lazy() {
        let broker = InMemoryBroker::new();
        let controller = controller(&broker);

        assert_eq!(controller.state().await, ConnectionState::Disconnected);
        assert_eq!(broker.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let broker = InMemoryBroker::new();
        let controller = controller(&broker);

        let first = controller.connect().await.unwrap();
        let second = controller.connect().await.unwrap();

        assert!(same_channel(&first, &second));
        assert_eq!(broker.connections_opened(), 1);
        assert_eq!(controller.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_connection() {
        let broker = InMemoryBroker::new();
        let controller = controller(&broker);

        let attempts = (0..16).map(|_| {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.connect().await.map(|_| ()) })
        });
        for result in futures::future::join_all(attempts).await {
            result.unwrap().unwrap();
        }

        assert_eq!(broker.connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_unavailable_after_retries() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let controller = controller(&broker);

        let err = controller.connect().await.err().unwrap();

        assert!(matches!(err, BusError::Unavailable(_)));
        assert_eq!(controller.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_timeout_is_unavailable() {
        let controller = ConnectionController::new(
            Arc::new(HangingConnector),
            Topology::task_events(),
            ConnectionSettings {
                connect_retries: 0,
                ..fast_settings()
            },
        );

        let err = controller.connect().await.err().unwrap();
        assert!(matches!(err, BusError::Unavailable(ref m) if m.contains("timed out")));
    }

    #[tokio::test]
    async fn test_ensure_topology_declares_once_per_connection() {
        let broker = InMemoryBroker::new();
        let controller = controller(&broker);

        controller.ensure_topology().await.unwrap();
        controller.ensure_topology().await.unwrap();

        assert_eq!(broker.queue_names(), vec!["task_created", "task_updated"]);
        assert_eq!(broker.binding_count(), 2);
        assert_eq!(broker.connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_ensure_topology_leaves_nothing_when_unreachable() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let controller = controller(&broker);

        let err = controller.ensure_topology().await.err().unwrap();

        assert!(matches!(err, BusError::Unavailable(_)));
        assert!(broker.exchange_names().is_empty());
        assert!(broker.queue_names().is_empty());
    }

    #[tokio::test]
    async fn test_reconnects_after_failure() {
        let broker = InMemoryBroker::new();
        let controller = controller(&broker);
        controller.ensure_topology().await.unwrap();

        broker.sever_connections();
        assert_eq!(controller.state().await, ConnectionState::Disconnected);

        let channel = controller.ensure_topology().await.unwrap();
        assert!(channel.is_open());
        assert_eq!(broker.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_ignores_stale_channel() {
        let broker = InMemoryBroker::new();
        let controller = controller(&broker);
        let first = controller.connect().await.unwrap();

        controller.invalidate(&first).await;
        let second = controller.connect().await.unwrap();
        assert!(!first.is_open());

        // Reporting the old channel again must not drop the new one.
        controller.invalidate(&first).await;
        assert!(second.is_open());
        assert_eq!(controller.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_close_is_safe_to_repeat() {
        let broker = InMemoryBroker::new();
        let controller = controller(&broker);
        let channel = controller.connect().await.unwrap();

        controller.close().await;
        controller.close().await;

        assert!(!channel.is_open());
        assert_eq!(controller.state().await, ConnectionState::Disconnected);

        // Re-creatable after close.
        controller.connect().await.unwrap();
        assert_eq!(broker.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_supervisor_restores_connection() {
        let broker = InMemoryBroker::new();
        let controller = controller(&broker);
        controller.ensure_topology().await.unwrap();
        let supervisor = controller.supervise();

        broker.sever_connections();

        let restored = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if controller.state().await == ConnectionState::Connected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(restored.is_ok(), "supervisor did not reconnect");
        assert!(supervisor.is_running());

        supervisor.stop().await;
    }
}
