//! Service bootstrap shared by the leader and member binaries.
//!
//! A service is a name, a listen address, a route table and a set of queue
//! subscriptions. [`ServiceRunner::start`] declares the topology (fatal on
//! failure), registers the subscriptions, starts the connection supervisor
//! and the HTTP listener. [`RunningService::shutdown`] undoes it in reverse.

pub mod routes;
pub mod tasks;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bus::topology::{service_queue_for, TASK_CREATED_QUEUE, TASK_UPDATED_QUEUE};
use crate::bus::{
    BusError, ConnectionController, Connector, EventConsumer, EventHandler, EventPublisher,
    InMemoryBroker, Subscription, Supervisor,
};
use crate::config::{BrokerConfig, BrokerType, Config, ConfigError};
use crate::dlq::{BrokerDeadLetterPublisher, DeadLetterPublisher, NoopDeadLetterPublisher};
use crate::projection::{EventLogHandler, ProjectionHandler, TaskProjection};
use crate::store::{InMemoryTaskStore, TaskStore};
use crate::utils::bootstrap::config_path_from_args;
use routes::AppState;
use tasks::TaskService;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Broker type '{0}' is not compiled in")]
    UnsupportedBroker(&'static str),
}

/// Which of the two services to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Member,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Member => "member",
        }
    }
}

/// Everything that distinguishes one service from another.
pub struct ServiceSpec {
    pub name: String,
    pub address: SocketAddr,
    pub router: Router,
    pub subscriptions: Vec<(String, Arc<dyn EventHandler>)>,
}

/// Starts services on a shared broker connection.
pub struct ServiceRunner {
    connection: Arc<ConnectionController>,
    consumer: EventConsumer,
}

impl ServiceRunner {
    pub fn new(connection: Arc<ConnectionController>, consumer: EventConsumer) -> Self {
        Self {
            connection,
            consumer,
        }
    }

    pub async fn start(self, spec: ServiceSpec) -> Result<RunningService, ServiceError> {
        info!(
            service = %spec.name,
            broker = %self.connection.describe(),
            "Starting service"
        );

        self.connection.ensure_topology().await?;

        let mut subscriptions = Vec::with_capacity(spec.subscriptions.len());
        for (queue, handler) in spec.subscriptions {
            match self.consumer.subscribe(&queue, handler).await {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => {
                    for subscription in subscriptions {
                        subscription.cancel().await;
                    }
                    self.connection.close().await;
                    return Err(e.into());
                }
            }
        }

        let supervisor = self.connection.supervise();

        let listener = match tokio::net::TcpListener::bind(spec.address).await {
            Ok(listener) => listener,
            Err(e) => {
                for subscription in subscriptions {
                    subscription.cancel().await;
                }
                supervisor.stop().await;
                self.connection.close().await;
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;
        info!(service = %spec.name, addr = %local_addr, "HTTP listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let name = spec.name.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, spec.router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = &result {
                error!(service = %name, error = %e, "HTTP server error");
            }
            result
        });

        Ok(RunningService {
            name: spec.name,
            local_addr,
            connection: self.connection,
            subscriptions,
            supervisor,
            shutdown_tx,
            server,
        })
    }
}

/// A started service.
pub struct RunningService {
    name: String,
    local_addr: SocketAddr,
    connection: Arc<ConnectionController>,
    subscriptions: Vec<Subscription>,
    supervisor: Supervisor,
    shutdown_tx: oneshot::Sender<()>,
    server: JoinHandle<std::io::Result<()>>,
}

impl RunningService {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribed_queues(&self) -> Vec<&str> {
        self.subscriptions.iter().map(|s| s.queue()).collect()
    }

    /// Run until Ctrl+C, then shut down.
    pub async fn run_until_ctrl_c(self) -> Result<(), ServiceError> {
        info!(service = %self.name, "Service running, press Ctrl+C to exit");
        tokio::signal::ctrl_c().await?;
        self.shutdown().await
    }

    /// Stop consuming, stop the supervisor, drain HTTP, close the connection.
    pub async fn shutdown(self) -> Result<(), ServiceError> {
        info!(service = %self.name, "Shutting down service");

        for subscription in self.subscriptions {
            subscription.cancel().await;
        }
        self.supervisor.stop().await;

        let _ = self.shutdown_tx.send(());
        let served = match self.server.await {
            Ok(result) => result.map_err(ServiceError::from),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(ServiceError::Io(std::io::Error::other(e))),
        };

        self.connection.close().await;
        info!(service = %self.name, "Service stopped");
        served
    }
}

/// Connector for the configured broker.
pub fn connector_for(config: &BrokerConfig) -> Result<Arc<dyn Connector>, ServiceError> {
    match config.broker_type {
        #[cfg(feature = "amqp")]
        BrokerType::Amqp => Ok(Arc::new(crate::bus::AmqpConnector::new(config.url.clone()))),
        #[cfg(not(feature = "amqp"))]
        BrokerType::Amqp => Err(ServiceError::UnsupportedBroker("amqp")),
        BrokerType::Memory => Ok(Arc::new(InMemoryBroker::new().connector())),
    }
}

/// Wiring for one service built from configuration.
pub struct ServiceParts {
    pub runner: ServiceRunner,
    pub spec: ServiceSpec,
    pub state: AppState,
}

/// Build the leader or member service with an in-memory task store.
pub fn build(
    role: Role,
    config: &Config,
    connector: Arc<dyn Connector>,
) -> Result<ServiceParts, ServiceError> {
    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    build_with_store(role, config, connector, store)
}

pub fn build_with_store(
    role: Role,
    config: &Config,
    connector: Arc<dyn Connector>,
    store: Arc<dyn TaskStore>,
) -> Result<ServiceParts, ServiceError> {
    let broker = &config.broker;
    let connection = Arc::new(ConnectionController::new(
        connector,
        broker.service_topology(role.name()),
        broker.connection_settings(),
    ));

    let publisher = Arc::new(
        EventPublisher::new(Arc::clone(&connection), broker.publish_settings())
            .with_store(Arc::clone(&store)),
    );
    let dead_letters: Arc<dyn DeadLetterPublisher> = if broker.dead_letter {
        Arc::new(
            BrokerDeadLetterPublisher::new(Arc::clone(&connection))
                .with_timeout(broker.publish_settings().timeout),
        )
    } else {
        Arc::new(NoopDeadLetterPublisher)
    };
    let consumer = EventConsumer::new(
        Arc::clone(&connection),
        broker.consume_settings(role.name()),
        dead_letters,
    );

    let projection = Arc::new(TaskProjection::new());
    let state = AppState {
        tasks: Arc::new(TaskService::new(Arc::clone(&store), publisher)),
        projection: Arc::clone(&projection),
    };

    let log: Arc<dyn EventHandler> = Arc::new(EventLogHandler::new(role.name()));
    let mirror: Arc<dyn EventHandler> =
        Arc::new(ProjectionHandler::new(projection).with_store(store));
    let (address, router) = match role {
        Role::Leader => (config.leader.address()?, routes::leader_router(state.clone())),
        Role::Member => (config.member.address()?, routes::member_router(state.clone())),
    };

    Ok(ServiceParts {
        runner: ServiceRunner::new(connection, consumer),
        spec: ServiceSpec {
            name: role.name().to_string(),
            address,
            router,
            subscriptions: vec![
                (TASK_CREATED_QUEUE.to_string(), Arc::clone(&log)),
                (TASK_UPDATED_QUEUE.to_string(), log),
                (
                    service_queue_for(TASK_CREATED_QUEUE, role.name()),
                    Arc::clone(&mirror),
                ),
                (service_queue_for(TASK_UPDATED_QUEUE, role.name()), mirror),
            ],
        },
        state,
    })
}

/// Load configuration, start the service and run it until Ctrl+C.
///
/// Startup failures (bad config, unreachable broker, topology conflict,
/// port in use) are returned so the binary exits non-zero.
pub async fn run(role: Role) -> Result<(), ServiceError> {
    let config_path = config_path_from_args(std::env::args().skip(1));
    let config = Config::load(config_path.as_deref())?;
    let connector = connector_for(&config.broker)?;

    let parts = build(role, &config, connector)?;
    let running = parts.runner.start(parts.spec).await?;
    running.run_until_ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tasks::NewTask;
    use std::time::Duration;

    fn test_config() -> Config {
        let mut config = Config::for_test();
        config.broker.connect_retries = 0;
        config.broker.publish_retries = 0;
        config.broker.requeue_delay_ms = 5;
        config
    }

    #[tokio::test]
    async fn test_start_subscribes_and_listens() {
        let broker = InMemoryBroker::new();
        let parts = build(Role::Leader, &test_config(), Arc::new(broker.connector())).unwrap();

        let running = parts.runner.start(parts.spec).await.unwrap();

        assert_eq!(running.name(), "leader");
        assert_ne!(running.local_addr().port(), 0);
        assert_eq!(
            running.subscribed_queues(),
            vec![
                "task_created",
                "task_updated",
                "task_created.leader",
                "task_updated.leader"
            ]
        );
        assert!(broker.queue_names().contains(&"task_created.dlq".to_string()));

        running.shutdown().await.unwrap();
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_start_fails_when_broker_unreachable() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let parts = build(Role::Member, &test_config(), Arc::new(broker.connector())).unwrap();

        let err = parts.runner.start(parts.spec).await.err().unwrap();

        assert!(matches!(err, ServiceError::Bus(BusError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_created_task_reaches_projection() {
        let broker = InMemoryBroker::new();
        let parts = build(Role::Leader, &test_config(), Arc::new(broker.connector())).unwrap();
        let state = parts.state.clone();
        let running = parts.runner.start(parts.spec).await.unwrap();

        let task = state
            .tasks
            .create_task(NewTask {
                title: "Draft spec".into(),
                assigned_to: "alice".into(),
                created_by: "lead".into(),
                deadline: None,
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while state.projection.get(&task.id).await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        running.shutdown().await.unwrap();
    }

    #[test]
    fn test_memory_connector_from_config() {
        let config = Config::for_test();
        let connector = connector_for(&config.broker).unwrap();
        assert_eq!(connector.describe(), "memory://");
    }
}
