use super::*;
use crate::bus::topology::{Topology, TASK_CREATED_QUEUE, TASK_EXCHANGE};
use std::time::Duration;

async fn declared_channel(broker: &InMemoryBroker) -> Arc<dyn BrokerChannel> {
    let channel = broker.connector().connect().await.unwrap();
    Topology::task_events()
        .declare(channel.as_ref())
        .await
        .unwrap();
    channel
}

fn persistent() -> MessageProperties {
    MessageProperties {
        persistent: true,
        ..Default::default()
    }
}

async fn next(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("timed out waiting for delivery")
        .expect("stream ended")
        .expect("delivery error")
}

#[tokio::test]
async fn test_direct_routing_by_key() {
    let broker = InMemoryBroker::new();
    let channel = declared_channel(&broker).await;

    channel
        .publish(TASK_EXCHANGE, "task.created", b"{}", &persistent())
        .await
        .unwrap();
    channel
        .publish(TASK_EXCHANGE, "task.deleted", b"{}", &persistent())
        .await
        .unwrap();

    assert_eq!(broker.ready_count("task_created"), 1);
    assert_eq!(broker.ready_count("task_updated"), 0);
}

#[tokio::test]
async fn test_unreachable_broker_refuses_connections() {
    let broker = InMemoryBroker::new();
    broker.set_reachable(false);

    let err = broker.connector().connect().await.err().unwrap();
    assert!(matches!(err, BusError::Unavailable(_)));
    assert_eq!(broker.connections_opened(), 0);
}

#[tokio::test]
async fn test_conflicting_exchange_closes_channel() {
    let broker = InMemoryBroker::new();
    let channel = declared_channel(&broker).await;

    let err = channel
        .declare_exchange(&ExchangeSpec::durable(TASK_EXCHANGE, ExchangeKind::Topic))
        .await
        .unwrap_err();

    assert!(matches!(err, BusError::TopologyConflict { entity: "exchange", .. }));
    assert!(!channel.is_open());
    assert!(matches!(
        channel.declare_queue(&QueueSpec::durable("other")).await,
        Err(BusError::ChannelClosed(_))
    ));
}

#[tokio::test]
async fn test_consume_and_ack() {
    let broker = InMemoryBroker::new();
    let channel = declared_channel(&broker).await;
    let mut stream = channel.consume(TASK_CREATED_QUEUE, "c1", 1).await.unwrap();

    channel
        .publish(TASK_EXCHANGE, "task.created", b"one", &persistent())
        .await
        .unwrap();

    let delivery = next(&mut stream).await;
    assert_eq!(delivery.body, b"one");
    assert_eq!(delivery.routing_key, "task.created");
    assert!(!delivery.redelivered);
    assert_eq!(broker.unacked_count(TASK_CREATED_QUEUE), 1);

    delivery.ack().await.unwrap();
    assert_eq!(broker.unacked_count(TASK_CREATED_QUEUE), 0);
    assert_eq!(broker.ready_count(TASK_CREATED_QUEUE), 0);
}

#[tokio::test]
async fn test_double_ack_is_rejected() {
    let broker = InMemoryBroker::new();
    let channel = declared_channel(&broker).await;
    let mut stream = channel.consume(TASK_CREATED_QUEUE, "c1", 1).await.unwrap();
    channel
        .publish(TASK_EXCHANGE, "task.created", b"one", &persistent())
        .await
        .unwrap();

    let delivery = next(&mut stream).await;
    delivery.ack().await.unwrap();
    assert!(matches!(delivery.ack().await, Err(BusError::Ack(_))));
}

#[tokio::test]
async fn test_prefetch_holds_back_next_message() {
    let broker = InMemoryBroker::new();
    let channel = declared_channel(&broker).await;
    let mut stream = channel.consume(TASK_CREATED_QUEUE, "c1", 1).await.unwrap();

    for body in [b"one", b"two"] {
        channel
            .publish(TASK_EXCHANGE, "task.created", body, &persistent())
            .await
            .unwrap();
    }

    let first = next(&mut stream).await;
    let pending = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(pending.is_err(), "second delivery must wait for the first ack");
    assert_eq!(broker.ready_count(TASK_CREATED_QUEUE), 1);

    first.ack().await.unwrap();
    let second = next(&mut stream).await;
    assert_eq!(second.body, b"two");
}

#[tokio::test]
async fn test_nack_requeue_returns_to_head() {
    let broker = InMemoryBroker::new();
    let channel = declared_channel(&broker).await;
    let mut stream = channel.consume(TASK_CREATED_QUEUE, "c1", 1).await.unwrap();

    for body in [b"one", b"two"] {
        channel
            .publish(TASK_EXCHANGE, "task.created", body, &persistent())
            .await
            .unwrap();
    }

    let first = next(&mut stream).await;
    first.nack(true).await.unwrap();

    let again = next(&mut stream).await;
    assert_eq!(again.body, b"one");
    assert!(again.redelivered);
}

#[tokio::test]
async fn test_nack_without_requeue_discards() {
    let broker = InMemoryBroker::new();
    let channel = declared_channel(&broker).await;
    let mut stream = channel.consume(TASK_CREATED_QUEUE, "c1", 1).await.unwrap();
    channel
        .publish(TASK_EXCHANGE, "task.created", b"one", &persistent())
        .await
        .unwrap();

    next(&mut stream).await.nack(false).await.unwrap();

    assert_eq!(broker.ready_count(TASK_CREATED_QUEUE), 0);
    assert_eq!(broker.unacked_count(TASK_CREATED_QUEUE), 0);
}

#[tokio::test]
async fn test_closing_channel_requeues_unacked() {
    let broker = InMemoryBroker::new();
    let consumer_channel = declared_channel(&broker).await;
    let publisher_channel = broker.connector().connect().await.unwrap();
    let mut stream = consumer_channel
        .consume(TASK_CREATED_QUEUE, "c1", 1)
        .await
        .unwrap();

    publisher_channel
        .publish(TASK_EXCHANGE, "task.created", b"one", &persistent())
        .await
        .unwrap();
    let delivery = next(&mut stream).await;

    consumer_channel.close().await;

    assert!(matches!(
        stream.next().await,
        Some(Err(BusError::ChannelClosed(_)))
    ));
    assert!(stream.next().await.is_none());
    assert!(matches!(delivery.ack().await, Err(BusError::ChannelClosed(_))));

    let requeued = broker.ready_messages(TASK_CREATED_QUEUE);
    assert_eq!(requeued.len(), 1);
    assert!(requeued[0].redelivered);
}

#[tokio::test]
async fn test_restart_keeps_durable_state_and_persistent_messages() {
    let broker = InMemoryBroker::new();
    let channel = declared_channel(&broker).await;
    channel
        .declare_queue(&QueueSpec {
            name: "scratch".into(),
            durable: false,
        })
        .await
        .unwrap();

    channel
        .publish(TASK_EXCHANGE, "task.created", b"kept", &persistent())
        .await
        .unwrap();
    channel
        .publish(
            TASK_EXCHANGE,
            "task.created",
            b"lost",
            &MessageProperties::default(),
        )
        .await
        .unwrap();

    broker.restart();

    assert!(!channel.is_open());
    assert_eq!(broker.queue_names(), vec!["task_created", "task_updated"]);
    assert_eq!(broker.binding_count(), 2);
    let messages = broker.ready_messages(TASK_CREATED_QUEUE);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, b"kept");
}

#[tokio::test]
async fn test_sever_connections_closes_everything() {
    let broker = InMemoryBroker::new();
    let a = broker.connector().connect().await.unwrap();
    let b = broker.connector().connect().await.unwrap();
    assert_eq!(broker.open_channel_count(), 2);

    broker.sever_connections();

    assert!(!a.is_open());
    assert!(!b.is_open());
    assert_eq!(broker.open_channel_count(), 0);
}

#[tokio::test]
async fn test_injected_publish_failure() {
    let broker = InMemoryBroker::new();
    let channel = declared_channel(&broker).await;
    broker.fail_next_publishes(1);

    let err = channel
        .publish(TASK_EXCHANGE, "task.created", b"x", &persistent())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Publish(_)));
    assert!(!channel.is_open());

    let fresh = broker.connector().connect().await.unwrap();
    fresh
        .publish(TASK_EXCHANGE, "task.created", b"x", &persistent())
        .await
        .unwrap();
    assert_eq!(broker.ready_count(TASK_CREATED_QUEUE), 1);
}

#[tokio::test]
async fn test_bind_to_missing_exchange_fails() {
    let broker = InMemoryBroker::new();
    let channel = broker.connector().connect().await.unwrap();
    channel
        .declare_queue(&QueueSpec::durable("orphan"))
        .await
        .unwrap();

    let err = channel
        .bind_queue(&Binding::new("orphan", "nowhere", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::NotFound(_)));
}
