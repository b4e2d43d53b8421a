use crate::helpers::{
    connection_service, eventually, fast_subscription, forward_envelopes, forward_failures,
    next_envelope, random_queue_name, transitions_until, FakeBroker,
};
use resilient_consumer::consumers::{
    IgnoreFailures, MessageEnvelope, SubscriptionFactory, SubscriptionSettings,
    SubscriptionState, Transition,
};
use resilient_consumer::transport::QueueOptions;
use resilient_consumer::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn every_published_message_is_delivered_and_acked() {
    // Arrange
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 4);
    let queue_name = random_queue_name();
    let subscription = SubscriptionFactory::new(service.clone())
        .create(
            &queue_name,
            true,
            false,
            260,
            Duration::from_secs(2),
            Duration::from_secs(4),
        )
        .unwrap();
    let acked = Arc::new(AtomicUsize::new(0));
    let handler = {
        let acked = acked.clone();
        move |envelope: MessageEnvelope| {
            let acked = acked.clone();
            async move {
                envelope.ack().await.unwrap();
                acked.fetch_add(1, Ordering::SeqCst);
            }
        }
    };

    // Act
    subscription
        .start_consuming(handler, IgnoreFailures)
        .await
        .unwrap();
    for i in 0..10 {
        broker.publish(&queue_name, format!("message {i}"));
    }
    eventually(|| acked.load(Ordering::SeqCst) == 10).await;
    subscription.stop_consuming().await;

    // Assert
    assert_eq!(broker.acked().len(), 10);
    assert_eq!(subscription.in_flight(), 0);
    assert_eq!(subscription.state(), SubscriptionState::Stopped);
    assert_eq!(broker.prefetch_counts(), vec![260]);
    assert_eq!(
        broker.declared(&queue_name),
        Some(QueueOptions {
            durable: true,
            auto_delete: false
        })
    );
}

#[tokio::test]
async fn an_empty_queue_name_is_rejected_without_touching_the_broker() {
    let broker = FakeBroker::new();
    let factory = SubscriptionFactory::new(connection_service(&broker, 4));

    let outcome = factory.create(
        "",
        true,
        false,
        260,
        Duration::from_secs(2),
        Duration::from_secs(4),
    );

    assert!(matches!(outcome, Err(Error::Configuration(_))));
    assert_eq!(broker.connection_attempts(), 0);
}

#[tokio::test]
async fn invalid_subscription_parameters_are_rejected_synchronously() {
    let broker = FakeBroker::new();
    let factory = SubscriptionFactory::new(connection_service(&broker, 4));
    let period = Duration::from_secs(2);
    let delay = Duration::from_secs(4);

    let invalid = [
        factory.create("   ", true, false, 260, period, delay),
        factory.create("orders", true, false, -1, period, delay),
        factory.create("orders", true, false, 70_000, period, delay),
        factory.create("orders", true, false, 260, Duration::ZERO, delay),
        factory.create("orders", true, false, 260, period, Duration::ZERO),
    ];

    for outcome in invalid {
        assert!(matches!(outcome, Err(Error::Configuration(_))));
    }
    assert_eq!(broker.connection_attempts(), 0);
}

#[tokio::test]
async fn a_new_subscription_is_idle_and_stopping_it_is_a_no_op() {
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 4);
    let subscription = fast_subscription(&service, "orders");

    subscription.stop_consuming().await;

    assert_eq!(subscription.state(), SubscriptionState::Idle);
    assert_eq!(subscription.queue_name(), "orders");
    assert_eq!(broker.connection_attempts(), 0);
}

#[tokio::test]
async fn starting_goes_through_starting_to_consuming() {
    // Arrange
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 4);
    let subscription = fast_subscription(&service, &random_queue_name());
    let mut transitions = subscription.transitions();
    let (handler, _envelopes) = forward_envelopes();

    // Act
    subscription
        .start_consuming(handler, IgnoreFailures)
        .await
        .unwrap();

    // Assert
    let seen = transitions_until(&mut transitions, SubscriptionState::Consuming).await;
    assert_eq!(
        seen,
        vec![
            Transition {
                from: SubscriptionState::Idle,
                to: SubscriptionState::Starting
            },
            Transition {
                from: SubscriptionState::Starting,
                to: SubscriptionState::Consuming
            },
        ]
    );
    assert_eq!(service.open_channels(), 1);
}

#[tokio::test]
async fn starting_a_running_subscription_is_an_invalid_state() {
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 4);
    let subscription = fast_subscription(&service, &random_queue_name());
    let (handler, _envelopes) = forward_envelopes();
    subscription
        .start_consuming(handler, IgnoreFailures)
        .await
        .unwrap();

    let (handler, _envelopes) = forward_envelopes();
    let outcome = subscription.start_consuming(handler, IgnoreFailures).await;

    assert!(matches!(
        outcome,
        Err(Error::InvalidState {
            operation: "start",
            state: SubscriptionState::Consuming
        })
    ));
    assert_eq!(service.open_channels(), 1);
}

#[tokio::test]
async fn a_refused_consumer_registration_leaves_the_subscription_idle() {
    // Arrange
    let broker = FakeBroker::new();
    broker.set_refuse_consumers(true);
    let service = connection_service(&broker, 4);
    let queue_name = random_queue_name();
    let subscription = fast_subscription(&service, &queue_name);
    let (handler, _envelopes) = forward_envelopes();

    // Act
    let outcome = subscription.start_consuming(handler, IgnoreFailures).await;

    // Assert
    match outcome {
        Err(Error::ConsumerRegistration { queue, .. }) => assert_eq!(queue, queue_name),
        other => panic!("Expected a consumer registration error, got {other:?}"),
    }
    assert_eq!(subscription.state(), SubscriptionState::Idle);
    assert_eq!(service.open_channels(), 0);
}

#[tokio::test]
async fn an_unreachable_broker_fails_the_start_with_a_connection_error() {
    let broker = FakeBroker::new();
    broker.set_unreachable(true);
    let service = connection_service(&broker, 4);
    let subscription = fast_subscription(&service, &random_queue_name());
    let (handler, _envelopes) = forward_envelopes();

    let outcome = subscription.start_consuming(handler, IgnoreFailures).await;

    assert!(matches!(outcome, Err(Error::Connection(_))));
    assert_eq!(subscription.state(), SubscriptionState::Idle);
}

#[tokio::test]
async fn starting_fails_with_capacity_exceeded_when_no_channel_is_left() {
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 1);
    let _held = service.acquire_channel().await.unwrap();
    let subscription = fast_subscription(&service, &random_queue_name());
    let (handler, _envelopes) = forward_envelopes();

    let outcome = subscription.start_consuming(handler, IgnoreFailures).await;

    assert!(matches!(
        outcome,
        Err(Error::CapacityExceeded { max_channels: 1 })
    ));
    assert_eq!(subscription.state(), SubscriptionState::Idle);
}

#[tokio::test]
async fn stopping_waits_for_in_flight_handlers_and_no_handler_runs_afterwards() {
    // Arrange
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 4);
    let queue_name = random_queue_name();
    let subscription = fast_subscription(&service, &queue_name);
    let started = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let handler = {
        let started = started.clone();
        let completed = completed.clone();
        move |envelope: MessageEnvelope| {
            let started = started.clone();
            let completed = completed.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                envelope.ack().await.unwrap();
                completed.fetch_add(1, Ordering::SeqCst);
            }
        }
    };
    subscription
        .start_consuming(handler, IgnoreFailures)
        .await
        .unwrap();
    for i in 0..5 {
        broker.publish(&queue_name, format!("slow {i}"));
    }
    eventually(|| subscription.in_flight() == 5).await;

    // Act
    subscription.stop_consuming().await;

    // Assert
    assert_eq!(completed.load(Ordering::SeqCst), 5);
    assert_eq!(subscription.in_flight(), 0);
    assert_eq!(broker.acked().len(), 5);
    assert_eq!(broker.active_consumers(&queue_name), 0);

    broker.publish(&queue_name, "after stop");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(started.load(Ordering::SeqCst), 5);
    assert_eq!(broker.pending(&queue_name), 1);
}

#[tokio::test]
async fn a_stopped_subscription_restarts_on_the_same_channel() {
    // Arrange
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 4);
    let queue_name = random_queue_name();
    let subscription = fast_subscription(&service, &queue_name);
    let (handler, _envelopes) = forward_envelopes();
    subscription
        .start_consuming(handler, IgnoreFailures)
        .await
        .unwrap();
    subscription.stop_consuming().await;
    broker.publish(&queue_name, "while stopped");

    // Act
    let (handler, mut envelopes) = forward_envelopes();
    subscription
        .start_consuming(handler, IgnoreFailures)
        .await
        .unwrap();

    // Assert
    let envelope = next_envelope(&mut envelopes).await;
    assert_eq!(envelope.payload(), b"while stopped");
    envelope.ack().await.unwrap();
    assert_eq!(broker.channels_created(), 1);
    assert_eq!(service.open_channels(), 1);
    assert_eq!(subscription.state(), SubscriptionState::Consuming);
}

#[tokio::test]
async fn dispose_releases_the_channel_and_can_be_called_twice() {
    // Arrange
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 4);
    let subscription = fast_subscription(&service, &random_queue_name());
    let (handler, _envelopes) = forward_envelopes();
    subscription
        .start_consuming(handler, IgnoreFailures)
        .await
        .unwrap();

    // Act
    subscription.dispose().await;
    subscription.dispose().await;

    // Assert
    assert_eq!(subscription.state(), SubscriptionState::Disposed);
    assert_eq!(service.open_channels(), 0);
    let (handler, _envelopes) = forward_envelopes();
    assert!(matches!(
        subscription.start_consuming(handler, IgnoreFailures).await,
        Err(Error::InvalidState {
            operation: "start",
            state: SubscriptionState::Disposed
        })
    ));
}

#[tokio::test]
async fn an_idle_subscription_can_be_disposed() {
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 4);
    let subscription = fast_subscription(&service, &random_queue_name());

    subscription.dispose().await;

    assert_eq!(subscription.state(), SubscriptionState::Disposed);
    assert_eq!(broker.connection_attempts(), 0);
}

#[tokio::test]
async fn in_auto_ack_mode_settling_is_local() {
    // Arrange
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 4);
    let queue_name = random_queue_name();
    let settings = SubscriptionSettings::new(&queue_name).with_auto_ack(true);
    let subscription = SubscriptionFactory::new(service.clone())
        .create_from_settings(settings)
        .unwrap();
    let (handler, mut envelopes) = forward_envelopes();
    subscription
        .start_consuming(handler, IgnoreFailures)
        .await
        .unwrap();

    // Act
    broker.publish(&queue_name, "fire and forget");
    let envelope = next_envelope(&mut envelopes).await;

    // Assert
    envelope.ack().await.unwrap();
    assert!(matches!(
        envelope.nack(true).await,
        Err(Error::AlreadySettled { .. })
    ));
    assert!(broker.acked().is_empty());
    assert!(broker.nacked().is_empty());
    subscription.dispose().await;
}

#[tokio::test]
async fn run_until_shutdown_consumes_until_the_shutdown_signal_then_disposes() {
    // Arrange
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 4);
    let queue_name = random_queue_name();
    let subscription = Arc::new(fast_subscription(&service, &queue_name));
    let (shutdown, shutdown_signal) = tokio::sync::oneshot::channel::<()>();
    let (on_failure, _failures) = forward_failures();
    let handler = |envelope: MessageEnvelope| async move {
        envelope.ack().await.unwrap();
    };

    // Act
    let handle = tokio::spawn({
        let subscription = subscription.clone();
        async move {
            subscription
                .run_until_shutdown(handler, on_failure, async move {
                    let _ = shutdown_signal.await;
                })
                .await
        }
    });
    eventually(|| subscription.state() == SubscriptionState::Consuming).await;
    broker.publish(&queue_name, "before shutdown");
    eventually(|| broker.acked().len() == 1).await;
    shutdown.send(()).unwrap();

    // Assert
    handle.await.unwrap().unwrap();
    assert_eq!(subscription.state(), SubscriptionState::Disposed);
    assert_eq!(service.open_channels(), 0);
}

#[tokio::test]
async fn messages_buffered_when_stopping_are_delivered_after_a_restart() {
    // Arrange
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 4);
    let queue_name = random_queue_name();
    let subscription = fast_subscription(&service, &queue_name);
    let handler = |envelope: MessageEnvelope| async move {
        let _ = envelope.ack().await;
    };
    subscription
        .start_consuming(handler, IgnoreFailures)
        .await
        .unwrap();
    for i in 0..20 {
        broker.publish(&queue_name, format!("burst {i}"));
    }

    // Act
    subscription.stop_consuming().await;
    subscription
        .start_consuming(handler, IgnoreFailures)
        .await
        .unwrap();

    // Assert
    eventually(|| broker.acked().len() == 20).await;
    assert_eq!(broker.pending(&queue_name), 0);
    assert_eq!(broker.channels_created(), 1);
    subscription.dispose().await;
}

#[tokio::test]
async fn concurrent_stops_all_return_once_in_flight_handlers_completed() {
    // Arrange
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 4);
    let queue_name = random_queue_name();
    let subscription = fast_subscription(&service, &queue_name);
    let handler = |envelope: MessageEnvelope| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        envelope.ack().await.unwrap();
    };
    subscription
        .start_consuming(handler, IgnoreFailures)
        .await
        .unwrap();
    for i in 0..3 {
        broker.publish(&queue_name, format!("slow {i}"));
    }
    eventually(|| subscription.in_flight() == 3).await;

    // Act
    let (first, second) = tokio::join!(
        async {
            subscription.stop_consuming().await;
            subscription.in_flight()
        },
        async {
            subscription.stop_consuming().await;
            subscription.in_flight()
        },
    );

    // Assert
    assert_eq!(first, 0);
    assert_eq!(second, 0);
    assert_eq!(broker.acked().len(), 3);
    assert_eq!(subscription.state(), SubscriptionState::Stopped);
}

#[tokio::test]
async fn dropping_a_running_subscription_stops_its_background_activity() {
    // Arrange
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 4);
    let subscription = fast_subscription(&service, &random_queue_name());
    let (handler, _envelopes) = forward_envelopes();
    subscription
        .start_consuming(handler, IgnoreFailures)
        .await
        .unwrap();
    broker.set_unreachable(true);
    broker.drop_connections();
    eventually(|| subscription.state() == SubscriptionState::Resubscribing).await;

    // Act
    drop(subscription);

    // Assert
    tokio::time::sleep(Duration::from_millis(100)).await;
    let attempts = broker.connection_attempts();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.connection_attempts(), attempts);
}
