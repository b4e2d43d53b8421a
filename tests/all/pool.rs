use crate::helpers::{connection_service, connection_settings, eventually, FakeBroker};
use resilient_consumer::pool::ConnectionService;
use resilient_consumer::transport::BrokerChannel;
use resilient_consumer::Error;

#[tokio::test]
async fn the_connection_is_established_lazily_and_shared_by_all_channels() {
    // Arrange
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 4);
    assert_eq!(broker.connection_attempts(), 0);
    assert!(!service.is_connected());

    // Act
    let first = service.acquire_channel().await.unwrap();
    let second = service.acquire_channel().await.unwrap();

    // Assert
    assert_eq!(broker.connection_attempts(), 1);
    assert_eq!(broker.channels_created(), 2);
    assert!(service.is_connected());
    assert_eq!(service.open_channels(), 2);
    assert!(first.is_usable());
    assert!(second.is_usable());
}

#[tokio::test]
async fn ensure_connected_is_a_no_op_when_already_connected() {
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 1);

    service.ensure_connected().await.unwrap();
    service.ensure_connected().await.unwrap();

    assert_eq!(broker.connection_attempts(), 1);
    assert!(service.is_connected());
    assert_eq!(service.open_channels(), 0);
}

#[tokio::test]
async fn concurrent_requests_beyond_max_channels_fail_fast_with_capacity_exceeded() {
    // Arrange
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 1);

    // Act
    let (first, second) = tokio::join!(service.acquire_channel(), service.acquire_channel());

    // Assert
    let outcomes = [first, second];
    let granted = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    let refused = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Err(Error::CapacityExceeded { max_channels: 1 })))
        .count();
    assert_eq!(granted, 1);
    assert_eq!(refused, 1);
    assert_eq!(service.open_channels(), 1);
}

#[tokio::test]
async fn releasing_a_channel_frees_its_slot_and_closes_it() {
    // Arrange
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 1);
    let channel = service.acquire_channel().await.unwrap();

    // Act
    service.release_channel(&channel).await;

    // Assert
    assert!(!channel.is_usable());
    assert!(!channel.raw().is_open());
    assert_eq!(service.open_channels(), 0);
    let replacement = service.acquire_channel().await.unwrap();
    assert!(replacement.is_usable());
    assert_eq!(broker.channels_created(), 2);
}

#[tokio::test]
async fn releasing_a_channel_twice_frees_a_single_slot() {
    // Arrange
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 1);
    let channel = service.acquire_channel().await.unwrap();

    // Act
    service.release_channel(&channel).await;
    service.release_channel(&channel).await;

    // Assert
    let _held = service.acquire_channel().await.unwrap();
    let outcome = service.acquire_channel().await;
    assert!(matches!(
        outcome,
        Err(Error::CapacityExceeded { max_channels: 1 })
    ));
}

#[tokio::test]
async fn an_unreachable_broker_surfaces_a_connection_error_without_leaking_slots() {
    // Arrange
    let broker = FakeBroker::new();
    broker.set_unreachable(true);
    let service = connection_service(&broker, 1);

    // Act
    let outcome = service.acquire_channel().await;

    // Assert
    assert!(matches!(outcome, Err(Error::Connection(_))));
    assert!(!service.is_connected());
    assert_eq!(service.open_channels(), 0);

    broker.set_unreachable(false);
    service.acquire_channel().await.unwrap();
    assert_eq!(broker.connection_attempts(), 2);
}

#[tokio::test]
async fn a_dropped_connection_is_reported_and_replaced_on_the_next_channel_request() {
    // Arrange
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 2);
    let channel = service.acquire_channel().await.unwrap();
    assert!(service.is_connected());

    // Act
    broker.drop_connections();

    // Assert
    eventually(|| !service.is_connected()).await;
    assert!(!channel.is_usable());

    service.release_channel(&channel).await;
    let replacement = service.acquire_channel().await.unwrap();
    assert!(replacement.is_usable());
    assert!(service.is_connected());
    assert_eq!(broker.connection_attempts(), 2);
}

#[tokio::test]
async fn channel_requests_fail_after_dispose() {
    // Arrange
    let broker = FakeBroker::new();
    let service = connection_service(&broker, 2);
    let channel = service.acquire_channel().await.unwrap();

    // Act
    service.dispose().await;
    service.dispose().await;

    // Assert
    assert!(!service.is_connected());
    assert!(!channel.raw().is_open());
    assert!(matches!(
        service.acquire_channel().await,
        Err(Error::Connection(_))
    ));
}

#[test]
fn invalid_connection_settings_are_rejected_upfront() {
    let broker = FakeBroker::new();

    let outcome = ConnectionService::new(broker.clone(), &connection_settings(0));

    assert!(matches!(outcome, Err(Error::Configuration(_))));
    assert_eq!(broker.connection_attempts(), 0);
}
