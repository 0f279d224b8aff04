mod common;

use dimse::{DimseError, DimseStatus, EchoHandler, ServiceRegistry};

use common::{local_config, scu, shutdown, start_listener};

#[tokio::test]
async fn echo_round_trip() {
    let registry = ServiceRegistry::builder().register(EchoHandler).unwrap().build();
    let (listener, node) = start_listener(local_config("ECHO_SCP"), registry).await;

    let mut client = scu("ECHO_SCU");
    let status = tokio_test::assert_ok!(client.echo(&node).await);
    assert_eq!(status, DimseStatus::Success);

    // associations are released, so a second echo gets a fresh slot
    assert!(client.verify_with_retries(&node, 1).await.unwrap());

    shutdown(listener).await;
}

#[tokio::test]
async fn echo_without_handler_aborts() {
    let registry = ServiceRegistry::builder().build();
    let (listener, node) = start_listener(local_config("NO_ECHO"), registry).await;

    let err = scu("ECHO_SCU").echo(&node).await.unwrap_err();
    assert!(
        matches!(err, DimseError::Aborted | DimseError::Network(_)),
        "unexpected error: {}",
        err
    );

    shutdown(listener).await;
}

#[tokio::test]
async fn echo_to_stopped_listener_is_recoverable() {
    let registry = ServiceRegistry::builder().register(EchoHandler).unwrap().build();
    let (listener, node) = start_listener(local_config("ECHO_SCP"), registry).await;
    shutdown(listener).await;

    let err = tokio_test::assert_err!(scu("ECHO_SCU").echo(&node).await);
    assert!(err.is_recoverable(), "unexpected error: {}", err);
}
