//! End-to-end scenarios over the in-memory plugin pair.


use std::sync::Arc;
use std::time::Duration;

use ilp_stream::client::{create_connection, ConnectOptions};
use ilp_stream::plugin::Plugin;
use ilp_stream::receipt::{create_receipt, verify_receipt};
use ilp_stream::server::StreamServer;
use ilp_stream::stream::ReceiveMax;
use ilp_stream::ConnectionError;

use test_helpers::plugin_pair;

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

async fn with_timeout<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .expect("test timed out")
}

/// S1: the 58-byte receipt fixture round-trips and verifies only under the
/// signing secret.
#[test]
fn receipt_fixture() {
    let blob = create_receipt(&[0u8; 16], 1, 500, &[0u8; 32]).unwrap();
    assert_eq!(blob.len(), 58);
    assert!(verify_receipt(&blob, &[0u8; 32]));

    let random_secret = ilp_stream::crypto::random::random_32().unwrap();
    assert!(!verify_receipt(&blob, &random_secret));
}

/// S2: a path that delivers nothing fails the connect with the exact
/// minimum-precision message.
#[tokio::test]
async fn min_precision_failure() {
    let (client_plugin, server_plugin) = plugin_pair(0.0, None);
    let server = StreamServer::new(server_plugin as Arc<dyn Plugin>, [7u8; 32]);
    server.listen().await.unwrap();
    let (destination, secret) = server.generate_address_and_secret(None).await.unwrap();

    let err = with_timeout(create_connection(
        client_plugin as Arc<dyn Plugin>,
        ConnectOptions::new(destination, secret),
    ))
    .await
    .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Error connecting: Unable to establish connection, no packets meeting the minimum \
         exchange precision of 3 digits made it through the path."
    );
}

/// S3: connection tags are restricted to address-safe characters.
#[tokio::test]
async fn tag_validation() {
    let (_, server_plugin) = plugin_pair(1.0, None);
    let server = StreamServer::new(server_plugin as Arc<dyn Plugin>, [7u8; 32]);
    server.listen().await.unwrap();

    let err = server
        .generate_address_and_secret(Some("invalid\n"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::InvalidConnectionTag));
    assert_eq!(
        err.to_string(),
        "connectionTag can only include ASCII characters a-z, A-Z, 0-9, \"_\", \"-\", and \"~\""
    );

    assert!(server
        .generate_address_and_secret(Some("valid_tag-123~x"))
        .await
        .is_ok());
}

/// S4: tampering with the destination token invalidates the derived secret;
/// the connect fails and the server never surfaces a connection.
#[tokio::test]
async fn tampered_destination() {
    let (client_plugin, server_plugin) = plugin_pair(0.5, None);
    let server = StreamServer::new(server_plugin as Arc<dyn Plugin>, [7u8; 32]);
    server.listen().await.unwrap();
    let (destination, secret) = server.generate_address_and_secret(None).await.unwrap();

    let err = with_timeout(create_connection(
        client_plugin as Arc<dyn Plugin>,
        ConnectOptions::new(format!("{destination}456"), secret),
    ))
    .await
    .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Error connecting: Unable to establish connection, no packets meeting the minimum \
         exchange precision of 3 digits made it through the path."
    );
    assert_eq!(server.connection_count(), 0);
}

/// S5: money is scaled by the path's exchange rate end to end.
#[tokio::test]
async fn exchange_rate_delivery() {
    let (client_plugin, server_plugin) = plugin_pair(0.5, None);
    let server = StreamServer::new(server_plugin as Arc<dyn Plugin>, [7u8; 32]);
    server.listen().await.unwrap();
    let (destination, secret) = server.generate_address_and_secret(None).await.unwrap();

    let receiver = tokio::spawn({
        let server = server.clone();
        async move {
            let connection = server.accept_connection().await.expect("connection");
            let stream = connection.accept_stream().await.expect("stream");
            stream.set_receive_max(ReceiveMax::Unbounded).await;
            stream.receive_total(50).await.unwrap();
            (connection, stream)
        }
    });

    let connection = with_timeout(create_connection(
        client_plugin as Arc<dyn Plugin>,
        ConnectOptions::new(destination, secret),
    ))
    .await
    .unwrap();
    assert_eq!(connection.exchange_rate().await, Some(0.5));

    let stream = connection.create_stream().await;
    with_timeout(stream.send_total(100)).await.unwrap();

    let (server_connection, server_stream) = with_timeout(receiver).await.unwrap();
    assert_eq!(stream.total_sent().await, 100);
    assert_eq!(stream.total_delivered().await, 50);
    assert_eq!(server_stream.total_received().await, 50);
    assert_eq!(connection.total_sent().await, 100);
    assert_eq!(connection.total_delivered().await, 50);
    assert_eq!(server_connection.total_received().await, 50);
}

/// S6: bytes written before `end` arrive intact and in order, and the
/// receiver observes the end of stream.
#[tokio::test]
async fn data_roundtrip() {
    let (client_plugin, server_plugin) = plugin_pair(1.0, None);
    let server = StreamServer::new(server_plugin as Arc<dyn Plugin>, [7u8; 32]);
    server.listen().await.unwrap();
    let (destination, secret) = server.generate_address_and_secret(None).await.unwrap();

    let receiver = tokio::spawn({
        let server = server.clone();
        async move {
            let connection = server.accept_connection().await.expect("connection");
            let stream = connection.accept_stream().await.expect("stream");
            stream.read_to_end().await
        }
    });

    let connection = with_timeout(create_connection(
        client_plugin as Arc<dyn Plugin>,
        ConnectOptions::new(destination, secret),
    ))
    .await
    .unwrap();

    let message = b"hello\nhere is some more data";
    let stream = connection.create_stream().await;
    stream.write(message).await.unwrap();
    with_timeout(stream.end()).await.unwrap();

    let received = with_timeout(receiver).await.unwrap();
    assert_eq!(received, message);
}

/// Flow control: the receiver's cap bounds what it ever receives.
#[tokio::test]
async fn receive_max_is_never_exceeded() {
    let (client_plugin, server_plugin) = plugin_pair(1.0, None);
    let server = StreamServer::new(server_plugin as Arc<dyn Plugin>, [7u8; 32]);
    server.listen().await.unwrap();
    let (destination, secret) = server.generate_address_and_secret(None).await.unwrap();

    let receiver = tokio::spawn({
        let server = server.clone();
        async move {
            let connection = server.accept_connection().await.expect("connection");
            let stream = connection.accept_stream().await.expect("stream");
            stream.set_receive_max(ReceiveMax::Finite(30)).await;
            stream.receive_total(30).await.unwrap();
            stream
        }
    });

    let connection = with_timeout(create_connection(
        client_plugin as Arc<dyn Plugin>,
        ConnectOptions::new(destination, secret),
    ))
    .await
    .unwrap();
    let stream = connection.create_stream().await;

    // The sender wants 100 but the receiver only allows 30; the send can
    // never complete.
    let send = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.send_total(100).await })
    };
    let server_stream = with_timeout(receiver).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(server_stream.total_received().await, 30);
    assert_eq!(stream.total_sent().await, 30);
    assert!(!send.is_finished());
    send.abort();
}

/// MPPA discovery: `F08` rejects shrink packets until money flows, the
/// total is split across several Prepares, and everything still arrives.
#[tokio::test]
async fn max_packet_amount_discovery() {
    let (client_plugin, server_plugin) = plugin_pair(1.0, Some(5000));
    let server = StreamServer::new(server_plugin as Arc<dyn Plugin>, [7u8; 32]);
    server.listen().await.unwrap();
    let (destination, secret) = server.generate_address_and_secret(None).await.unwrap();

    let receiver = tokio::spawn({
        let server = server.clone();
        async move {
            let connection = server.accept_connection().await.expect("connection");
            let stream = connection.accept_stream().await.expect("stream");
            stream.set_receive_max(ReceiveMax::Unbounded).await;
            stream.receive_total(12_000).await.unwrap();
            stream.total_received().await
        }
    });

    let connection = with_timeout(create_connection(
        client_plugin as Arc<dyn Plugin>,
        ConnectOptions::new(destination, secret),
    ))
    .await
    .unwrap();
    let stream = connection.create_stream().await;
    with_timeout(stream.send_total(12_000)).await.unwrap();

    assert_eq!(with_timeout(receiver).await.unwrap(), 12_000);
    assert_eq!(stream.total_sent().await, 12_000);
    assert!(connection.max_packet_amount().await.unwrap() <= 5000);
    // No single Prepare can have carried more than the path maximum, so at
    // least three packets moved money.
    assert!(connection.stats().await.packets_sent >= 3);
}

/// Receipts: the server signs running totals and the sender retains the
/// latest, verifiable receipt.
#[tokio::test]
async fn receipts_flow_back_to_sender() {
    let (client_plugin, server_plugin) = plugin_pair(1.0, None);
    let server = StreamServer::new(server_plugin as Arc<dyn Plugin>, [7u8; 32]);
    server.listen().await.unwrap();

    let receipt_nonce = [9u8; 16];
    let receipt_secret = [4u8; 32];
    let (destination, secret) = server
        .generate_address_and_secret_with_receipts(None, receipt_nonce, receipt_secret)
        .await
        .unwrap();

    let receiver = tokio::spawn({
        let server = server.clone();
        async move {
            let connection = server.accept_connection().await.expect("connection");
            let stream = connection.accept_stream().await.expect("stream");
            stream.set_receive_max(ReceiveMax::Unbounded).await;
            stream.receive_total(100).await.unwrap();
        }
    });

    let connection = with_timeout(create_connection(
        client_plugin as Arc<dyn Plugin>,
        ConnectOptions::new(destination, secret),
    ))
    .await
    .unwrap();
    let stream = connection.create_stream().await;
    with_timeout(stream.send_total(100)).await.unwrap();
    with_timeout(receiver).await.unwrap();

    let receipt = stream.receipt().await.expect("sender holds a receipt");
    assert!(verify_receipt(&receipt, &receipt_secret));
    let decoded = ilp_stream::receipt::decode_receipt(&receipt).unwrap();
    assert_eq!(decoded.nonce, receipt_nonce);
    assert_eq!(decoded.stream_id, 1);
    assert_eq!(decoded.total_received, 100);
}

/// Graceful close: `end` drains in-flight work and both sides finish.
#[tokio::test]
async fn graceful_connection_close() {
    let (client_plugin, server_plugin) = plugin_pair(1.0, None);
    let server = StreamServer::new(server_plugin as Arc<dyn Plugin>, [7u8; 32]);
    server.listen().await.unwrap();
    let (destination, secret) = server.generate_address_and_secret(None).await.unwrap();

    let receiver = tokio::spawn({
        let server = server.clone();
        async move {
            let connection = server.accept_connection().await.expect("connection");
            let stream = connection.accept_stream().await.expect("stream");
            stream.set_receive_max(ReceiveMax::Unbounded).await;
            stream.receive_total(10).await.unwrap();
            connection
        }
    });

    let connection = with_timeout(create_connection(
        client_plugin as Arc<dyn Plugin>,
        ConnectOptions::new(destination, secret),
    ))
    .await
    .unwrap();
    let stream = connection.create_stream().await;
    with_timeout(stream.send_total(10)).await.unwrap();

    let server_connection = with_timeout(receiver).await.unwrap();
    with_timeout(connection.end()).await.unwrap();
    assert_eq!(
        connection.state().await,
        ilp_stream::ConnectionState::Closed
    );

    // The server side observed the close as well.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        server_connection.state().await,
        ilp_stream::ConnectionState::Closed
    );
}

/// The connection tag attached at address generation is echoed to the
/// server-side connection.
#[tokio::test]
async fn connection_tag_roundtrip() {
    let (client_plugin, server_plugin) = plugin_pair(1.0, None);
    let server = StreamServer::new(server_plugin as Arc<dyn Plugin>, [7u8; 32]);
    server.listen().await.unwrap();
    let (destination, secret) = server
        .generate_address_and_secret(Some("customer-42"))
        .await
        .unwrap();

    let receiver = tokio::spawn({
        let server = server.clone();
        async move { server.accept_connection().await.expect("connection") }
    });

    let _connection = with_timeout(create_connection(
        client_plugin as Arc<dyn Plugin>,
        ConnectOptions::new(destination, secret),
    ))
    .await
    .unwrap();

    let server_connection = with_timeout(receiver).await.unwrap();
    assert_eq!(server_connection.connection_tag(), Some("customer-42"));
}
