//! End-to-end tests over the event-stream fallback transport.

mod common;

use std::time::Duration;
use tokio::time::timeout;

use authz_transport::config::ProtocolMode;
use authz_transport::{AuthzClient, Protocol, ProtocolEvent, TransportError};
use common::{client_config, dead_address, request, MockEventServer};

#[tokio::test]
async fn test_auto_falls_back_when_rpc_is_down() {
    let events = MockEventServer::start().await;
    events.deny("delete");

    let mut config = client_config(&dead_address().await);
    config.protocol = ProtocolMode::Auto;
    config.fallback_url = Some(events.url());

    let client = AuthzClient::new(config).unwrap();
    let mut protocol_events = client.subscribe_protocol();
    assert_eq!(client.connect().await.unwrap(), Protocol::EventStream);
    assert!(client.fallback_reason().is_some());
    assert!(client.pool_stats().is_none());

    let first = timeout(Duration::from_secs(1), protocol_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, ProtocolEvent::FellBack { .. }));

    let response = client.check(request(&["read", "delete"])).await.unwrap();
    assert!(response.is_allowed("read"));
    assert!(!response.is_allowed("delete"));
    assert_eq!(events.subscriptions(), 1);
    client.disconnect().await;
}

#[tokio::test]
async fn test_fallback_mode_batch() {
    let events = MockEventServer::start().await;
    let mut config = client_config("127.0.0.1:1");
    config.protocol = ProtocolMode::Fallback;
    config.fallback_url = Some(events.url());

    let client = AuthzClient::new(config).unwrap();
    assert_eq!(client.connect().await.unwrap(), Protocol::EventStream);
    assert!(client.fallback_reason().is_none());

    let requests = vec![request(&["read"]), request(&["write"])];
    let responses = client.check_batch(&requests).await.unwrap();
    let ids: Vec<_> = responses.iter().map(|r| r.request_id.as_str()).collect();
    assert_eq!(ids, vec![requests[0].request_id.as_str(), requests[1].request_id.as_str()]);
}

#[tokio::test]
async fn test_streams_are_rejected_on_fallback() {
    let events = MockEventServer::start().await;
    let mut config = client_config("127.0.0.1:1");
    config.protocol = ProtocolMode::Fallback;
    config.fallback_url = Some(events.url());

    let client = AuthzClient::new(config).unwrap();
    client.connect().await.unwrap();
    assert!(matches!(
        client.check_stream().await,
        Err(TransportError::Unsupported(_))
    ));
}

#[tokio::test]
async fn test_health_probe_over_fallback() {
    let events = MockEventServer::start().await;
    let mut config = client_config("127.0.0.1:1");
    config.protocol = ProtocolMode::Fallback;
    config.fallback_url = Some(events.url());

    let client = AuthzClient::new(config).unwrap();
    client.connect().await.unwrap();
    let snapshot = client.check_health().await;
    assert_eq!(snapshot.consecutive_successes, 1);
    assert_eq!(snapshot.consecutive_failures, 0);
}

#[tokio::test]
async fn test_auto_reports_both_failures() {
    let mut config = client_config(&dead_address().await);
    config.protocol = ProtocolMode::Auto;
    config.fallback_url = Some(format!("http://{}", dead_address().await));

    let client = AuthzClient::new(config).unwrap();
    let err = client.connect().await.unwrap_err();
    match err {
        TransportError::Connection(message) => {
            assert!(message.contains("rpc:"));
            assert!(message.contains("fallback:"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(client.protocol().is_none());
}
