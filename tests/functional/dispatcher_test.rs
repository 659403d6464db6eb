//! Functional tests for the request dispatcher over an in-memory transport

#[path = "../support/mod.rs"]
mod support;

use balanced_dispatch::error::DispatchError;
use balanced_dispatch::transport::HttpRequest;
use balanced_dispatch::RequestDispatcher;
use futures::StreamExt;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use support::{servers, Behavior, RecordingListener, StubRegistry, StubTransport};

#[tokio::test]
async fn test_passthrough_sends_request_untouched() {
    let listener = Arc::new(RecordingListener::default());
    let dispatcher = RequestDispatcher::new(StubTransport::new(Behavior::Succeed)).with_listener(listener.clone());
    assert!(!dispatcher.is_load_balanced());

    let response = dispatcher
        .exchange(HttpRequest::get("http://inventory/items?page=2").unwrap())
        .next()
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.text(), "http://inventory/items?page=2");
    assert_eq!(dispatcher.transport().targets(), vec!["http://inventory/items?page=2"]);
    assert!(listener.events().is_empty());
}

#[tokio::test]
async fn test_passthrough_forwards_transport_error() {
    let dispatcher = RequestDispatcher::new(StubTransport::new(Behavior::FailConnect));

    let results: Vec<_> = dispatcher
        .raw_byte_stream(HttpRequest::get("http://inventory/items").unwrap())
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(DispatchError::Transport(_))));
    assert_eq!(dispatcher.transport().started(), 1);
}

#[tokio::test]
async fn test_passthrough_cancellation_reaches_transport() {
    let listener = Arc::new(RecordingListener::default());
    let dispatcher = RequestDispatcher::new(StubTransport::new(Behavior::Hang)).with_listener(listener.clone());

    let mut stream = dispatcher.raw_byte_stream(HttpRequest::get("http://inventory/items").unwrap());
    let first = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(first.is_err());

    drop(stream);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(dispatcher.transport().started(), 1);
    assert_eq!(dispatcher.transport().cancellations(), 1);
    assert!(listener.events().is_empty());
}

#[tokio::test]
async fn test_request_rewritten_to_selected_server() {
    let registry = Arc::new(StubRegistry::new(servers(&["10.0.0.7"])));
    let dispatcher =
        RequestDispatcher::new(StubTransport::new(Behavior::Succeed)).with_load_balancer(registry.clone());
    assert!(dispatcher.is_load_balanced());

    let chunks: Vec<_> = dispatcher
        .raw_byte_stream(HttpRequest::get("http://inventory/items?page=2#top").unwrap())
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;

    assert_eq!(chunks.len(), 3);
    assert_eq!(
        dispatcher.transport().targets(),
        vec!["http://10.0.0.7:8080/items?page=2#top"]
    );
    assert_eq!(registry.selection_count(), 1);
}

#[tokio::test]
async fn test_decoded_stream_yields_values_in_order() {
    let registry = Arc::new(StubRegistry::new(servers(&["a"])));
    let listener = Arc::new(RecordingListener::default());
    let dispatcher = RequestDispatcher::new(StubTransport::new(Behavior::Succeed))
        .with_load_balancer(registry)
        .with_listener(listener.clone());

    let values: Vec<u32> = dispatcher
        .decoded_stream::<u32>(HttpRequest::get("http://inventory/counts").unwrap())
        .map(|value| value.unwrap())
        .collect()
        .await;

    assert_eq!(values, vec![1, 2, 3]);
    assert_eq!(listener.numbers(), vec![1, 2, 3]);
    assert_eq!(listener.events(), vec!["start:1", "success:1"]);
}

#[tokio::test]
async fn test_listener_sees_unary_response() {
    let registry = Arc::new(StubRegistry::new(servers(&["a"])));
    let listener = Arc::new(RecordingListener::default());
    let dispatcher = RequestDispatcher::new(StubTransport::new(Behavior::Succeed))
        .with_load_balancer(registry)
        .with_listener(listener.clone());

    let response = dispatcher
        .exchange(HttpRequest::get("http://inventory/items").unwrap())
        .next()
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(listener.statuses(), vec![StatusCode::OK]);
    assert_eq!(listener.events(), vec!["start:1", "success:1"]);
}

#[tokio::test]
async fn test_exchange_streamed_body_is_lazy() {
    let registry = Arc::new(StubRegistry::new(servers(&["a"])));
    let dispatcher =
        RequestDispatcher::new(StubTransport::new(Behavior::Succeed)).with_load_balancer(registry);

    let response = dispatcher
        .exchange_streamed(HttpRequest::get("http://inventory/items").unwrap())
        .next()
        .await
        .unwrap()
        .unwrap();

    let body: Vec<_> = response.body.map(|chunk| chunk.unwrap()).collect().await;
    assert_eq!(body.concat(), b"http://a:8080/items");
}

#[tokio::test]
async fn test_nothing_happens_until_polled() {
    let registry = Arc::new(StubRegistry::new(servers(&["a"])));
    let dispatcher =
        RequestDispatcher::new(StubTransport::new(Behavior::Succeed)).with_load_balancer(registry.clone());

    let pending = dispatcher.exchange(HttpRequest::get("http://inventory/").unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(registry.selection_count(), 0);
    assert!(dispatcher.transport().targets().is_empty());
    drop(pending);
}

#[tokio::test]
async fn test_cancellation_stops_attempt_and_notifies_listeners() {
    let registry = Arc::new(StubRegistry::new(servers(&["a", "b"])));
    let listener = Arc::new(RecordingListener::default());
    let dispatcher = RequestDispatcher::new(StubTransport::new(Behavior::Hang))
        .with_load_balancer(registry.clone())
        .with_listener(listener.clone());

    let mut stream = dispatcher.raw_byte_stream(HttpRequest::get("http://inventory/items").unwrap());
    let first = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(first.is_err());

    drop(stream);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let transport = dispatcher.transport();
    assert_eq!(transport.started(), 1);
    assert_eq!(transport.cancellations(), 1);
    assert_eq!(registry.selection_count(), 1);
    assert!(registry.outcomes.lock().is_empty());
    assert_eq!(listener.events(), vec!["start:1", "failure:1:cancelled"]);
}

#[tokio::test]
async fn test_at_most_one_attempt_in_flight() {
    let registry = Arc::new(StubRegistry::new(servers(&["a", "b", "c"])));
    let transport = StubTransport::new(Behavior::FailConnect).with_host("c", Behavior::Succeed);
    let dispatcher = RequestDispatcher::new(transport)
        .with_load_balancer(registry)
        .with_retry_policy(balanced_dispatch::RetryPolicy {
            max_retries_same_server: 1,
            max_retries_next_server: 2,
            ..Default::default()
        });

    let chunks: Vec<_> = dispatcher
        .raw_byte_stream(HttpRequest::get("http://inventory/items").unwrap())
        .collect()
        .await;

    assert!(chunks.iter().all(|chunk| chunk.is_ok()));
    assert_eq!(dispatcher.transport().started(), 5);
    assert_eq!(dispatcher.transport().max_in_flight(), 1);
}
