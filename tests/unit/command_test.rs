//! Unit tests for the load-balanced command and execution listeners

#[path = "../support/mod.rs"]
mod support;

use balanced_dispatch::balancer::Server;
use balanced_dispatch::command::{
    Backoff, DispatchCommand, ExecutionListener, ListenerRegistration, ListenerRegistry, RetryPolicy,
};
use balanced_dispatch::error::{DispatchError, TransportError};
use balanced_dispatch::transport::HttpRequest;
use balanced_dispatch::RequestDispatcher;
use futures::{stream, StreamExt};
use reqwest::{StatusCode, Url};
use std::sync::Arc;
use std::time::{Duration, Instant};
use support::{servers, Behavior, FaultyListener, RecordingListener, StubRegistry, StubTransport};

fn policy(same: u32, next: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries_same_server: same,
        max_retries_next_server: next,
        ..RetryPolicy::default()
    }
}

fn connect_error() -> DispatchError {
    TransportError::Connect("refused".to_string()).into()
}

#[test]
fn test_policy_attempt_bound() {
    assert_eq!(RetryPolicy::default().max_attempts(), 2);
    assert_eq!(RetryPolicy::no_retries().max_attempts(), 1);
    assert_eq!(policy(1, 2).max_attempts(), 6);
}

#[tokio::test]
async fn test_retries_stop_at_policy_bound() {
    let registry = Arc::new(StubRegistry::new(servers(&["a", "b", "c"])));
    let listener = Arc::new(RecordingListener::default());
    let dispatcher = RequestDispatcher::new(StubTransport::new(Behavior::FailConnect))
        .with_load_balancer(registry.clone())
        .with_retry_policy(policy(1, 2))
        .with_listener(listener.clone());

    let results: Vec<_> = dispatcher
        .exchange(HttpRequest::get("http://inventory/items").unwrap())
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    match &results[0] {
        Err(DispatchError::RetriesExhausted { attempts, last }) => {
            assert_eq!(*attempts, 6);
            assert!(last.is_connect_failure());
        }
        other => panic!("unexpected result: {:?}", other),
    }

    assert_eq!(dispatcher.transport().started(), 6);
    assert_eq!(registry.selection_count(), 3);
    assert_eq!(registry.failures(), 6);

    let events = listener.events();
    assert_eq!(events.iter().filter(|e| e.starts_with("start:")).count(), 6);
    assert_eq!(events.iter().filter(|e| e.starts_with("failure:")).count(), 6);
    assert_eq!(events.last().unwrap(), "failure:6:error");
}

#[tokio::test]
async fn test_fails_over_to_next_server() {
    let registry = Arc::new(StubRegistry::new(servers(&["a", "b"])));
    let listener = Arc::new(RecordingListener::default());
    let transport = StubTransport::new(Behavior::Succeed).with_host("a", Behavior::FailConnect);
    let dispatcher = RequestDispatcher::new(transport)
        .with_load_balancer(registry.clone())
        .with_listener(listener.clone());

    let response = dispatcher
        .exchange(HttpRequest::get("http://inventory/items").unwrap())
        .next()
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.text(), "http://b:8080/items");
    assert_eq!(
        listener.events(),
        vec!["start:1", "failure:1:error", "start:2", "success:2"]
    );
    assert_eq!(registry.failures(), 1);
}

#[tokio::test]
async fn test_no_server_available_is_not_retried() {
    let registry = Arc::new(StubRegistry::empty());
    let listener = Arc::new(RecordingListener::default());
    let dispatcher = RequestDispatcher::new(StubTransport::new(Behavior::Succeed))
        .with_load_balancer(registry)
        .with_retry_policy(policy(2, 2))
        .with_listener(listener.clone());

    let results: Vec<_> = dispatcher
        .raw_byte_stream(HttpRequest::get("http://inventory/items").unwrap())
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(DispatchError::NoServerAvailable(_))));
    assert!(dispatcher.transport().targets().is_empty());
    assert!(listener.events().is_empty());
}

#[tokio::test]
async fn test_single_submission_stops_after_first_value() {
    let registry = Arc::new(StubRegistry::new(servers(&["a"])));
    let listener = Arc::new(RecordingListener::default());
    let command = DispatchCommand::new(
        registry,
        RetryPolicy::default(),
        ListenerRegistration::new(vec![listener.clone() as Arc<dyn ExecutionListener>]),
    );

    let items: Vec<_> = command
        .submit_single(HttpRequest::get("http://inventory/").unwrap(), |_server: Server| {
            stream::iter(vec![Ok(1), Ok(2), Ok(3)]).boxed()
        })
        .collect()
        .await;

    assert_eq!(items.len(), 1);
    assert_eq!(*items[0].as_ref().unwrap(), 1);
    assert_eq!(listener.events(), vec!["start:1", "success:1"]);
}

#[tokio::test]
async fn test_failure_after_values_is_terminal() {
    let registry = Arc::new(StubRegistry::new(servers(&["a", "b"])));
    let command = DispatchCommand::new(registry.clone(), policy(1, 1), ListenerRegistration::empty());

    let mut results = command.submit(HttpRequest::get("http://inventory/").unwrap(), |_server: Server| {
        stream::iter(vec![Ok(1), Err(connect_error())]).boxed()
    });

    assert_eq!(results.next().await.unwrap().unwrap(), 1);
    assert!(matches!(
        results.next().await,
        Some(Err(DispatchError::Transport(TransportError::Connect(_))))
    ));
    assert!(results.next().await.is_none());
    assert_eq!(results.attempts(), 1);
    assert_eq!(registry.selection_count(), 1);
}

#[tokio::test]
async fn test_non_idempotent_status_failure_is_returned_as_is() {
    let registry = Arc::new(StubRegistry::new(servers(&["a", "b"])));
    let command = DispatchCommand::new(registry.clone(), policy(1, 1), ListenerRegistration::empty());
    let request = HttpRequest::post("http://inventory/orders", "{}").unwrap();

    let results: Vec<_> = command
        .submit(request, |_server: Server| {
            let err = TransportError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                url: Url::parse("http://a:8080/orders").unwrap(),
                body: String::new(),
            };
            stream::iter(vec![Err::<u8, _>(err.into())]).boxed()
        })
        .collect()
        .await;

    assert!(matches!(
        results[0],
        Err(DispatchError::Transport(TransportError::Status { .. }))
    ));
    assert_eq!(registry.selection_count(), 1);
}

#[tokio::test]
async fn test_same_server_retry_reuses_selection() {
    let registry = Arc::new(StubRegistry::new(servers(&["a", "b"])));
    let command = DispatchCommand::new(registry.clone(), policy(2, 0), ListenerRegistration::empty());

    let results: Vec<_> = command
        .submit(HttpRequest::get("http://inventory/").unwrap(), |_server: Server| {
            stream::iter(vec![Err::<u8, _>(connect_error())]).boxed()
        })
        .collect()
        .await;

    assert!(matches!(
        results[0],
        Err(DispatchError::RetriesExhausted { attempts: 3, .. })
    ));
    assert_eq!(registry.selection_count(), 1);
    assert_eq!(registry.failures(), 3);
    assert!(registry.outcomes.lock().iter().all(|(server, _)| server.host == "a"));
}

#[tokio::test]
async fn test_backoff_delays_next_attempt() {
    let registry = Arc::new(StubRegistry::new(servers(&["a", "b"])));
    let command = DispatchCommand::new(
        registry,
        policy(0, 1).with_backoff(Backoff::Fixed(Duration::from_millis(30))),
        ListenerRegistration::empty(),
    );

    let started = Instant::now();
    let results: Vec<_> = command
        .submit(HttpRequest::get("http://inventory/").unwrap(), |server: Server| {
            if server.host == "a" {
                stream::iter(vec![Err::<String, _>(connect_error())]).boxed()
            } else {
                stream::iter(vec![Ok(server.host)]).boxed()
            }
        })
        .collect()
        .await;

    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_ref().unwrap(), "b");
}

#[tokio::test]
async fn test_faulty_listener_does_not_affect_dispatch() {
    let registry = Arc::new(StubRegistry::new(servers(&["a", "b"])));
    let recording = Arc::new(RecordingListener::default());
    let transport = StubTransport::new(Behavior::Succeed).with_host("a", Behavior::FailConnect);
    let dispatcher = RequestDispatcher::new(transport)
        .with_load_balancer(registry)
        .with_listener(Arc::new(FaultyListener))
        .with_listener(recording.clone());

    let items: Vec<_> = dispatcher
        .raw_byte_stream(HttpRequest::get("http://inventory/items").unwrap())
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;

    assert_eq!(items.concat(), b"abc");
    assert_eq!(
        recording.events(),
        vec!["start:1", "failure:1:error", "start:2", "success:2"]
    );
}

#[tokio::test]
async fn test_listeners_registered_later_apply_to_new_dispatches() {
    let registry = Arc::new(StubRegistry::new(servers(&["a"])));
    let dispatcher = RequestDispatcher::new(StubTransport::new(Behavior::Succeed)).with_load_balancer(registry);
    let request = HttpRequest::get("http://inventory/").unwrap();

    let pending = dispatcher.exchange(request.clone());
    let late = Arc::new(RecordingListener::default());
    dispatcher.register_listener(late.clone());

    assert!(pending.collect::<Vec<_>>().await[0].is_ok());
    assert!(late.events().is_empty());

    assert!(dispatcher.exchange(request).collect::<Vec<_>>().await[0].is_ok());
    assert_eq!(late.events(), vec!["start:1", "success:1"]);
}

#[test]
fn test_registry_snapshot_is_immutable() {
    let registry = ListenerRegistry::new();
    let listener: Arc<dyn ExecutionListener> = Arc::new(RecordingListener::default());
    registry.register(listener.clone());

    let snapshot = registry.snapshot();
    registry.register(listener);

    assert_eq!(snapshot.len(), 1);
    assert_eq!(registry.len(), 2);
    assert!(ListenerRegistry::new().snapshot().is_empty());
}
