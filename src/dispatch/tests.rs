use super::*;
use crate::envelope::ResponseEnvelope;
use crate::test_utils::{spawn_responder, RecordingDispatcher};
use crate::transport::{Binding, ChannelTransport, Subscriber};
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

const KEY: &str = "ns_Add";

fn destination() -> Destination {
    Destination::new("ns.Add", KEY)
}

async fn broker(transport: &ChannelTransport, timeout: Option<Duration>) -> BrokerDispatcher {
    BrokerDispatcher::connect(Arc::new(transport.clone()), DispatchScope::All, timeout)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_broker_request_returns_reply_content() {
    let transport = ChannelTransport::new();
    let _responder = spawn_responder(&transport, KEY, |envelope| {
        assert_eq!(envelope.routing_type, KEY);
        let mut reply = envelope.body;
        reply.reverse();
        ResponseEnvelope::ok(reply)
    })
    .await;
    let dispatcher = broker(&transport, None).await;

    let reply = dispatcher
        .dispatch_request(&destination(), b"abc".to_vec(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(reply, b"cba");
    assert_eq!(dispatcher.pending(), 0);
}

#[tokio::test]
async fn test_broker_remote_exception_is_raised() {
    let transport = ChannelTransport::new();
    let error = HandlerError::new("math::Overflow", "too big");
    let carried = error.clone();
    let _responder =
        spawn_responder(&transport, KEY, move |_| ResponseEnvelope::exception(carried.clone())).await;
    let dispatcher = broker(&transport, None).await;

    let result = dispatcher
        .dispatch_request(&destination(), Vec::new(), &CancellationToken::new())
        .await;

    match result {
        Err(DispatchError::Remote(e)) => assert_eq!(e, error),
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_broker_unroutable_fails_fast_without_residue() {
    let transport = ChannelTransport::new();
    let dispatcher = broker(&transport, None).await;

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        dispatcher.dispatch_request(&destination(), Vec::new(), &CancellationToken::new()),
    )
    .await
    .expect("unroutable request should not wait");

    assert!(matches!(result, Err(DispatchError::Unroutable(key)) if key == KEY));
    assert_eq!(dispatcher.pending(), 0);
}

#[tokio::test]
async fn test_broker_cancellation_removes_entry_and_drops_late_reply() {
    let transport = ChannelTransport::new();
    let mut requests = transport.subscribe(Binding::request(KEY, 1)).await.unwrap();
    let dispatcher = Arc::new(broker(&transport, None).await);
    let cancel = CancellationToken::new();

    let call = {
        let dispatcher = Arc::clone(&dispatcher);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            dispatcher
                .dispatch_request(&destination(), Vec::new(), &cancel)
                .await
        })
    };

    // Hold the request without answering, then cancel the caller.
    let request = requests.next().await.unwrap();
    assert_eq!(dispatcher.pending(), 1);
    cancel.cancel();

    assert!(matches!(call.await.unwrap(), Err(DispatchError::Cancelled)));
    assert_eq!(dispatcher.pending(), 0);

    // The late reply finds no entry and is dropped.
    request
        .reply(ResponseEnvelope::ok(b"late".to_vec()).encode().unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(dispatcher.pending(), 0);
}

#[tokio::test]
async fn test_broker_cancelled_before_send() {
    let transport = ChannelTransport::new();
    let _requests = transport.subscribe(Binding::request(KEY, 1)).await.unwrap();
    let dispatcher = broker(&transport, None).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = dispatcher
        .dispatch_request(&destination(), Vec::new(), &cancel)
        .await;

    assert!(matches!(result, Err(DispatchError::Cancelled)));
    assert_eq!(dispatcher.pending(), 0);
}

#[tokio::test]
async fn test_broker_request_timeout() {
    let transport = ChannelTransport::new();
    let _requests = transport.subscribe(Binding::request(KEY, 1)).await.unwrap();
    let dispatcher = broker(&transport, Some(Duration::from_millis(50))).await;

    let result = dispatcher
        .dispatch_request(&destination(), Vec::new(), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(DispatchError::Timeout(_))));
    assert_eq!(dispatcher.pending(), 0);
}

#[tokio::test]
async fn test_broker_notify_does_not_correlate() {
    let transport = ChannelTransport::new();
    let mut stream = transport.subscribe(Binding::request(KEY, 1)).await.unwrap();
    let dispatcher = broker(&transport, None).await;

    dispatcher.notify(&destination(), b"evt".to_vec()).await.unwrap();

    let delivery = stream.next().await.unwrap();
    assert!(delivery.correlation_id.is_none());
    assert!(!delivery.can_reply());
    assert_eq!(Envelope::decode(&delivery.body).unwrap().body, b"evt");
    assert_eq!(dispatcher.pending(), 0);
}

#[tokio::test]
async fn test_broker_notify_without_subscribers_is_ok() {
    let transport = ChannelTransport::new();
    let dispatcher = broker(&transport, None).await;
    assert!(dispatcher.notify(&destination(), Vec::new()).await.is_ok());
}

#[tokio::test]
async fn test_rpc_request_and_unroutable() {
    let transport = ChannelTransport::new();
    let dispatcher = RpcDispatcher::new(Arc::new(transport.clone()), DispatchScope::All, None);

    let result = dispatcher
        .dispatch_request(&destination(), Vec::new(), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(DispatchError::Unroutable(_))));

    let _responder =
        spawn_responder(&transport, KEY, |envelope| ResponseEnvelope::ok(envelope.body)).await;
    let reply = dispatcher
        .dispatch_request(&destination(), b"echo".to_vec(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reply, b"echo");
}

#[tokio::test]
async fn test_rpc_cancellation() {
    let transport = ChannelTransport::new();
    let mut requests = transport.subscribe(Binding::request(KEY, 1)).await.unwrap();
    let dispatcher = Arc::new(RpcDispatcher::new(
        Arc::new(transport.clone()),
        DispatchScope::All,
        None,
    ));
    let cancel = CancellationToken::new();

    let call = {
        let dispatcher = Arc::clone(&dispatcher);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            dispatcher
                .dispatch_request(&destination(), Vec::new(), &cancel)
                .await
        })
    };

    let _held = requests.next().await.unwrap();
    cancel.cancel();
    assert!(matches!(call.await.unwrap(), Err(DispatchError::Cancelled)));
}

#[test]
fn test_scope_membership() {
    assert!(DispatchScope::All.contains("ns.Anything"));

    let types = vec!["ns.A".to_string()];
    let scope = DispatchScope::from_types(Some(&types));
    assert!(scope.contains("ns.A"));
    assert!(!scope.contains("ns.B"));
    assert_eq!(DispatchScope::from_types(None), DispatchScope::All);
}

#[tokio::test]
async fn test_set_uses_first_capable_dispatcher() {
    let narrow = Arc::new(RecordingDispatcher::new("narrow").only(["ns.Other"]));
    let first = Arc::new(RecordingDispatcher::new("first"));
    let second = Arc::new(RecordingDispatcher::new("second"));
    let set = DispatcherSet::new()
        .with(narrow.clone())
        .with(first.clone())
        .with(second.clone());

    set.notify(&destination(), Vec::new()).await.unwrap();
    set.dispatch_request(&destination(), Vec::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(narrow.calls(), 0);
    assert_eq!(first.calls(), 2);
    assert_eq!(second.calls(), 0);
    assert_eq!(set.select(&destination()).unwrap().name(), "first");
}

#[tokio::test]
async fn test_set_without_capable_dispatcher() {
    let set = DispatcherSet::new().with(Arc::new(RecordingDispatcher::new("narrow").only(["ns.Other"])));

    let result = set.notify(&destination(), Vec::new()).await;
    assert!(matches!(result, Err(DispatchError::NoDispatcher(t)) if t == "ns.Add"));

    let empty = DispatcherSet::new();
    assert!(empty.is_empty());
    assert!(matches!(
        empty
            .dispatch_request(&destination(), Vec::new(), &CancellationToken::new())
            .await,
        Err(DispatchError::NoDispatcher(_))
    ));
}

#[tokio::test]
async fn test_concurrent_requests_are_correlated_independently() {
    let transport = ChannelTransport::new();
    let mut requests = transport.subscribe(Binding::request(KEY, 8)).await.unwrap();
    let answered = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());

    // Answer requests in reverse arrival order.
    let responder = {
        let answered = Arc::clone(&answered);
        let release = Arc::clone(&release);
        tokio::spawn(async move {
            let first = requests.next().await.unwrap();
            let second = requests.next().await.unwrap();
            release.notified().await;
            for delivery in [second, first] {
                let body = Envelope::decode(&delivery.body).unwrap().body;
                delivery
                    .reply(ResponseEnvelope::ok(body).encode().unwrap())
                    .await
                    .unwrap();
                answered.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    let dispatcher = Arc::new(broker(&transport, None).await);
    let cancel = CancellationToken::new();
    let dest_a = destination();
    let dest_b = destination();
    let a = dispatcher.dispatch_request(&dest_a, b"a".to_vec(), &cancel);
    let b = dispatcher.dispatch_request(&dest_b, b"b".to_vec(), &cancel);
    let releaser = async {
        while dispatcher.pending() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        release.notify_one();
    };

    let (a, b, ()) = tokio::join!(a, b, releaser);
    assert_eq!(a.unwrap(), b"a");
    assert_eq!(b.unwrap(), b"b");
    responder.await.unwrap();
    assert_eq!(answered.load(Ordering::SeqCst), 2);
}
