use super::*;
use crate::handler::notification_handler;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{Barrier, Notify};

#[derive(Debug)]
struct Ping;

/// Handlers that record their index when invoked; `fail_at` fails.
fn recording_handlers(
    count: usize,
    fail_at: Option<usize>,
    log: Arc<Mutex<Vec<usize>>>,
) -> Vec<NotificationHandlerFn<Ping>> {
    (1..=count)
        .map(|i| {
            let log = Arc::clone(&log);
            notification_handler(move |_n: Arc<Ping>| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(i);
                    if Some(i) == fail_at {
                        Err(HandlerError::new("test", format!("handler {} failed", i)))
                    } else {
                        Ok(())
                    }
                }
            })
        })
        .collect()
}

/// Handlers that only finish once all of them are running at the same time.
fn rendezvous_handlers(
    count: usize,
    fail_at: Option<usize>,
    calls: Arc<AtomicUsize>,
) -> Vec<NotificationHandlerFn<Ping>> {
    let barrier = Arc::new(Barrier::new(count));
    (1..=count)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let calls = Arc::clone(&calls);
            notification_handler(move |_n: Arc<Ping>| {
                let barrier = Arc::clone(&barrier);
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    barrier.wait().await;
                    if Some(i) == fail_at {
                        Err(HandlerError::new("test", format!("handler {} failed", i)))
                    } else {
                        Ok(())
                    }
                }
            })
        })
        .collect()
}

#[tokio::test]
async fn test_sequential_stop_on_error_runs_until_failure() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let handlers = recording_handlers(3, Some(2), Arc::clone(&log));

    let result = FanoutPublisher::new(PublishStrategy::SequentialStopOnError)
        .publish(&handlers, Arc::new(Ping))
        .await;

    assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    match result {
        Err(PublishError::Handler(e)) => assert_eq!(e.message, "handler 2 failed"),
        other => panic!("expected single handler error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sequential_continue_on_error_runs_all() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let handlers = recording_handlers(3, Some(2), Arc::clone(&log));

    let result = FanoutPublisher::new(PublishStrategy::SequentialContinueOnError)
        .publish(&handlers, Arc::new(Ping))
        .await;

    assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    match result {
        Err(PublishError::Aggregate(errors)) => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].message, "handler 2 failed");
        }
        other => panic!("expected aggregate error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sequential_success() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let handlers = recording_handlers(3, None, Arc::clone(&log));

    FanoutPublisher::default()
        .publish(&handlers, Arc::new(Ping))
        .await
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_parallel_wait_all_runs_concurrently_and_aggregates() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handlers = rendezvous_handlers(3, Some(2), Arc::clone(&calls));

    // The barrier only opens if all three handlers run at once.
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        FanoutPublisher::new(PublishStrategy::ParallelWaitAll).publish(&handlers, Arc::new(Ping)),
    )
    .await
    .expect("handlers did not run concurrently");

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match result {
        Err(PublishError::Aggregate(errors)) => assert_eq!(errors.len(), 1),
        other => panic!("expected aggregate error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_async_continue_on_error_is_concurrent() {
    let calls = Arc::new(AtomicUsize::new(0));
    let handlers = rendezvous_handlers(3, Some(3), Arc::clone(&calls));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        FanoutPublisher::new(PublishStrategy::AsyncContinueOnError)
            .publish(&handlers, Arc::new(Ping)),
    )
    .await
    .expect("handlers did not run concurrently");

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.unwrap_err().errors().len(), 1);
}

#[tokio::test]
async fn test_async_continue_on_error_captures_start_failure() {
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = Arc::clone(&ran);
    let handlers: Vec<NotificationHandlerFn<Ping>> = vec![
        Arc::new(|_n: Arc<Ping>| -> BoxFuture<'static, Result<(), HandlerError>> {
            panic!("refused to start")
        }),
        notification_handler(move |_n: Arc<Ping>| {
            let ran = Arc::clone(&ran_clone);
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    ];

    let result = FanoutPublisher::new(PublishStrategy::AsyncContinueOnError)
        .publish(&handlers, Arc::new(Ping))
        .await;

    assert_eq!(ran.load(Ordering::SeqCst), 1);
    let errors = result.unwrap_err();
    assert_eq!(errors.errors().len(), 1);
    assert_eq!(errors.errors()[0].kind, crate::handler::PANIC_KIND);
    assert_eq!(errors.errors()[0].message, "refused to start");
}

#[tokio::test]
async fn test_fire_and_forget_returns_before_handlers_finish() {
    let release = Arc::new(Notify::new());
    let done = Arc::new(AtomicUsize::new(0));
    let handlers: Vec<NotificationHandlerFn<Ping>> = (0..2)
        .map(|_| {
            let release = Arc::clone(&release);
            let done = Arc::clone(&done);
            notification_handler(move |_n: Arc<Ping>| {
                let release = Arc::clone(&release);
                let done = Arc::clone(&done);
                async move {
                    release.notified().await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::new("test", "invisible to the caller"))
                }
            })
        })
        .collect();

    FanoutPublisher::new(PublishStrategy::ParallelFireAndForget)
        .publish(&handlers, Arc::new(Ping))
        .await
        .unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 0);

    // Let both tasks register their waiters, then release them.
    tokio::time::sleep(Duration::from_millis(20)).await;
    release.notify_waiters();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(done.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_wait_any_returns_after_first_completion() {
    let release = Arc::new(Notify::new());
    let finished = Arc::new(AtomicUsize::new(0));

    let fast_finished = Arc::clone(&finished);
    let mut handlers: Vec<NotificationHandlerFn<Ping>> = vec![notification_handler(
        move |_n: Arc<Ping>| {
            let finished = Arc::clone(&fast_finished);
            async move {
                finished.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::new("test", "first one out fails"))
            }
        },
    )];
    for _ in 0..2 {
        let release = Arc::clone(&release);
        let finished = Arc::clone(&finished);
        handlers.push(notification_handler(move |_n: Arc<Ping>| {
            let release = Arc::clone(&release);
            let finished = Arc::clone(&finished);
            async move {
                release.notified().await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));
    }

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        FanoutPublisher::new(PublishStrategy::ParallelWaitAny).publish(&handlers, Arc::new(Ping)),
    )
    .await
    .expect("wait-any blocked on a stalled handler");

    assert!(result.is_ok());
    assert_eq!(finished.load(Ordering::SeqCst), 1);

    // The slow handlers keep running in the background.
    tokio::time::sleep(Duration::from_millis(20)).await;
    release.notify_waiters();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_no_handlers_is_ok_for_every_strategy() {
    let handlers: Vec<NotificationHandlerFn<Ping>> = Vec::new();
    for strategy in [
        PublishStrategy::SequentialContinueOnError,
        PublishStrategy::SequentialStopOnError,
        PublishStrategy::AsyncContinueOnError,
        PublishStrategy::ParallelFireAndForget,
        PublishStrategy::ParallelWaitAll,
        PublishStrategy::ParallelWaitAny,
    ] {
        assert!(FanoutPublisher::new(strategy)
            .publish(&handlers, Arc::new(Ping))
            .await
            .is_ok());
    }
}

#[tokio::test]
async fn test_panicking_handler_becomes_error_in_parallel_wait_all() {
    let handlers: Vec<NotificationHandlerFn<Ping>> = vec![notification_handler(
        |_n: Arc<Ping>| async move {
            if true {
                panic!("mid-flight");
            }
            Ok(())
        },
    )];

    let result = FanoutPublisher::new(PublishStrategy::ParallelWaitAll)
        .publish(&handlers, Arc::new(Ping))
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.errors()[0].kind, crate::handler::PANIC_KIND);
    assert_eq!(err.errors()[0].message, "mid-flight");
}
