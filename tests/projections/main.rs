//! Integration tests for running projections end to end.

mod collaborators;
mod logs;
mod views;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;

use collaborators::{BrokenSource, FlakyStorage};
use logs::WarningCounter;
use sourced_projections::{
    BatchingStorageSession, Distribution, EventWithPosition, InMemoryEventSource,
    InMemoryPositionStorage, InMemoryProjectionStorage, PassivationSettings, PositionStorage,
    ProjectResponse, ProjectionConfiguration, ProjectionError, ProjectionHandlers,
    ProjectionMode, ProjectionStatus, ProjectionStorage, ProjectionStorageExt,
    ProjectionStreamConfiguration, ProjectionsCoordinator, ProjectorPool, RestartSettings,
    StorageBatching, StorageError, StoreIntent,
};
use views::{archived, line, order_handlers, placed, OrderEvent, OrderView};

async fn run_to_completion(
    configuration: ProjectionConfiguration<String, OrderView, OrderEvent>,
) -> Result<(), ProjectionError> {
    let projection = configuration.build()?;
    let mut coordinator = ProjectionsCoordinator::new();
    coordinator.register(projection)?;
    coordinator.start();

    let handle = coordinator.get_all().remove(0);
    handle.wait_for_completion(Some(Duration::from_secs(10))).await
}

fn order_source(events: Vec<OrderEvent>) -> InMemoryEventSource<OrderEvent> {
    InMemoryEventSource::new().with_events(events).unwrap()
}

// ============================================================================
// Stream driver
// ============================================================================

#[tokio::test]
async fn two_events_for_one_order_make_one_document() {
    let storage = InMemoryProjectionStorage::new();
    let positions = InMemoryPositionStorage::new();
    let source = order_source(vec![placed("o-1", "ada"), line("o-1", "book")]);

    run_to_completion(
        ProjectionConfiguration::new("order_views", order_handlers(), source)
            .with_storage(storage.clone())
            .with_positions(positions.clone()),
    )
    .await
    .unwrap();

    assert_eq!(positions.load_latest("order_views").await.unwrap(), Some(2));
    assert_eq!(storage.len(), 1);
    let view: Option<OrderView> = storage.load_document("o-1").await.unwrap();
    assert_eq!(
        view,
        Some(OrderView {
            customer: "ada".into(),
            lines: vec!["book".into()],
            last_position: Some(2),
        })
    );
}

#[tokio::test]
async fn events_apply_in_order_per_order_across_chunks() {
    let storage = InMemoryProjectionStorage::new();
    let mut events = vec![placed("o-1", "ada"), placed("o-2", "bob")];
    for n in 0..20 {
        events.push(line("o-1", &format!("a{}", n)));
        events.push(line("o-2", &format!("b{}", n)));
    }

    run_to_completion(
        ProjectionConfiguration::new("order_views", order_handlers(), order_source(events))
            .with_storage(storage.clone())
            .with_stream(
                ProjectionStreamConfiguration::new()
                    .with_batch_size(3)
                    .with_batch_window(Duration::from_millis(5)),
            ),
    )
    .await
    .unwrap();

    let first: OrderView = storage.load_document("o-1").await.unwrap().unwrap();
    let second: OrderView = storage.load_document("o-2").await.unwrap().unwrap();
    let expected_first: Vec<String> = (0..20).map(|n| format!("a{}", n)).collect();
    let expected_second: Vec<String> = (0..20).map(|n| format!("b{}", n)).collect();
    assert_eq!(first.lines, expected_first);
    assert_eq!(second.lines, expected_second);
}

#[tokio::test]
async fn archiving_deletes_the_document() {
    let storage = InMemoryProjectionStorage::new();
    let source = order_source(vec![
        placed("o-1", "ada"),
        placed("o-2", "bob"),
        archived("o-1"),
    ]);

    run_to_completion(
        ProjectionConfiguration::new("order_views", order_handlers(), source)
            .with_storage(storage.clone())
            .with_stream(ProjectionStreamConfiguration::new().with_batch_size(1)),
    )
    .await
    .unwrap();

    let gone: Option<OrderView> = storage.load_document("o-1").await.unwrap();
    assert_eq!(gone, None);
    assert_eq!(storage.len(), 1);
}

#[tokio::test]
async fn restart_resumes_after_stored_position() {
    let storage = InMemoryProjectionStorage::new();
    let positions = InMemoryPositionStorage::new();
    let source = order_source(vec![placed("o-1", "ada"), line("o-1", "book")]);

    run_to_completion(
        ProjectionConfiguration::new("order_views", order_handlers(), source.clone())
            .with_storage(storage.clone())
            .with_positions(positions.clone()),
    )
    .await
    .unwrap();

    source.append(line("o-1", "lamp")).unwrap();
    run_to_completion(
        ProjectionConfiguration::new("order_views", order_handlers(), source)
            .with_storage(storage.clone())
            .with_positions(positions.clone()),
    )
    .await
    .unwrap();

    let view: OrderView = storage.load_document("o-1").await.unwrap().unwrap();
    assert_eq!(view.lines, vec!["book".to_string(), "lamp".to_string()]);
    assert_eq!(positions.load_latest("order_views").await.unwrap(), Some(3));
}

#[tokio::test]
async fn replaying_acknowledged_events_reapplies_them() {
    let storage = InMemoryProjectionStorage::new();
    let positions = InMemoryPositionStorage::new();
    let source = order_source(vec![placed("o-1", "ada"), line("o-1", "book")]);

    run_to_completion(
        ProjectionConfiguration::new("order_views", order_handlers(), source.clone())
            .with_storage(storage.clone())
            .with_positions(positions.clone()),
    )
    .await
    .unwrap();

    run_to_completion(
        ProjectionConfiguration::new("order_views", order_handlers(), source)
            .with_storage(storage.clone())
            .with_positions(positions.clone())
            .with_mode(ProjectionMode::OneTime { start_from: Some(1) }),
    )
    .await
    .unwrap();

    let view: OrderView = storage.load_document("o-1").await.unwrap().unwrap();
    assert_eq!(view.lines, vec!["book".to_string(), "book".to_string()]);
    assert_eq!(positions.load_latest("order_views").await.unwrap(), Some(2));
}

#[tokio::test]
async fn stored_position_never_moves_backwards() {
    let positions = InMemoryPositionStorage::new();
    positions.store_latest("order_views", 7).await.unwrap();
    positions.store_latest("order_views", 3).await.unwrap();
    assert_eq!(positions.load_latest("order_views").await.unwrap(), Some(7));
}

#[tokio::test(start_paused = true)]
async fn failing_source_exhausts_restart_budget() {
    let source = BrokenSource::default();

    let err = run_to_completion(
        ProjectionConfiguration::new("order_views", order_handlers(), source.clone()).with_restart_settings(
            RestartSettings::new()
                .with_backoff(Duration::from_millis(10), Duration::from_millis(50))
                .with_max_restarts(2, Duration::from_secs(60)),
        ),
    )
    .await
    .unwrap_err();

    match err {
        ProjectionError::RestartBudgetExhausted {
            projection,
            restarts,
            last_error,
        } => {
            assert_eq!(projection, "order_views");
            assert_eq!(restarts, 2);
            assert_eq!(*last_error, ProjectionError::Source("broker unavailable".into()));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(source.subscriptions(), 3);
}

#[tokio::test]
async fn unknown_projection_lookup_fails() {
    let mut coordinator = ProjectionsCoordinator::new();
    coordinator
        .register(
            ProjectionConfiguration::new("order_views", order_handlers(), order_source(Vec::new()))
                .build()
                .unwrap(),
        )
        .unwrap();
    coordinator.start();

    assert!(coordinator.get_projection("order_views").is_ok());
    assert_eq!(
        coordinator.get_projection("invoices").unwrap_err(),
        ProjectionError::UnknownProjection("invoices".into())
    );
}

// ============================================================================
// Retries
// ============================================================================

#[test]
fn transient_failures_are_retried_and_logged() {
    let warnings = WarningCounter::new("retrying");
    let subscriber = tracing_subscriber::registry()
        .with(warnings.clone())
        .with(tracing_subscriber::fmt::layer().with_test_writer());
    let _guard = tracing::subscriber::set_default(subscriber);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&attempts);
    let handlers = order_handlers().on("LineAdded", OrderEvent::order, move |event, doc, position| {
        if counted.fetch_add(1, Ordering::SeqCst) < 2 {
            return Err(ProjectionError::handler("search index busy"));
        }
        let OrderEvent::LineAdded { sku, .. } = event else {
            return Ok(doc);
        };
        let mut view = doc.unwrap_or_default();
        view.lines.push(sku.clone());
        view.last_position = position;
        Ok(Some(view))
    });

    let storage = InMemoryProjectionStorage::new();
    let source = order_source(vec![line("o-1", "book")]);
    runtime
        .block_on(run_to_completion(
            ProjectionConfiguration::new("order_views", handlers, source)
                .with_storage(storage.clone())
                .with_stream(ProjectionStreamConfiguration::new().with_max_projection_retries(5)),
        ))
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(warnings.count(), 2);
    let view: Option<OrderView> = runtime.block_on(storage.load_document("o-1")).unwrap();
    assert_eq!(view.map(|v| v.lines), Some(vec!["book".to_string()]));
}

#[tokio::test]
async fn storage_failures_are_retried() {
    let storage = FlakyStorage::failing(2);
    let source = order_source(vec![placed("o-1", "ada")]);

    run_to_completion(
        ProjectionConfiguration::new("order_views", order_handlers(), source)
            .with_storage(storage.clone())
            .with_stream(ProjectionStreamConfiguration::new().with_max_projection_retries(2)),
    )
    .await
    .unwrap();

    let view: Option<OrderView> = storage.inner.load_document("o-1").await.unwrap();
    assert_eq!(view.map(|v| v.customer), Some("ada".to_string()));
}

#[tokio::test]
async fn exhausted_retries_reject_the_batch() {
    let storage = FlakyStorage::failing(3);
    let pool = ProjectorPool::new(
        "order_views",
        order_handlers(),
        Arc::new(storage.clone()),
        &ProjectionStreamConfiguration::new().with_max_projection_retries(2),
        PassivationSettings::default(),
    );

    let response = pool
        .submit("o-1".into(), vec![EventWithPosition::new(placed("o-1", "ada"), 1)])
        .await;
    assert_eq!(
        response,
        ProjectResponse::Reject(ProjectionError::Storage(StorageError::Backend(
            "connection reset".into()
        )))
    );

    // The failed worker is replaced; the next batch starts over.
    let response = pool
        .submit("o-1".into(), vec![EventWithPosition::new(placed("o-1", "ada"), 1)])
        .await;
    assert_eq!(response, ProjectResponse::Acknowledge(Some(1)));
}

// ============================================================================
// Projector pool
// ============================================================================

#[tokio::test]
async fn capacity_of_one_evicts_and_reloads() {
    let storage = InMemoryProjectionStorage::new();
    let pool = ProjectorPool::new(
        "order_views",
        order_handlers(),
        Arc::new(storage.clone()),
        &ProjectionStreamConfiguration::default(),
        PassivationSettings::new().with_max_resident(1),
    );

    let a = "o-a".to_string();
    let b = "o-b".to_string();

    let first = pool
        .submit(a.clone(), vec![EventWithPosition::new(placed("o-a", "ada"), 1)])
        .await;
    assert!(first.is_acknowledged());
    let first_instance = pool.worker_instance(&a);

    let second = pool
        .submit(b.clone(), vec![EventWithPosition::new(placed("o-b", "bob"), 2)])
        .await;
    assert!(second.is_acknowledged());
    assert!(!pool.is_resident(&a));
    assert!(pool.is_resident(&b));

    let again = pool
        .submit(a.clone(), vec![EventWithPosition::new(line("o-a", "book"), 3)])
        .await;
    assert_eq!(again, ProjectResponse::Acknowledge(Some(3)));
    assert_ne!(pool.worker_instance(&a), first_instance);
    assert_eq!(pool.resident_count(), 1);

    let view: OrderView = storage.load_document("o-a").await.unwrap().unwrap();
    assert_eq!(view.customer, "ada");
    assert_eq!(view.lines, vec!["book".to_string()]);
}

#[tokio::test]
async fn busy_worker_is_evicted_only_after_its_batch() {
    let started = Arc::new(Notify::new());
    let gate = Arc::new(Notify::new());

    let (on_start, on_gate) = (Arc::clone(&started), Arc::clone(&gate));
    let handlers = ProjectionHandlers::<String, OrderView, OrderEvent>::new().on_async(
        "Placed",
        OrderEvent::order,
        move |event, _, position| {
            let (on_start, on_gate) = (Arc::clone(&on_start), Arc::clone(&on_gate));
            async move {
                let OrderEvent::Placed { order, customer } = event else {
                    return Ok(None);
                };
                if order == "o-slow" {
                    on_start.notify_one();
                    on_gate.notified().await;
                }
                Ok(Some(OrderView {
                    customer,
                    lines: Vec::new(),
                    last_position: position,
                }))
            }
        },
    );

    let storage = InMemoryProjectionStorage::new();
    let pool = ProjectorPool::new(
        "order_views",
        handlers,
        Arc::new(storage.clone()),
        &ProjectionStreamConfiguration::default(),
        PassivationSettings::new().with_max_resident(1),
    );

    let slow = "o-slow".to_string();
    let in_flight = tokio::spawn({
        let pool = pool.clone();
        async move {
            pool.submit("o-slow".into(), vec![EventWithPosition::new(placed("o-slow", "ada"), 1)])
                .await
        }
    });
    started.notified().await;

    let fast = pool
        .submit("o-fast".into(), vec![EventWithPosition::new(placed("o-fast", "bob"), 2)])
        .await;
    assert!(fast.is_acknowledged());
    // Over capacity, but the busy worker is only marked.
    assert!(pool.is_resident(&slow));

    gate.notify_one();
    let slow_response = in_flight.await.unwrap();
    assert_eq!(slow_response, ProjectResponse::Acknowledge(Some(1)));
    assert!(!pool.is_resident(&slow));

    let stored: Option<OrderView> = storage.load_document("o-slow").await.unwrap();
    assert_eq!(stored.map(|v| v.customer), Some("ada".to_string()));
}

#[tokio::test]
async fn bounded_local_pool_projects_every_document() {
    let storage = InMemoryProjectionStorage::new();
    let source = order_source(vec![placed("o-1", "ada"), placed("o-2", "bob"), placed("o-3", "cy")]);

    run_to_completion(
        ProjectionConfiguration::new("order_views", order_handlers(), source)
            .with_storage(storage.clone())
            .with_distribution(Distribution::Local(
                PassivationSettings::new()
                    .with_max_resident(1)
                    .with_passivate_after(Duration::from_millis(10)),
            )),
    )
    .await
    .unwrap();

    assert_eq!(storage.load_all::<OrderView>().unwrap().len(), 3);
}

// ============================================================================
// Storage batching
// ============================================================================

#[tokio::test]
async fn batched_storage_projects_the_same_documents() {
    let storage = InMemoryProjectionStorage::new();
    let source = order_source(vec![
        placed("o-1", "ada"),
        placed("o-2", "bob"),
        line("o-1", "book"),
        line("o-2", "lamp"),
    ]);

    run_to_completion(
        ProjectionConfiguration::new("order_views", order_handlers(), source)
            .with_storage(storage.clone())
            .with_storage_batching(StorageBatching::batched(16, Duration::from_millis(5))),
    )
    .await
    .unwrap();

    let first: OrderView = storage.load_document("o-1").await.unwrap().unwrap();
    let second: OrderView = storage.load_document("o-2").await.unwrap().unwrap();
    assert_eq!(first.lines, vec!["book".to_string()]);
    assert_eq!(second.lines, vec!["lamp".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn concurrent_writes_flush_once_and_last_writer_wins() {
    let storage = InMemoryProjectionStorage::new();
    let session = BatchingStorageSession::spawn(Arc::new(storage.clone()), 16, Duration::from_millis(20));

    let early = OrderView {
        customer: "early".into(),
        ..Default::default()
    };
    let late = OrderView {
        customer: "late".into(),
        ..Default::default()
    };
    let other = OrderView {
        customer: "other".into(),
        ..Default::default()
    };

    let (a, b, c) = tokio::join!(
        session.store(StoreIntent::new().upsert_document("o-1", &early).unwrap()),
        session.store(StoreIntent::new().upsert_document("o-1", &late).unwrap()),
        session.store(StoreIntent::new().upsert_document("o-2", &other).unwrap()),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());

    assert_eq!(storage.store_calls(), 1);
    let winner: OrderView = storage.load_document("o-1").await.unwrap().unwrap();
    assert_eq!(winner.customer, "late");
}

#[tokio::test(start_paused = true)]
async fn full_batch_flushes_before_the_window_elapses() {
    let storage = InMemoryProjectionStorage::new();
    let session = BatchingStorageSession::spawn(Arc::new(storage.clone()), 2, Duration::from_secs(60));
    let view = OrderView::default();
    let started = tokio::time::Instant::now();

    let (a, b) = tokio::join!(
        session.store(StoreIntent::new().upsert_document("o-1", &view).unwrap()),
        session.store(StoreIntent::new().upsert_document("o-2", &view).unwrap()),
    );
    assert!(a.is_ok() && b.is_ok());

    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(storage.store_calls(), 1);
    assert_eq!(storage.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_flush_fails_every_contributor() {
    let storage = FlakyStorage::failing(1);
    let session = BatchingStorageSession::spawn(Arc::new(storage.clone()), 16, Duration::from_millis(20));
    let view = OrderView::default();

    let (a, b) = tokio::join!(
        session.store(StoreIntent::new().upsert_document("o-1", &view).unwrap()),
        session.store(StoreIntent::new().upsert_document("o-2", &view).unwrap()),
    );
    let expected = Err(StorageError::Backend("connection reset".into()));
    assert_eq!(a, expected);
    assert_eq!(b, expected);
    assert!(storage.inner.is_empty());

    session
        .store(StoreIntent::new().upsert_document("o-1", &view).unwrap())
        .await
        .unwrap();
    assert_eq!(storage.inner.len(), 1);
}

#[tokio::test]
async fn status_reports_completion() {
    let mut coordinator = ProjectionsCoordinator::new();
    coordinator
        .register(
            ProjectionConfiguration::new("order_views", order_handlers(), order_source(vec![placed("o-1", "ada")]))
                .build()
                .unwrap(),
        )
        .unwrap();
    coordinator.start();

    let handle = coordinator.get_projection("order_views").unwrap();
    handle.wait_for_completion(None).await.unwrap();
    assert_eq!(handle.status(), ProjectionStatus::Completed);
    assert_eq!(handle.name(), "order_views");
}
