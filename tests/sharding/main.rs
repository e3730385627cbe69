//! Integration tests for projections distributed over an in-memory cluster.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use sourced_projections::sharding::partition_for;
use sourced_projections::{
    Distribution, Document, EventWithPosition, InMemoryCluster, InMemoryEventSource,
    InMemoryProjectionStorage, ProjectResponse, ProjectionConfiguration, ProjectionError,
    ProjectionEvent, ProjectionHandlers, ProjectionStorageExt, ProjectionStreamConfiguration,
    ProjectorProxy, ProjectionsCoordinator, ShardingSettings,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Visited {
    page: String,
}

impl ProjectionEvent for Visited {
    fn event_type(&self) -> &str {
        "Visited"
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Document)]
#[document(collection = "page_views")]
struct PageViews {
    total: u64,
}

fn handlers() -> ProjectionHandlers<String, PageViews, Visited> {
    ProjectionHandlers::new().on(
        "Visited",
        |e: &Visited| e.page.clone(),
        |_, doc: Option<PageViews>, _| {
            let mut views = doc.unwrap_or_default();
            views.total += 1;
            Ok(Some(views))
        },
    )
}

/// Handlers that take a while on every event.
fn slow_handlers() -> ProjectionHandlers<String, PageViews, Visited> {
    ProjectionHandlers::new().on_async(
        "Visited",
        |e: &Visited| e.page.clone(),
        |_, doc: Option<PageViews>, _| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut views = doc.unwrap_or_default();
            views.total += 1;
            Ok(Some(views))
        },
    )
}

fn sharded_proxy(
    cluster: &InMemoryCluster,
    storage: &InMemoryProjectionStorage,
    handlers: ProjectionHandlers<String, PageViews, Visited>,
) -> Arc<dyn ProjectorProxy<String, Visited>> {
    Distribution::Sharded(ShardingSettings::new(cluster.clone()).with_number_of_partitions(8))
        .create_proxy(
            "page_views",
            handlers,
            Arc::new(storage.clone()),
            &ProjectionStreamConfiguration::default(),
        )
        .unwrap()
}

/// A page id hashing to `partition` out of 8.
fn page_on_partition(partition: u32) -> String {
    (0..)
        .map(|n| format!("page-{n}"))
        .find(|id| partition_for(id, 8) == partition)
        .unwrap()
}

fn visit(page: &str) -> Visited {
    Visited { page: page.into() }
}

async fn cluster_of(nodes: &[&str]) -> InMemoryCluster {
    let cluster = InMemoryCluster::new();
    for node in nodes {
        cluster.join(*node).await.unwrap();
    }
    cluster
}

#[tokio::test]
async fn sharded_projection_stores_every_document() {
    let cluster = cluster_of(&["node-a", "node-b", "node-c"]).await;
    let storage = InMemoryProjectionStorage::new();
    let pages = ["home", "pricing", "docs", "blog", "about"];
    let source = InMemoryEventSource::new()
        .with_events(pages.iter().chain(pages.iter()).map(|page| visit(page)))
        .unwrap();

    let mut coordinator = ProjectionsCoordinator::new();
    coordinator
        .register(
            ProjectionConfiguration::new("page_views", handlers(), source)
                .with_storage(storage.clone())
                .with_distribution(Distribution::Sharded(
                    ShardingSettings::new(cluster.clone()).with_number_of_partitions(16),
                ))
                .build()
                .unwrap(),
        )
        .unwrap();
    coordinator.start();
    coordinator
        .get_projection("page_views")
        .unwrap()
        .wait_for_completion(Some(Duration::from_secs(10)))
        .await
        .unwrap();

    for page in pages {
        let views: Option<PageViews> = storage.load_document(page).await.unwrap();
        assert_eq!(views, Some(PageViews { total: 2 }), "page {page}");
    }
}

#[tokio::test]
async fn partitions_fail_over_when_the_coordinator_leaves() {
    let cluster = cluster_of(&["node-a", "node-b"]).await;
    let storage = InMemoryProjectionStorage::new();
    let proxy = Distribution::Sharded(ShardingSettings::new(cluster.clone()).with_number_of_partitions(8))
        .create_proxy(
            "page_views",
            handlers(),
            std::sync::Arc::new(storage.clone()),
            &ProjectionStreamConfiguration::default(),
        )
        .unwrap();

    let response = proxy
        .submit("home".into(), vec![EventWithPosition::new(visit("home"), 1)])
        .await;
    assert_eq!(response, ProjectResponse::Acknowledge(Some(1)));

    let coordinator = cluster.coordinator().unwrap();
    let epoch = cluster.partition_table().epoch();
    cluster.leave(&coordinator).await.unwrap();

    let successor = cluster.coordinator().unwrap();
    assert_ne!(successor, coordinator);
    assert!(cluster.partition_table().epoch() > epoch);
    let partition = partition_for("home", 8);
    assert_eq!(cluster.owner_of(partition), Some(successor));

    // The surviving node rebuilds the document from storage.
    let response = proxy
        .submit("home".into(), vec![EventWithPosition::new(visit("home"), 2)])
        .await;
    assert_eq!(response, ProjectResponse::Acknowledge(Some(2)));
    let views: Option<PageViews> = storage.load_document("home").await.unwrap();
    assert_eq!(views, Some(PageViews { total: 2 }));
}

#[tokio::test]
async fn empty_cluster_rejects_with_routing_error() {
    let cluster = InMemoryCluster::new();
    let proxy = Distribution::Sharded(ShardingSettings::new(cluster))
        .create_proxy(
            "page_views",
            handlers(),
            std::sync::Arc::new(InMemoryProjectionStorage::new()),
            &ProjectionStreamConfiguration::default(),
        )
        .unwrap();

    let response = proxy
        .submit("home".into(), vec![EventWithPosition::new(visit("home"), 1)])
        .await;
    assert!(matches!(response, ProjectResponse::Reject(ProjectionError::Routing(_))));
}

#[tokio::test]
async fn zero_partitions_is_a_configuration_error() {
    let cluster = cluster_of(&["node-a"]).await;
    let built = ProjectionConfiguration::new("page_views", handlers(), InMemoryEventSource::new())
        .with_distribution(Distribution::Sharded(
            ShardingSettings::new(cluster).with_number_of_partitions(0),
        ))
        .build();
    assert!(matches!(built, Err(ProjectionError::InvalidConfiguration(_))));
}

// Partition 5 of 8 belongs to node-b out of [a, b] and to node-c out of [a, b, c].

#[tokio::test]
async fn partition_moving_away_and_back_keeps_every_update() {
    let cluster = cluster_of(&["node-a", "node-b"]).await;
    let storage = InMemoryProjectionStorage::new();
    let proxy = sharded_proxy(&cluster, &storage, handlers());
    let page = page_on_partition(5);

    assert_eq!(cluster.owner_of(5).as_deref(), Some("node-b"));
    let response = proxy.submit(page.clone(), vec![EventWithPosition::new(visit(&page), 1)]).await;
    assert_eq!(response, ProjectResponse::Acknowledge(Some(1)));

    cluster.join("node-c").await.unwrap();
    assert_eq!(cluster.owner_of(5).as_deref(), Some("node-c"));
    let response = proxy.submit(page.clone(), vec![EventWithPosition::new(visit(&page), 2)]).await;
    assert_eq!(response, ProjectResponse::Acknowledge(Some(2)));

    cluster.leave("node-c").await.unwrap();
    assert_eq!(cluster.owner_of(5).as_deref(), Some("node-b"));
    let response = proxy.submit(page.clone(), vec![EventWithPosition::new(visit(&page), 3)]).await;
    assert_eq!(response, ProjectResponse::Acknowledge(Some(3)));

    let views: Option<PageViews> = storage.load_document(&page).await.unwrap();
    assert_eq!(views, Some(PageViews { total: 3 }));
}

#[tokio::test(start_paused = true)]
async fn new_owner_waits_for_the_batch_in_flight_on_the_old_owner() {
    let cluster = cluster_of(&["node-a", "node-b"]).await;
    let storage = InMemoryProjectionStorage::new();
    let proxy = sharded_proxy(&cluster, &storage, slow_handlers());
    let page = page_on_partition(5);

    let first = proxy.submit(page.clone(), vec![EventWithPosition::new(visit(&page), 1)]);
    let after_move = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cluster.join("node-c").await.unwrap();
        assert_eq!(cluster.owner_of(5).as_deref(), Some("node-c"));
        proxy
            .submit(page.clone(), vec![EventWithPosition::new(visit(&page), 2)])
            .await
    };
    let (first, second) = tokio::join!(first, after_move);

    assert_eq!(first, ProjectResponse::Acknowledge(Some(1)));
    assert_eq!(second, ProjectResponse::Acknowledge(Some(2)));
    // node-c loaded the document only after node-b had stored it.
    let views: Option<PageViews> = storage.load_document(&page).await.unwrap();
    assert_eq!(views, Some(PageViews { total: 2 }));
}
