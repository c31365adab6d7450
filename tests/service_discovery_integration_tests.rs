use service_router::registry::{HealthReporter, ServiceLookup, WATCH_QUEUE_CAPACITY};
use service_router::{
    EventType, HealthStatus, RouterError, ServiceRegistry, ServiceSpec, ServiceType,
};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn service(id: &str, port: u16) -> service_router::Service {
    ServiceSpec::new(id, "10.0.0.1", port).into_service()
}

#[tokio::test]
async fn test_watchers_see_events_in_commit_order() {
    let registry = ServiceRegistry::new();
    let token = CancellationToken::new();
    let mut events = registry.watch(token.clone()).await;

    registry.register(service("api-1", 8080)).await.unwrap();
    let mut moved = service("api-1", 9090);
    moved.weight = 5;
    registry.update_service(moved).await.unwrap();
    registry
        .update_health_status("api-1", HealthStatus::healthy("ok"))
        .await
        .unwrap();
    registry.unregister("api-1").await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..4 {
        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push((event.event_type, event.service.port));
    }
    assert_eq!(
        seen,
        [
            (EventType::Register, 8080),
            (EventType::Update, 9090),
            (EventType::Health, 9090),
            (EventType::Unregister, 9090),
        ]
    );

    token.cancel();
}

#[tokio::test]
async fn test_every_watcher_gets_each_event() {
    let registry = ServiceRegistry::new();
    let token = CancellationToken::new();
    let mut first = registry.watch(token.clone()).await;
    let mut second = registry.watch(token.clone()).await;
    assert_eq!(registry.watcher_count().await, 2);

    registry.register(service("a", 80)).await.unwrap();
    assert_eq!(first.recv().await.unwrap().service.id, "a");
    assert_eq!(second.recv().await.unwrap().service.id, "a");

    token.cancel();
    // Cancelled watchers are removed and their queues close
    assert!(timeout(Duration::from_secs(1), first.recv())
        .await
        .unwrap()
        .is_none());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(registry.watcher_count().await, 0);
}

#[tokio::test]
async fn test_dropped_receiver_releases_watcher() {
    let registry = ServiceRegistry::new();
    let token = CancellationToken::new();
    let kept = registry.watch(token.clone()).await;
    let dropped = registry.watch(token.clone()).await;
    assert_eq!(registry.watcher_count().await, 2);

    // No cancellation and no further events
    drop(dropped);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(registry.watcher_count().await, 1);

    drop(kept);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(registry.watcher_count().await, 0);
    assert!(!token.is_cancelled());
}

#[tokio::test]
async fn test_slow_watcher_drops_overflow_without_blocking() {
    let registry = ServiceRegistry::new();
    let token = CancellationToken::new();
    let mut events = registry.watch(token.clone()).await;

    let total = WATCH_QUEUE_CAPACITY + 10;
    for i in 0..total {
        registry
            .register(service(&format!("svc-{}", i), 8000))
            .await
            .unwrap();
    }
    assert_eq!(registry.service_count().await, total);

    let mut received = 0;
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.event_type, EventType::Register);
        received += 1;
    }
    assert_eq!(received, WATCH_QUEUE_CAPACITY);

    token.cancel();
}

#[tokio::test]
async fn test_unregister_missing_service() {
    let registry = ServiceRegistry::new();
    let err = registry.unregister("ghost").await.unwrap_err();
    assert!(matches!(err, RouterError::NotFound { .. }));

    let err = registry
        .update_health_status("ghost", HealthStatus::healthy("ok"))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::NotFound { .. }));
}

#[tokio::test]
async fn test_lookup_by_type_and_health() {
    let registry = ServiceRegistry::new();
    registry.register(service("web", 80)).await.unwrap();
    registry
        .register(
            ServiceSpec::new("rpc", "10.0.0.2", 50051)
                .with_type(ServiceType::Grpc)
                .into_service(),
        )
        .await
        .unwrap();
    registry
        .update_health_status("rpc", HealthStatus::healthy("ok"))
        .await
        .unwrap();

    let grpc = registry.get_services_by_type(ServiceType::Grpc).await;
    assert_eq!(grpc.len(), 1);
    assert_eq!(grpc[0].id, "rpc");

    let healthy = registry.get_healthy_services().await;
    assert_eq!(healthy.len(), 1);
    assert_eq!(healthy[0].id, "rpc");
    assert_eq!(registry.healthy_count().await, 1);

    let ids: Vec<String> = registry.get_services().await.into_iter().map(|s| s.id).collect();
    assert_eq!(ids, ["web", "rpc"]);
}
