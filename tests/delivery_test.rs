//! End-to-end delivery worker tests against in-memory repositories and
//! a mock HTTP endpoint.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hookstream::{
    compute_signature, AppId, Application, DeliveryError, DeliveryId, DeliveryMetadata,
    DeliveryMode, DeliveryStatus, DeliveryWorker, Endpoint, EndpointAuth, EndpointId,
    EndpointStatus, EventDelivery, EventId, FilterConfig, Group, GroupConfig, GroupId,
    HashAlgorithm, InMemoryQueue, InMemoryRateLimiter, InMemoryStore, NotificationPayload,
    RateLimitConfig, SourceId, StrategyConfig, StrategyType, Subscription, SubscriptionId,
    SubscriptionStatus, TaskQueue, ENDPOINT_DISABLED, ENDPOINT_ENABLED, EVENT_PROCESSOR,
    NOTIFICATION_PROCESSOR,
};

const PAYLOAD: &str = r#"{"event":"invoice.completed"}"#;
const SECRET: &str = "webhook-secret";

struct Harness {
    store: Arc<InMemoryStore>,
    queue: Arc<InMemoryQueue>,
    worker: DeliveryWorker,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(InMemoryQueue::new());
    let limiter = Arc::new(InMemoryRateLimiter::new());

    let worker = DeliveryWorker::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        queue.clone(),
        limiter,
    )
    .expect("failed to build worker");

    Harness {
        store,
        queue,
        worker,
    }
}

fn group() -> Group {
    Group {
        id: GroupId("grp-1".into()),
        name: "default".into(),
        config: GroupConfig {
            strategy: StrategyConfig {
                strategy: StrategyType::Linear,
                duration: 20,
                retry_count: 3,
            },
            ..GroupConfig::default()
        },
    }
}

fn application() -> Application {
    Application {
        id: AppId("app-1".into()),
        group_id: GroupId("grp-1".into()),
        name: "billing".into(),
        support_email: Some("ops@example.com".into()),
        disabled: false,
    }
}

fn endpoint(url: &str, status: EndpointStatus) -> Endpoint {
    Endpoint {
        id: EndpointId("ep-1".into()),
        target_url: url.to_string(),
        secret: SECRET.into(),
        authentication: None,
        rate_limit: RateLimitConfig::default(),
        description: String::new(),
        status,
    }
}

fn subscription(status: SubscriptionStatus, disable_endpoint: Option<bool>) -> Subscription {
    Subscription {
        id: SubscriptionId("sub-1".into()),
        name: "invoices".into(),
        app_id: AppId("app-1".into()),
        source_id: SourceId("src-1".into()),
        endpoint_id: EndpointId("ep-1".into()),
        status,
        filter: FilterConfig {
            event_types: vec!["*".into()],
        },
        retry_config: None,
        rate_limit_config: None,
        disable_endpoint,
    }
}

fn delivery(id: &str, status: DeliveryStatus, num_trials: u32, retry_limit: u32) -> EventDelivery {
    EventDelivery {
        id: DeliveryId(id.into()),
        event_id: EventId("evt-1".into()),
        endpoint_id: EndpointId("ep-1".into()),
        app_id: AppId("app-1".into()),
        subscription_id: SubscriptionId("sub-1".into()),
        group_id: GroupId("grp-1".into()),
        device_id: None,
        mode: DeliveryMode::Http,
        cli_metadata: None,
        metadata: DeliveryMetadata {
            payload: PAYLOAD.as_bytes().to_vec(),
            num_trials,
            retry_limit,
            interval_seconds: 20,
            next_send_time: Utc::now(),
        },
        status,
        attempts: Vec::new(),
        created_at: Utc::now(),
    }
}

async fn seed(
    harness: &Harness,
    server: &MockServer,
    endpoint_status: EndpointStatus,
    sub: Subscription,
    deliveries: Vec<EventDelivery>,
) {
    let url = format!("{}/webhook", server.uri());
    harness.store.insert_group(group()).await;
    harness.store.insert_application(application()).await;
    harness
        .store
        .insert_endpoint(&AppId("app-1".into()), endpoint(&url, endpoint_status))
        .await;
    harness.store.insert_subscription(sub).await;
    for d in deliveries {
        harness.store.insert_delivery(d).await;
    }
}

async fn take_notification(harness: &Harness) -> Option<NotificationPayload> {
    let mut rx = harness.queue.subscribe(NOTIFICATION_PROCESSOR).await;
    match rx.try_recv() {
        Ok(bytes) => Some(serde_json::from_slice(&bytes).expect("notification payload")),
        Err(_) => None,
    }
}

#[tokio::test]
async fn terminal_delivery_is_skipped_without_side_effects() {
    let harness = harness();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    seed(
        &harness,
        &server,
        EndpointStatus::Active,
        subscription(SubscriptionStatus::Active, None),
        vec![delivery("d-1", DeliveryStatus::Success, 1, 3)],
    )
    .await;

    harness
        .worker
        .process(&DeliveryId("d-1".into()))
        .await
        .unwrap();

    let stored = harness.store.delivery(&DeliveryId("d-1".into())).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Success);
    assert!(stored.attempts.is_empty());
    assert_eq!(stored.metadata.num_trials, 1);
}

#[tokio::test]
async fn inactive_subscription_discards_without_posting() {
    let harness = harness();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    seed(
        &harness,
        &server,
        EndpointStatus::Active,
        subscription(SubscriptionStatus::Inactive, None),
        vec![delivery("d-1", DeliveryStatus::Scheduled, 0, 3)],
    )
    .await;

    harness
        .worker
        .process(&DeliveryId("d-1".into()))
        .await
        .unwrap();

    let stored = harness.store.delivery(&DeliveryId("d-1".into())).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Discarded);
    assert!(stored.attempts.is_empty());
}

#[tokio::test]
async fn failed_attempt_schedules_linear_retry() {
    let harness = harness();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    seed(
        &harness,
        &server,
        EndpointStatus::Active,
        subscription(SubscriptionStatus::Active, None),
        vec![delivery("d-1", DeliveryStatus::Scheduled, 0, 3)],
    )
    .await;

    let err = harness
        .worker
        .process(&DeliveryId("d-1".into()))
        .await
        .unwrap_err();
    match err {
        DeliveryError::Endpoint { delay, .. } => assert_eq!(delay, Duration::from_secs(20)),
        other => panic!("expected endpoint error, got: {other}"),
    }

    let stored = harness.store.delivery(&DeliveryId("d-1".into())).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Retry);
    assert_eq!(stored.metadata.num_trials, 1);
    assert_eq!(stored.attempts.len(), 1);
    assert_eq!(stored.attempts[0].status_code, Some(400));
}

#[tokio::test]
async fn exhaustion_on_success_keeps_subscription_active() {
    let harness = harness();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    seed(
        &harness,
        &server,
        EndpointStatus::Active,
        subscription(SubscriptionStatus::Active, Some(true)),
        vec![delivery("d-1", DeliveryStatus::Retry, 2, 3)],
    )
    .await;

    harness
        .worker
        .process(&DeliveryId("d-1".into()))
        .await
        .unwrap();

    let stored = harness.store.delivery(&DeliveryId("d-1".into())).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Success);
    assert_eq!(stored.metadata.num_trials, 3);

    let sub = harness
        .store
        .subscription(&SubscriptionId("sub-1".into()))
        .await
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn exhaustion_with_disable_opt_out_keeps_subscription_active() {
    let harness = harness();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    // Group default would disable; the subscription's explicit false wins.
    let mut grp = group();
    grp.config.disable_endpoint = true;
    harness.store.insert_group(grp).await;
    harness.store.insert_application(application()).await;
    harness
        .store
        .insert_endpoint(
            &AppId("app-1".into()),
            endpoint(
                &format!("{}/webhook", server.uri()),
                EndpointStatus::Active,
            ),
        )
        .await;
    harness
        .store
        .insert_subscription(subscription(SubscriptionStatus::Active, Some(false)))
        .await;
    harness
        .store
        .insert_delivery(delivery("d-1", DeliveryStatus::Retry, 2, 3))
        .await;

    harness
        .worker
        .process(&DeliveryId("d-1".into()))
        .await
        .unwrap();

    let stored = harness.store.delivery(&DeliveryId("d-1".into())).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Discarded);

    let sub = harness
        .store
        .subscription(&SubscriptionId("sub-1".into()))
        .await
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert!(take_notification(&harness).await.is_none());
}

#[tokio::test]
async fn exhaustion_with_disable_deactivates_subscription() {
    let harness = harness();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    seed(
        &harness,
        &server,
        EndpointStatus::Active,
        subscription(SubscriptionStatus::Active, Some(true)),
        vec![delivery("d-1", DeliveryStatus::Retry, 2, 3)],
    )
    .await;

    harness
        .worker
        .process(&DeliveryId("d-1".into()))
        .await
        .unwrap();

    let stored = harness.store.delivery(&DeliveryId("d-1".into())).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Discarded);
    assert_eq!(stored.metadata.num_trials, 3);

    let sub = harness
        .store
        .subscription(&SubscriptionId("sub-1".into()))
        .await
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Inactive);

    let notification = take_notification(&harness).await.expect("notification task");
    assert_eq!(notification.event, ENDPOINT_DISABLED);
    assert_eq!(notification.endpoint_id, "ep-1");
    assert_eq!(notification.support_email.as_deref(), Some("ops@example.com"));
}

#[tokio::test]
async fn pending_subscription_is_activated_on_first_success() {
    let harness = harness();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    seed(
        &harness,
        &server,
        EndpointStatus::Pending,
        subscription(SubscriptionStatus::Pending, None),
        vec![delivery("d-1", DeliveryStatus::Scheduled, 0, 3)],
    )
    .await;

    harness
        .worker
        .process(&DeliveryId("d-1".into()))
        .await
        .unwrap();

    let sub = harness
        .store
        .subscription(&SubscriptionId("sub-1".into()))
        .await
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);

    let ep = harness
        .store
        .endpoint(&AppId("app-1".into()), &EndpointId("ep-1".into()))
        .await
        .unwrap();
    assert_eq!(ep.status, EndpointStatus::Active);

    let notification = take_notification(&harness).await.expect("notification task");
    assert_eq!(notification.event, ENDPOINT_ENABLED);
}

#[tokio::test]
async fn request_carries_signature_and_custom_auth() {
    let harness = harness();
    let server = MockServer::start().await;

    let signature = compute_signature(HashAlgorithm::Sha256, SECRET, PAYLOAD.as_bytes());
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .and(header("Content-Type", "application/json"))
        .and(header("X-Webhook-Signature", signature.as_str()))
        .and(header("Authorization", "Bearer t0k3n"))
        .and(body_string(PAYLOAD))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/webhook", server.uri());
    harness.store.insert_group(group()).await;
    harness.store.insert_application(application()).await;
    let mut ep = endpoint(&url, EndpointStatus::Active);
    ep.authentication = Some(EndpointAuth {
        header_name: "Authorization".into(),
        header_value: "Bearer t0k3n".into(),
    });
    harness
        .store
        .insert_endpoint(&AppId("app-1".into()), ep)
        .await;
    harness
        .store
        .insert_subscription(subscription(SubscriptionStatus::Active, None))
        .await;
    harness
        .store
        .insert_delivery(delivery("d-1", DeliveryStatus::Scheduled, 0, 3))
        .await;

    harness
        .worker
        .process(&DeliveryId("d-1".into()))
        .await
        .unwrap();

    let stored = harness.store.delivery(&DeliveryId("d-1".into())).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Success);
}

#[tokio::test]
async fn rate_limited_delivery_is_deferred_without_an_attempt() {
    let harness = harness();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut sub = subscription(SubscriptionStatus::Active, None);
    sub.rate_limit_config = Some(RateLimitConfig {
        count: 1,
        duration: 60,
    });
    seed(
        &harness,
        &server,
        EndpointStatus::Active,
        sub,
        vec![
            delivery("d-1", DeliveryStatus::Scheduled, 0, 3),
            delivery("d-2", DeliveryStatus::Scheduled, 0, 3),
        ],
    )
    .await;

    harness
        .worker
        .process(&DeliveryId("d-1".into()))
        .await
        .unwrap();

    let err = harness
        .worker
        .process(&DeliveryId("d-2".into()))
        .await
        .unwrap_err();
    match err {
        DeliveryError::RateLimited { reset } => assert!(reset <= Duration::from_secs(60)),
        other => panic!("expected rate-limited error, got: {other}"),
    }

    // Gate fired before any status write or POST.
    let deferred = harness.store.delivery(&DeliveryId("d-2".into())).await.unwrap();
    assert_eq!(deferred.status, DeliveryStatus::Scheduled);
    assert!(deferred.attempts.is_empty());
    assert_eq!(deferred.metadata.num_trials, 0);
}

#[tokio::test]
async fn orphaned_delivery_is_non_retryable_and_untouched() {
    let harness = harness();

    harness.store.insert_group(group()).await;
    harness.store.insert_application(application()).await;
    // No endpoint seeded: the delivery references a deleted endpoint.
    harness
        .store
        .insert_subscription(subscription(SubscriptionStatus::Active, None))
        .await;
    harness
        .store
        .insert_delivery(delivery("d-1", DeliveryStatus::Scheduled, 0, 3))
        .await;

    let err = harness
        .worker
        .process(&DeliveryId("d-1".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::NonRetryable(_)));

    let stored = harness.store.delivery(&DeliveryId("d-1".into())).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Scheduled);
    assert!(stored.attempts.is_empty());
}

#[tokio::test]
async fn manual_retry_past_the_limit_can_still_succeed() {
    let harness = harness();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    seed(
        &harness,
        &server,
        EndpointStatus::Active,
        subscription(SubscriptionStatus::Active, Some(true)),
        vec![delivery("d-1", DeliveryStatus::Retry, 3, 3)],
    )
    .await;

    harness
        .worker
        .process(&DeliveryId("d-1".into()))
        .await
        .unwrap();

    let stored = harness.store.delivery(&DeliveryId("d-1".into())).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Success);
    // One slot past the limit, for exactly this case.
    assert_eq!(stored.metadata.num_trials, stored.metadata.retry_limit + 1);
}

#[tokio::test]
async fn worker_pool_retries_until_the_endpoint_recovers() {
    let harness = harness();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut grp = group();
    grp.config.strategy.duration = 1;
    harness.store.insert_group(grp).await;
    harness.store.insert_application(application()).await;
    harness
        .store
        .insert_endpoint(
            &AppId("app-1".into()),
            endpoint(
                &format!("{}/webhook", server.uri()),
                EndpointStatus::Active,
            ),
        )
        .await;
    harness
        .store
        .insert_subscription(subscription(SubscriptionStatus::Active, None))
        .await;
    harness
        .store
        .insert_delivery(delivery("d-1", DeliveryStatus::Scheduled, 0, 3))
        .await;

    let rx = harness.queue.subscribe(EVENT_PROCESSOR).await;
    let token = tokio_util::sync::CancellationToken::new();
    let worker = Arc::new(
        DeliveryWorker::new(
            harness.store.clone(),
            harness.store.clone(),
            harness.store.clone(),
            harness.store.clone(),
            harness.queue.clone(),
            Arc::new(InMemoryRateLimiter::new()),
        )
        .unwrap(),
    );
    let handles = hookstream::run_workers(
        rx,
        worker,
        harness.queue.clone(),
        token.clone(),
        2,
    );

    harness
        .queue
        .write(
            EVENT_PROCESSOR,
            hookstream::DEFAULT_LANE,
            b"d-1".to_vec(),
            Duration::ZERO,
        )
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let stored = harness.store.delivery(&DeliveryId("d-1".into())).await.unwrap();
        if stored.status == DeliveryStatus::Success {
            assert_eq!(stored.metadata.num_trials, 2);
            assert_eq!(stored.attempts.len(), 2);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "delivery never succeeded: {:?}",
            stored.status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    token.cancel();
    for handle in handles {
        let _ = handle.await;
    }
}
