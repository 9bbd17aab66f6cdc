use super::*;
use crate::sync::queue::OperationOptions;
use crate::sync::store::QueueStore;
use crate::token_source::StaticToken;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn make_engine(server: &MockServer, online: bool, config: SyncConfig) -> Arc<SyncEngine> {
    make_engine_with_token(server, online, config, StaticToken::anonymous()).await
}

async fn make_engine_with_token(
    server: &MockServer,
    online: bool,
    config: SyncConfig,
    token: StaticToken,
) -> Arc<SyncEngine> {
    make_engine_at(&server.uri(), online, config, token).await
}

async fn make_engine_at(
    base_url: &str,
    online: bool,
    config: SyncConfig,
    token: StaticToken,
) -> Arc<SyncEngine> {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let manager = OperationManager::new(QueueStore::from_pool(pool));
    manager.init().await.unwrap();
    let client = StoryClient::with_base_url(base_url).unwrap();
    Arc::new(
        SyncEngine::new(
            Arc::new(manager),
            client,
            Arc::new(token),
            ConnectivityMonitor::new(online),
        )
        .with_config(config),
    )
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        sync_interval: Duration::from_secs(60),
        request_timeout: Duration::from_secs(5),
    }
}

async fn enqueue(
    engine: &SyncEngine,
    operation_type: OperationType,
    payload: Value,
    max_retries: Option<u32>,
) -> i64 {
    engine
        .manager()
        .add_pending_operation(
            operation_type,
            "/stories",
            payload,
            OperationOptions {
                max_retries,
                ..OperationOptions::default()
            },
        )
        .await
        .unwrap()
}

fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn passes_started(events: &[SyncEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, SyncEvent::Pass { is_syncing: true, .. }))
        .count()
}

async fn wait_until_queue_empty(engine: &SyncEngine) {
    for _ in 0..250 {
        if engine
            .manager()
            .get_pending_operations(None)
            .await
            .unwrap()
            .is_empty()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("queue was not drained");
}

#[tokio::test]
async fn successful_create_is_logged_and_removed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/stories"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "error": false,
            "message": "success"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let engine = make_engine_with_token(
        &server,
        true,
        fast_config(),
        StaticToken::new("secret"),
    )
    .await;
    let id = enqueue(&engine, OperationType::Create, json!({"description": "hi"}), None).await;
    let mut events = engine.manager().subscribe();

    let outcome = engine.sync_all().await.unwrap();

    assert_eq!(
        outcome,
        SyncPassOutcome::Completed {
            processed: 1,
            pending_count: 0
        }
    );
    assert!(engine.manager().get_operation(id).await.unwrap().is_none());
    let log = engine.manager().get_sync_log(50).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].operation_id, id);
    assert_eq!(log[0].status, SyncStatus::Synced);
    assert_eq!(log[0].response.as_ref().unwrap()["message"], "success");
    assert!(engine.last_sync_time().is_some());
    assert!(!engine.is_syncing());

    let events = drain(&mut events);
    assert_eq!(
        events,
        vec![
            SyncEvent::Pass {
                is_syncing: true,
                pending_count: 0,
                last_sync_time: None,
            },
            SyncEvent::Operation {
                operation_id: id,
                status: SyncStatus::Syncing,
                error: None,
            },
            SyncEvent::Operation {
                operation_id: id,
                status: SyncStatus::Synced,
                error: None,
            },
            SyncEvent::Pass {
                is_syncing: false,
                pending_count: 0,
                last_sync_time: engine.last_sync_time(),
            },
        ]
    );
}

#[tokio::test]
async fn delete_fails_after_three_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/stories/42"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let engine = make_engine(&server, true, fast_config()).await;
    let id = enqueue(&engine, OperationType::Delete, json!({"id": 42}), None).await;

    for attempt in 1..=2u32 {
        engine.sync_all().await.unwrap();
        let operation = engine.manager().get_operation(id).await.unwrap().unwrap();
        assert_eq!(operation.status, SyncStatus::Pending);
        assert_eq!(operation.retries, attempt);
        assert_eq!(operation.error, None);
    }
    engine.sync_all().await.unwrap();

    let operation = engine.manager().get_operation(id).await.unwrap().unwrap();
    assert_eq!(operation.status, SyncStatus::Failed);
    assert_eq!(operation.retries, 3);
    assert_eq!(
        operation.error.as_deref(),
        Some("Server error: 500 Internal Server Error")
    );

    let log = engine.manager().get_sync_log(50).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, SyncStatus::Failed);
    assert_eq!(
        log[0].error.as_deref(),
        Some("Server error: 500 Internal Server Error")
    );

    // Failed operations are not picked up by later passes.
    assert_eq!(
        engine.sync_all().await.unwrap(),
        SyncPassOutcome::Completed {
            processed: 0,
            pending_count: 1
        }
    );
}

#[tokio::test]
async fn network_error_returns_operation_to_pending() {
    let engine = make_engine_at(
        "http://127.0.0.1:9",
        true,
        fast_config(),
        StaticToken::anonymous(),
    )
    .await;
    let id = enqueue(&engine, OperationType::Delete, json!({"id": 42}), Some(3)).await;
    let mut events = engine.manager().subscribe();

    engine.sync_all().await.unwrap();

    let transitions: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            SyncEvent::Operation { status, .. } => Some(status),
            SyncEvent::Pass { .. } => None,
        })
        .collect();
    assert_eq!(transitions, vec![SyncStatus::Syncing, SyncStatus::Pending]);
    let operation = engine.manager().get_operation(id).await.unwrap().unwrap();
    assert_eq!(operation.status, SyncStatus::Pending);
    assert_eq!(operation.retries, 1);
    assert!(engine.manager().get_sync_log(50).await.unwrap().is_empty());
}

#[tokio::test]
async fn client_errors_spend_retry_budget_like_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/stories"))
        .respond_with(ResponseTemplate::new(422))
        .expect(2)
        .mount(&server)
        .await;

    let engine = make_engine(&server, true, fast_config()).await;
    let id = enqueue(&engine, OperationType::Create, json!({}), Some(2)).await;

    engine.sync_all().await.unwrap();
    let operation = engine.manager().get_operation(id).await.unwrap().unwrap();
    assert_eq!(operation.status, SyncStatus::Pending);
    assert_eq!(operation.retries, 1);

    engine.sync_all().await.unwrap();
    let operation = engine.manager().get_operation(id).await.unwrap().unwrap();
    assert_eq!(operation.status, SyncStatus::Failed);
    assert_eq!(operation.retries, 2);
    assert_eq!(
        operation.error.as_deref(),
        Some("Server error: 422 Unprocessable Entity")
    );
}

#[tokio::test]
async fn delete_during_request_fails_loudly() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/stories"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({"error": false}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let engine = make_engine(&server, true, fast_config()).await;
    let id = enqueue(&engine, OperationType::Create, json!({"description": "hi"}), None).await;
    let operation = engine.manager().get_operation(id).await.unwrap().unwrap();

    let (result, ()) = tokio::join!(engine.sync_operation(&operation), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.manager().delete_operation(id).await.unwrap();
    });

    assert!(matches!(
        result,
        Err(SyncError::Manager(ManagerError::NotFound(missing))) if missing == id
    ));
    assert!(engine.manager().get_operation(id).await.unwrap().is_none());
    assert!(engine.manager().get_sync_log(50).await.unwrap().is_empty());
    assert!(
        engine
            .manager()
            .get_pending_operations(None)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn storage_failure_still_closes_the_pass() {
    let server = MockServer::start().await;
    let engine = make_engine(&server, true, fast_config()).await;
    let mut events = engine.manager().subscribe();
    engine.manager().close().await;

    assert!(engine.sync_all().await.is_err());

    assert!(!engine.is_syncing());
    assert_eq!(engine.last_sync_time(), None);
    assert_eq!(
        drain(&mut events),
        vec![
            SyncEvent::Pass {
                is_syncing: true,
                pending_count: 0,
                last_sync_time: None,
            },
            SyncEvent::Pass {
                is_syncing: false,
                pending_count: 0,
                last_sync_time: None,
            },
        ]
    );
}

#[tokio::test]
async fn update_targets_resource_path() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/stories/abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let engine = make_engine(&server, true, fast_config()).await;
    let id = enqueue(
        &engine,
        OperationType::Update,
        json!({"id": "abc", "description": "edited"}),
        None,
    )
    .await;
    let operation = engine.manager().get_operation(id).await.unwrap().unwrap();

    let response = engine.sync_operation(&operation).await.unwrap();
    assert_eq!(response, json!({"ok": true}));
}

#[tokio::test]
async fn request_timeout_counts_as_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let engine = make_engine(
        &server,
        true,
        SyncConfig {
            sync_interval: Duration::from_secs(60),
            request_timeout: Duration::from_millis(100),
        },
    )
    .await;
    let id = enqueue(&engine, OperationType::Create, json!({}), Some(1)).await;
    let operation = engine.manager().get_operation(id).await.unwrap().unwrap();

    let err = engine
        .sync_operation(&operation)
        .await
        .expect_err("expected timeout");
    assert!(matches!(err, SyncError::Timeout));

    let operation = engine.manager().get_operation(id).await.unwrap().unwrap();
    assert_eq!(operation.status, SyncStatus::Failed);
    assert_eq!(operation.error.as_deref(), Some("Sync timeout"));
}

#[tokio::test]
async fn offline_pass_is_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let engine = make_engine(&server, false, fast_config()).await;
    let id = enqueue(&engine, OperationType::Create, json!({}), None).await;

    assert_eq!(
        engine.sync_all().await.unwrap(),
        SyncPassOutcome::SkippedOffline
    );
    let operation = engine.manager().get_operation(id).await.unwrap().unwrap();
    assert_eq!(operation.status, SyncStatus::Pending);
    assert_eq!(operation.retries, 0);
}

#[tokio::test]
async fn overlapping_pass_is_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({"error": false}))
                .set_delay(Duration::from_millis(500)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let engine = make_engine(&server, true, fast_config()).await;
    enqueue(&engine, OperationType::Create, json!({}), None).await;

    let first = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.sync_all().await.unwrap() }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(engine.is_syncing());

    assert_eq!(
        engine.sync_all().await.unwrap(),
        SyncPassOutcome::SkippedBusy
    );
    assert_eq!(
        first.await.unwrap(),
        SyncPassOutcome::Completed {
            processed: 1,
            pending_count: 0
        }
    );
    assert!(!engine.is_syncing());
}

#[tokio::test]
async fn retry_failed_requeues_and_syncs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"error": false})))
        .mount(&server)
        .await;

    let engine = make_engine(&server, true, fast_config()).await;
    let id = enqueue(&engine, OperationType::Create, json!({}), Some(1)).await;
    engine.sync_all().await.unwrap();
    assert_eq!(
        engine.manager().get_operation(id).await.unwrap().unwrap().status,
        SyncStatus::Failed
    );

    assert_eq!(engine.retry_failed().await.unwrap(), 1);

    assert!(engine.manager().get_operation(id).await.unwrap().is_none());
    let statuses: Vec<_> = engine
        .manager()
        .get_sync_log(50)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.status)
        .collect();
    assert!(statuses.contains(&SyncStatus::Failed));
    assert!(statuses.contains(&SyncStatus::Synced));
}

#[tokio::test]
async fn requeue_failed_persists_fresh_budget_while_offline() {
    let server = MockServer::start().await;
    let engine = make_engine(&server, true, fast_config()).await;
    let id = enqueue(&engine, OperationType::Create, json!({}), Some(2)).await;
    engine
        .manager()
        .update_operation_status(id, SyncStatus::Failed, Some("boom"))
        .await
        .unwrap();
    engine.connectivity().set_online(false);

    assert_eq!(engine.retry_failed().await.unwrap(), 1);

    let operation = engine.manager().get_operation(id).await.unwrap().unwrap();
    assert_eq!(operation.status, SyncStatus::Pending);
    assert_eq!(operation.retries, 0);
    assert_eq!(operation.error, None);
}

#[tokio::test]
async fn retry_unknown_operation_is_not_found() {
    let server = MockServer::start().await;
    let engine = make_engine(&server, true, fast_config()).await;

    let err = engine
        .retry_operation(77)
        .await
        .expect_err("expected not found");
    assert!(matches!(
        err,
        SyncError::Manager(ManagerError::NotFound(77))
    ));
}

#[tokio::test]
async fn status_reflects_connectivity_and_queue() {
    let server = MockServer::start().await;
    let engine = make_engine(&server, false, fast_config()).await;
    let id = enqueue(&engine, OperationType::Create, json!({}), None).await;
    enqueue(&engine, OperationType::Delete, json!({"id": 1}), None).await;
    engine
        .manager()
        .update_operation_status(id, SyncStatus::Failed, Some("boom"))
        .await
        .unwrap();

    let status = engine.status().await.unwrap();
    assert!(!status.is_online);
    assert!(!status.is_syncing);
    assert_eq!(status.last_sync_time, None);
    assert_eq!(status.pending_count, 2);
    assert_eq!(status.by_status.failed, 1);
    assert_eq!(status.by_operation.delete, 1);
    assert_eq!(status.health, SyncHealth::Offline);

    engine.connectivity().set_online(true);
    let status = engine.status().await.unwrap();
    assert_eq!(status.health, SyncHealth::NeedsAttention);
}

#[tokio::test]
async fn scheduler_runs_one_pass_immediately_when_online() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"error": false})))
        .expect(1)
        .mount(&server)
        .await;

    let engine = make_engine(&server, true, fast_config()).await;
    enqueue(&engine, OperationType::Create, json!({}), None).await;
    let mut events = engine.manager().subscribe();
    let shutdown = CancellationToken::new();
    let scheduler = tokio::spawn(Arc::clone(&engine).run(shutdown.clone()));

    wait_until_queue_empty(&engine).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    scheduler.await.unwrap();

    assert_eq!(passes_started(&drain(&mut events)), 1);
}

#[tokio::test]
async fn scheduler_waits_while_offline_and_resumes_on_reconnect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"error": false})))
        .mount(&server)
        .await;

    let engine = make_engine(
        &server,
        false,
        SyncConfig {
            sync_interval: Duration::from_millis(20),
            request_timeout: Duration::from_secs(5),
        },
    )
    .await;
    let id = enqueue(&engine, OperationType::Create, json!({}), None).await;
    let mut events = engine.manager().subscribe();
    let shutdown = CancellationToken::new();
    let scheduler = tokio::spawn(Arc::clone(&engine).run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(passes_started(&drain(&mut events)), 0);
    assert!(engine.manager().get_operation(id).await.unwrap().is_some());

    engine.connectivity().set_online(true);
    wait_until_queue_empty(&engine).await;

    engine.connectivity().set_online(false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    drain(&mut events);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(passes_started(&drain(&mut events)), 0);

    shutdown.cancel();
    scheduler.await.unwrap();
}

#[tokio::test]
async fn scheduler_stops_between_operations_on_shutdown() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/stories"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({"error": false}))
                .set_delay(Duration::from_millis(800)),
        )
        .mount(&server)
        .await;

    let engine = make_engine(&server, true, fast_config()).await;
    let first = enqueue(&engine, OperationType::Create, json!({"n": 1}), None).await;
    let second = enqueue(&engine, OperationType::Create, json!({"n": 2}), None).await;

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&engine).run(shutdown.clone()));
    for _ in 0..100 {
        if !server.received_requests().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();

    tokio::time::timeout(Duration::from_millis(1_500), handle)
        .await
        .expect("scheduler kept running after shutdown")
        .unwrap();
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert!(engine.manager().get_operation(first).await.unwrap().is_none());
    let untouched = engine.manager().get_operation(second).await.unwrap().unwrap();
    assert_eq!(untouched.status, SyncStatus::Pending);
    assert_eq!(untouched.retries, 0);
    assert!(!engine.is_syncing());
}
