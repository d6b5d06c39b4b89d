use chrono::{Duration, Utc};
use relay_common::{ConnectionRecord, Role, SessionId, TenantId};
use relay_registry::ConnectionRegistry;

fn get_test_redis_url() -> String {
    std::env::var("TEST_REDIS_URL")
        .expect("TEST_REDIS_URL must be set (use docker-compose.test.yml)")
}

fn sample_record(session_id: SessionId, tenant_id: &str) -> ConnectionRecord {
    ConnectionRecord {
        session_id,
        principal_id: "agent-1".to_string(),
        tenant_id: TenantId::new(tenant_id),
        role: Role::Agent,
        server_instance_id: "instance-a".to_string(),
        opened_at: Utc::now(),
        last_heartbeat_at: Utc::now(),
    }
}

#[tokio::test]
#[ignore]
async fn register_then_list_by_tenant_finds_the_session() {
    let registry = ConnectionRegistry::connect(&get_test_redis_url(), "test_connections")
        .await
        .expect("failed to connect to test Redis");

    let session_id = SessionId::new();
    let record = sample_record(session_id, "tenant-registry-test");
    registry.register(&record).await.unwrap();

    let found = registry.list_by_tenant(&record.tenant_id).await.unwrap();
    assert!(found.iter().any(|r| r.session_id == session_id));

    registry.unregister(&session_id).await.unwrap();
    let after = registry.list_by_tenant(&record.tenant_id).await.unwrap();
    assert!(!after.iter().any(|r| r.session_id == session_id));
}

#[tokio::test]
#[ignore]
async fn heartbeat_on_unknown_session_is_not_found() {
    let registry = ConnectionRegistry::connect(&get_test_redis_url(), "test_connections")
        .await
        .unwrap();

    let err = registry.heartbeat(&SessionId::new()).await.unwrap_err();
    assert!(matches!(err, relay_common::RelayError::NotFound));
}

#[tokio::test]
#[ignore]
async fn list_stale_returns_sessions_past_the_cutoff() {
    let registry = ConnectionRegistry::connect(&get_test_redis_url(), "test_connections")
        .await
        .unwrap();

    let session_id = SessionId::new();
    let mut record = sample_record(session_id, "tenant-stale-test");
    record.last_heartbeat_at = Utc::now() - Duration::minutes(10);
    registry.register(&record).await.unwrap();

    let stale = registry
        .list_stale(Utc::now() - Duration::seconds(90))
        .await
        .unwrap();
    assert!(stale.contains(&session_id));

    registry.unregister(&session_id).await.unwrap();
}
