use chrono::Utc;
use relay_common::TenantId;
use relay_counters::{Direction, MessageCounter, UsageAggregator};
use std::sync::Arc;

fn get_test_redis_url() -> String {
    std::env::var("TEST_REDIS_URL").expect("TEST_REDIS_URL must be set (use docker-compose.test.yml)")
}

fn get_test_database_url() -> String {
    std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set (use docker-compose.test.yml)")
}

#[tokio::test]
#[ignore]
async fn recorded_events_sum_to_the_same_total_across_dimensions() {
    let counter = MessageCounter::connect(&get_test_redis_url()).await.unwrap();
    let tenant = TenantId::new("tenant-counter-test");

    for _ in 0..5 {
        counter
            .record_event(&tenant, "agent-1", "tenant.tenant-counter-test.events.x", Direction::Ingress, 10)
            .await;
    }
    counter.flush().await;

    let today = Utc::now().date_naive();
    let counts = counter
        .read_counts_by_prefix(&format!("stats:d:{today}:{tenant}:"))
        .await
        .unwrap();

    let total_msgs = counts.get(&format!("stats:d:{today}:{tenant}:total:msgs")).copied().unwrap_or(0);
    let client_msgs = counts
        .get(&format!("stats:d:{today}:{tenant}:client:agent-1:msgs"))
        .copied()
        .unwrap_or(0);
    assert_eq!(total_msgs, 5);
    assert_eq!(total_msgs, client_msgs);
}

#[tokio::test]
#[ignore]
async fn sweep_upserts_a_daily_usage_row_readable_via_get_usage() {
    let counter = Arc::new(MessageCounter::connect(&get_test_redis_url()).await.unwrap());
    let tenant = TenantId::new("tenant-aggregator-test");

    counter
        .record_event(&tenant, "agent-1", "tenant.tenant-aggregator-test.events.x", Direction::Egress, 20)
        .await;
    counter.flush().await;

    let aggregator = UsageAggregator::connect(&get_test_database_url(), counter).await.unwrap();
    aggregator.sweep_once().await.unwrap();

    let today = Utc::now().date_naive();
    let usage = aggregator.get_usage(&tenant, today, today).await.unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].1.messages_out, 1);
    assert_eq!(usage[0].1.bytes_out, 20);
}
