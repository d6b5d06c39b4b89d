//! In-memory batching in front of a fast Redis increment store.
//!
//! Counts every message traversing the gateway along three dimensions
//! — `(tenant, total)`, `(tenant, client, principal)`, `(tenant,
//! subject, subject)` — coalesced for up to 1s or 1024 events,
//! whichever comes first, then flushed as one `INCRBY` per key. A
//! flush failure retains the buffered delta for up to 10s; older
//! deltas are dropped with a metric rather than retried forever.

use chrono::{NaiveDate, Utc};
use redis::AsyncCommands;
use relay_common::{RelayError, TenantId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, instrument, warn};

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const FLUSH_EVENT_THRESHOLD: usize = 1024;
const MAX_RETAINED_BUFFER_AGE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Ingress => "in",
            Direction::Egress => "out",
        }
    }
}

struct Buffer {
    deltas: HashMap<String, i64>,
    event_count: usize,
    oldest_unflushed_at: Option<tokio::time::Instant>,
}

impl Buffer {
    fn new() -> Self {
        Self {
            deltas: HashMap::new(),
            event_count: 0,
            oldest_unflushed_at: None,
        }
    }

    fn bump(&mut self, key: String, by: i64) {
        *self.deltas.entry(key).or_insert(0) += by;
        if self.oldest_unflushed_at.is_none() {
            self.oldest_unflushed_at = Some(tokio::time::Instant::now());
        }
    }
}

pub struct MessageCounter {
    conn: Arc<Mutex<redis::aio::MultiplexedConnection>>,
    buffer: Arc<Mutex<Buffer>>,
    dropped_deltas: Arc<std::sync::atomic::AtomicU64>,
}

impl MessageCounter {
    pub async fn connect(redis_url: &str) -> Result<Self, RelayError> {
        let client = redis::Client::open(redis_url).map_err(|_| RelayError::CounterStoreUnavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|_| RelayError::CounterStoreUnavailable)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            buffer: Arc::new(Mutex::new(Buffer::new())),
            dropped_deltas: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        })
    }

    /// Record one message event: +1 to each of the three dimensions,
    /// plus an auxiliary ingress/egress split used only by
    /// `UsageAggregator` to populate `DailyUsage.messages_in/out`.
    pub async fn record_event(&self, tenant_id: &TenantId, principal_id: &str, subject: &str, direction: Direction, payload_len: usize) {
        let date = Utc::now().date_naive();
        let mut buffer = self.buffer.lock().await;

        for (suffix, amount) in [("msgs", 1i64), ("bytes", payload_len as i64)] {
            buffer.bump(total_key(tenant_id, date, suffix), amount);
            buffer.bump(client_key(tenant_id, principal_id, date, suffix), amount);
            buffer.bump(subject_key(tenant_id, subject, date, suffix), amount);
            buffer.bump(direction_key(tenant_id, direction, date, suffix), amount);
        }
        buffer.event_count += 1;

        let should_flush_now = buffer.event_count >= FLUSH_EVENT_THRESHOLD;
        drop(buffer);
        if should_flush_now {
            self.flush().await;
        }
    }

    /// Run forever, flushing every second (or whenever `record_event`
    /// already triggered an early flush).
    pub async fn run_flush_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        loop {
            interval.tick().await;
            self.flush().await;
        }
    }

    #[instrument(skip(self))]
    pub async fn flush(&self) {
        let pending = {
            let mut buffer = self.buffer.lock().await;
            if buffer.deltas.is_empty() {
                return;
            }
            std::mem::replace(&mut buffer.deltas, HashMap::new())
        };

        let mut conn = self.conn.lock().await;
        let mut pipe = redis::pipe();
        for (key, amount) in &pending {
            pipe.cmd("INCRBY").arg(key).arg(*amount).ignore();
        }

        match pipe.query_async::<()>(&mut *conn).await {
            Ok(()) => {
                let mut buffer = self.buffer.lock().await;
                if buffer.deltas.is_empty() {
                    buffer.event_count = 0;
                    buffer.oldest_unflushed_at = None;
                }
            }
            Err(e) => {
                error!(error = %e, "counter flush failed, retaining delta");
                let mut buffer = self.buffer.lock().await;
                for (key, amount) in pending {
                    buffer.bump(key, amount);
                }
                if let Some(oldest) = buffer.oldest_unflushed_at {
                    if oldest.elapsed() > MAX_RETAINED_BUFFER_AGE {
                        let dropped = buffer.deltas.len() as u64;
                        self.dropped_deltas
                            .fetch_add(dropped, std::sync::atomic::Ordering::Relaxed);
                        warn!(dropped, "dropping counter deltas older than 10s retention window");
                        buffer.deltas.clear();
                        buffer.event_count = 0;
                        buffer.oldest_unflushed_at = None;
                    }
                }
            }
        }
    }

    pub fn dropped_delta_count(&self) -> u64 {
        self.dropped_deltas.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Today's `total`/`msgs` count for `tenant_id`, combining the
    /// flushed Redis value with whatever delta is still sitting in the
    /// buffer. Used for quota checks, where undercounting by up to a
    /// flush interval would let a tenant briefly exceed its limit.
    pub async fn today_total_messages(&self, tenant_id: &TenantId) -> Result<i64, RelayError> {
        let key = total_key(tenant_id, Utc::now().date_naive(), "msgs");
        let buffered = {
            let buffer = self.buffer.lock().await;
            buffer.deltas.get(&key).copied().unwrap_or(0)
        };
        let mut conn = self.conn.lock().await;
        let stored: Option<i64> = conn.get(&key).await.map_err(|_| RelayError::CounterStoreUnavailable)?;
        Ok(stored.unwrap_or(0) + buffered)
    }

    pub async fn read_counts_by_prefix(&self, prefix: &str) -> Result<HashMap<String, i64>, RelayError> {
        let mut conn = self.conn.lock().await;
        let keys: Vec<String> = conn
            .keys(format!("{prefix}*"))
            .await
            .map_err(|_| RelayError::CounterStoreUnavailable)?;
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let values: Vec<Option<i64>> = conn.get(&keys).await.map_err(|_| RelayError::CounterStoreUnavailable)?;
        Ok(keys.into_iter().zip(values).filter_map(|(k, v)| v.map(|v| (k, v))).collect())
    }
}

fn total_key(tenant_id: &TenantId, date: NaiveDate, suffix: &str) -> String {
    format!("stats:d:{date}:{tenant_id}:total:{suffix}")
}

fn client_key(tenant_id: &TenantId, principal_id: &str, date: NaiveDate, suffix: &str) -> String {
    format!("stats:d:{date}:{tenant_id}:client:{principal_id}:{suffix}")
}

fn subject_key(tenant_id: &TenantId, subject: &str, date: NaiveDate, suffix: &str) -> String {
    format!("stats:d:{date}:{tenant_id}:subject:{subject}:{suffix}")
}

fn direction_key(tenant_id: &TenantId, direction: Direction, date: NaiveDate, suffix: &str) -> String {
    format!("stats:d:{date}:{tenant_id}:dir:{}:{suffix}", direction.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_formats_match_the_documented_grammar() {
        let tenant = TenantId::new("t1");
        let date = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        assert_eq!(total_key(&tenant, date, "msgs"), "stats:d:2026-08-01:t1:total:msgs");
        assert_eq!(
            client_key(&tenant, "agent-1", date, "msgs"),
            "stats:d:2026-08-01:t1:client:agent-1:msgs"
        );
        assert_eq!(
            subject_key(&tenant, "events.x", date, "bytes"),
            "stats:d:2026-08-01:t1:subject:events.x:bytes"
        );
    }
}
