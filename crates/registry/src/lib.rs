//! `ConnectionRegistry`: a shared-store view of every live
//! session across instances, backed by Redis.
//!
//! Generalizes `storage/src/redis.rs`'s single-key `set`/`get` wrapper
//! (and the `set_json`/`get_json`/`keys` helpers its own test suite
//! already exercised) into the TTL-keyed hash + sorted-set index this
//! component needs: one JSON blob per session keyed by session id, plus
//! a `ZSET` of `last_heartbeat_at` epoch seconds used for `ListStale`,
//! plus one `SET` per tenant used for `ListByTenant`.

use chrono::Utc;
use redis::AsyncCommands;
use relay_common::{ConnectionRecord, RelayError, SessionId, TenantId};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

const RECORD_TTL_SECS: i64 = 24 * 60 * 60;

pub struct ConnectionRegistry {
    table: String,
    conn: Arc<Mutex<redis::aio::MultiplexedConnection>>,
}

impl ConnectionRegistry {
    pub async fn connect(redis_url: &str, table: &str) -> Result<Self, RelayError> {
        let client = redis::Client::open(redis_url).map_err(|_| RelayError::RegistryUnavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|_| RelayError::RegistryUnavailable)?;
        Ok(Self {
            table: table.to_string(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn record_key(&self, session_id: &SessionId) -> String {
        format!("{}:{}", self.table, session_id)
    }

    fn heartbeat_index_key(&self) -> String {
        format!("{}:heartbeat_index", self.table)
    }

    fn tenant_index_key(&self, tenant_id: &TenantId) -> String {
        format!("{}:tenant:{}", self.table, tenant_id)
    }

    /// Write with TTL 24h, overwriting any existing record for that
    /// session id.
    #[instrument(skip(self, record), fields(session_id = %record.session_id))]
    pub async fn register(&self, record: &ConnectionRecord) -> Result<(), RelayError> {
        let payload = serde_json::to_string(record).map_err(|_| RelayError::InternalError)?;
        let mut conn = self.conn.lock().await;

        let _: () = conn
            .set_ex(self.record_key(&record.session_id), payload, RECORD_TTL_SECS as u64)
            .await
            .map_err(|_| RelayError::RegistryUnavailable)?;

        let score = record.last_heartbeat_at.timestamp() as f64;
        let _: () = conn
            .zadd(self.heartbeat_index_key(), record.session_id.to_string(), score)
            .await
            .map_err(|_| RelayError::RegistryUnavailable)?;

        let _: () = conn
            .sadd(self.tenant_index_key(&record.tenant_id), record.session_id.to_string())
            .await
            .map_err(|_| RelayError::RegistryUnavailable)?;

        Ok(())
    }

    /// Refresh `last_heartbeat_at` and TTL atomically. `NotFound` if
    /// the record was already reaped.
    #[instrument(skip(self))]
    pub async fn heartbeat(&self, session_id: &SessionId) -> Result<(), RelayError> {
        let mut conn = self.conn.lock().await;
        let key = self.record_key(session_id);

        let raw: Option<String> = conn.get(&key).await.map_err(|_| RelayError::RegistryUnavailable)?;
        let raw = raw.ok_or(RelayError::NotFound)?;
        let mut record: ConnectionRecord =
            serde_json::from_str(&raw).map_err(|_| RelayError::InternalError)?;
        record.last_heartbeat_at = Utc::now();

        let payload = serde_json::to_string(&record).map_err(|_| RelayError::InternalError)?;
        let _: () = conn
            .set_ex(&key, payload, RECORD_TTL_SECS as u64)
            .await
            .map_err(|_| RelayError::RegistryUnavailable)?;

        let score = record.last_heartbeat_at.timestamp() as f64;
        let _: () = conn
            .zadd(self.heartbeat_index_key(), session_id.to_string(), score)
            .await
            .map_err(|_| RelayError::RegistryUnavailable)?;

        Ok(())
    }

    /// Delete. Idempotent.
    #[instrument(skip(self))]
    pub async fn unregister(&self, session_id: &SessionId) -> Result<(), RelayError> {
        let mut conn = self.conn.lock().await;
        let key = self.record_key(session_id);

        let raw: Option<String> = conn.get(&key).await.map_err(|_| RelayError::RegistryUnavailable)?;
        if let Some(raw) = raw {
            if let Ok(record) = serde_json::from_str::<ConnectionRecord>(&raw) {
                let _: Result<(), _> = conn
                    .srem(self.tenant_index_key(&record.tenant_id), session_id.to_string())
                    .await;
            }
        }

        let _: () = conn.del(&key).await.map_err(|_| RelayError::RegistryUnavailable)?;
        let _: () = conn
            .zrem(self.heartbeat_index_key(), session_id.to_string())
            .await
            .map_err(|_| RelayError::RegistryUnavailable)?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn list_by_tenant(&self, tenant_id: &TenantId) -> Result<Vec<ConnectionRecord>, RelayError> {
        let mut conn = self.conn.lock().await;
        let session_ids: Vec<String> = conn
            .smembers(self.tenant_index_key(tenant_id))
            .await
            .map_err(|_| RelayError::RegistryUnavailable)?;

        let mut records = Vec::with_capacity(session_ids.len());
        for sid in session_ids {
            let key = format!("{}:{}", self.table, sid);
            let raw: Option<String> = conn.get(&key).await.map_err(|_| RelayError::RegistryUnavailable)?;
            match raw {
                Some(raw) => match serde_json::from_str(&raw) {
                    Ok(record) => records.push(record),
                    Err(_) => warn!(session_id = %sid, "skipping malformed connection record"),
                },
                None => continue, // reaped between SMEMBERS and GET
            }
        }
        Ok(records)
    }

    /// Session ids whose `last_heartbeat_at` is older than `cutoff`.
    #[instrument(skip(self))]
    pub async fn list_stale(&self, cutoff: chrono::DateTime<Utc>) -> Result<Vec<SessionId>, RelayError> {
        let mut conn = self.conn.lock().await;
        let ids: Vec<String> = conn
            .zrangebyscore(self.heartbeat_index_key(), 0, cutoff.timestamp())
            .await
            .map_err(|_| RelayError::RegistryUnavailable)?;

        Ok(ids
            .into_iter()
            .filter_map(|s| uuid::Uuid::parse_str(&s).ok().map(SessionId))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::Role;

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

    #[test]
    fn record_round_trips_through_json() {
        let record = sample_record(SessionId::new(), "t1");
        let json = serde_json::to_string(&record).unwrap();
        let parsed: ConnectionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.session_id, record.session_id);
        assert_eq!(parsed.tenant_id, record.tenant_id);
    }
}
