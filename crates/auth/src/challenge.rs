//! Agent challenge issuance and single-use verification, backed by the
//! same Redis store as the connection registry (separate keyspace).

use chrono::Utc;
use rand::RngCore;
use redis::AsyncCommands;
use relay_common::{AgentId, ChallengeRecord, RelayError};
use std::sync::Arc;
use tokio::sync::Mutex;

const CHALLENGE_TTL_SECS: u64 = 5 * 60;

pub struct ChallengeStore {
    conn: Arc<Mutex<redis::aio::MultiplexedConnection>>,
}

impl ChallengeStore {
    pub async fn connect(redis_url: &str) -> Result<Self, RelayError> {
        let client = redis::Client::open(redis_url).map_err(|_| RelayError::RegistryUnavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|_| RelayError::RegistryUnavailable)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Generates 32 bytes of randomness, hex-encodes it as the challenge
    /// value, and writes the record with a 5 minute TTL.
    pub async fn issue(&self, agent_id: &AgentId) -> Result<String, RelayError> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let challenge = hex::encode(bytes);

        let record = ChallengeRecord {
            agent_id: agent_id.clone(),
            created_at: Utc::now(),
        };
        let payload = serde_json::to_string(&record).map_err(|_| RelayError::InternalError)?;

        let mut conn = self.conn.lock().await;
        let _: () = conn
            .set_ex(challenge_key(&challenge), payload, CHALLENGE_TTL_SECS)
            .await
            .map_err(|_| RelayError::RegistryUnavailable)?;
        Ok(challenge)
    }

    /// Atomically reads and deletes the challenge record. Returns
    /// `AuthRejected` if it was never issued, already consumed, or
    /// expired.
    pub async fn consume(&self, challenge: &str) -> Result<ChallengeRecord, RelayError> {
        let mut conn = self.conn.lock().await;
        let payload: Option<String> = conn
            .get_del(challenge_key(challenge))
            .await
            .map_err(|_| RelayError::RegistryUnavailable)?;
        let payload = payload.ok_or(RelayError::AuthRejected)?;
        serde_json::from_str(&payload).map_err(|_| RelayError::AuthRejected)
    }
}

fn challenge_key(challenge: &str) -> String {
    format!("challenge:{challenge}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_key_is_namespaced() {
        assert_eq!(challenge_key("abc"), "challenge:abc");
    }
}
