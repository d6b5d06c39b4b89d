//! Agent verification keys and the lookup collaborator.
//!
//! The `agents` table (tenant-id, agent-id) -> public key lives in a
//! separate management surface; `AgentKeyStore` is the seam a real
//! lookup plugs into. Each registration names exactly one algorithm —
//! there is no dual-key ambiguity to resolve at verification time.

use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use relay_common::{AgentId, RelayError, TenantId};
use rsa::RsaPublicKey;

#[derive(Clone)]
pub enum VerificationKey {
    Ed25519(VerifyingKey),
    Rsa(Box<RsaPublicKey>),
}

#[derive(Clone)]
pub struct AgentKeyRecord {
    pub tenant_id: TenantId,
    pub key: VerificationKey,
}

#[async_trait]
pub trait AgentKeyStore: Send + Sync {
    async fn lookup(&self, agent_id: &AgentId) -> Result<AgentKeyRecord, RelayError>;
}

/// In-memory key store for tests and single-instance deployments without
/// the external CRUD collaborator wired up.
pub struct StaticAgentKeyStore {
    records: std::collections::HashMap<String, AgentKeyRecord>,
}

impl StaticAgentKeyStore {
    pub fn new() -> Self {
        Self {
            records: std::collections::HashMap::new(),
        }
    }

    pub fn insert(&mut self, agent_id: AgentId, record: AgentKeyRecord) {
        self.records.insert(agent_id.0, record);
    }
}

impl Default for StaticAgentKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentKeyStore for StaticAgentKeyStore {
    async fn lookup(&self, agent_id: &AgentId) -> Result<AgentKeyRecord, RelayError> {
        self.records
            .get(agent_id.as_ref())
            .cloned()
            .ok_or(RelayError::AuthRejected)
    }
}
