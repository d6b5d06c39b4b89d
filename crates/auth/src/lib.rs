//! `AuthVerifier`: dashboard JWT validation and agent
//! challenge/signature verification, behind one façade the gateway
//! calls regardless of endpoint.

pub mod challenge;
pub mod jwt;
pub mod keys;

pub use challenge::ChallengeStore;
pub use jwt::JwtVerifier;
pub use keys::{AgentKeyRecord, AgentKeyStore, StaticAgentKeyStore, VerificationKey};

use ed25519_dalek::Signature as EdSignature;
use ed25519_dalek::Verifier as _;
use relay_common::{AgentId, AgentPrincipal, RelayError, UserPrincipal};
use rsa::pkcs1v15::Pkcs1v15Sign;
use sha2::Sha256;
use std::sync::Arc;
use tracing::instrument;

pub struct AuthVerifier {
    jwt: JwtVerifier,
    challenges: ChallengeStore,
    keys: Arc<dyn AgentKeyStore>,
}

impl AuthVerifier {
    pub fn new(jwt: JwtVerifier, challenges: ChallengeStore, keys: Arc<dyn AgentKeyStore>) -> Self {
        Self { jwt, challenges, keys }
    }

    #[instrument(skip(self, token))]
    pub fn verify_dashboard_token(&self, token: &str) -> Result<UserPrincipal, RelayError> {
        self.jwt.verify(token)
    }

    pub async fn issue_challenge(&self, agent_id: &AgentId) -> Result<String, RelayError> {
        self.challenges.issue(agent_id).await
    }

    #[instrument(skip(self, signature))]
    pub async fn verify_challenge(&self, agent_id: &AgentId, challenge: &str, signature: &[u8]) -> Result<AgentPrincipal, RelayError> {
        let record = self.challenges.consume(challenge).await?;
        if &record.agent_id != agent_id {
            return Err(RelayError::AuthRejected);
        }

        let key_record = self.keys.lookup(agent_id).await?;
        let challenge_bytes = hex::decode(challenge).map_err(|_| RelayError::AuthRejected)?;

        verify_signature(&key_record.key, &challenge_bytes, signature)?;

        Ok(AgentPrincipal {
            agent_id: agent_id.clone(),
            tenant_id: key_record.tenant_id,
        })
    }
}

/// Validates raw challenge bytes against `signature` using the key's
/// native algorithm. The primitive hashes internally for both
/// algorithms — never pre-hash `message` before calling this.
fn verify_signature(key: &VerificationKey, message: &[u8], signature: &[u8]) -> Result<(), RelayError> {
    match key {
        VerificationKey::Ed25519(verifying_key) => {
            let sig = EdSignature::from_slice(signature).map_err(|_| RelayError::AuthRejected)?;
            verifying_key.verify(message, &sig).map_err(|_| RelayError::AuthRejected)
        }
        VerificationKey::Rsa(public_key) => {
            use sha2::Digest;
            let digest = Sha256::digest(message);
            public_key
                .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
                .map_err(|_| RelayError::AuthRejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn ed25519_round_trip_verifies() {
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let verifying_key = signing_key.verifying_key();
        let message = b"some challenge bytes";

        use ed25519_dalek::Signer;
        let signature = signing_key.sign(message);

        let key = VerificationKey::Ed25519(verifying_key);
        assert!(verify_signature(&key, message, &signature.to_bytes()).is_ok());
    }

    #[test]
    fn ed25519_rejects_a_bad_signature() {
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let verifying_key = signing_key.verifying_key();

        use ed25519_dalek::Signer;
        let signature = signing_key.sign(b"original message");

        let key = VerificationKey::Ed25519(verifying_key);
        assert!(verify_signature(&key, b"tampered message", &signature.to_bytes()).is_err());
    }
}
