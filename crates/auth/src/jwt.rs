//! Dashboard bearer-token validation.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use relay_common::{RelayError, TenantId, UserId, UserPrincipal};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(rename = "tenant-id")]
    tenant_id: String,
}

pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(hmac_secret: &str, issuer: &str, audience: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.leeway = 30;
        validation.validate_nbf = true;

        Self {
            decoding_key: DecodingKey::from_secret(hmac_secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<UserPrincipal, RelayError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|_| RelayError::AuthRejected)?;
        Ok(UserPrincipal {
            user_id: UserId::new(data.claims.sub),
            tenant_id: TenantId::new(data.claims.tenant_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        #[serde(rename = "tenant-id")]
        tenant_id: String,
        iss: String,
        aud: String,
        exp: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        nbf: Option<i64>,
    }

    fn token_for(secret: &str, exp_offset_secs: i64) -> String {
        token_with_nbf(secret, exp_offset_secs, None)
    }

    fn token_with_nbf(secret: &str, exp_offset_secs: i64, nbf_offset_secs: Option<i64>) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = TestClaims {
            sub: "user-1".into(),
            tenant_id: "tenant-1".into(),
            iss: "relay".into(),
            aud: "relay-dashboard".into(),
            exp: now + exp_offset_secs,
            nbf: nbf_offset_secs.map(|offset| now + offset),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn accepts_a_valid_token() {
        let verifier = JwtVerifier::new("secret", "relay", "relay-dashboard");
        let token = token_for("secret", 300);
        let principal = verifier.verify(&token).unwrap();
        assert_eq!(principal.user_id.as_ref(), "user-1");
        assert_eq!(principal.tenant_id.as_ref(), "tenant-1");
    }

    #[test]
    fn rejects_an_expired_token_past_the_clock_skew_window() {
        let verifier = JwtVerifier::new("secret", "relay", "relay-dashboard");
        let token = token_for("secret", -120);
        assert!(matches!(verifier.verify(&token), Err(RelayError::AuthRejected)));
    }

    #[test]
    fn rejects_a_token_signed_with_the_wrong_secret() {
        let verifier = JwtVerifier::new("secret", "relay", "relay-dashboard");
        let token = token_for("wrong-secret", 300);
        assert!(matches!(verifier.verify(&token), Err(RelayError::AuthRejected)));
    }

    #[test]
    fn rejects_a_token_with_a_future_nbf() {
        let verifier = JwtVerifier::new("secret", "relay", "relay-dashboard");
        let token = token_with_nbf("secret", 300, Some(120));
        assert!(matches!(verifier.verify(&token), Err(RelayError::AuthRejected)));
    }

    #[test]
    fn accepts_a_token_with_nbf_inside_the_clock_skew_window() {
        let verifier = JwtVerifier::new("secret", "relay", "relay-dashboard");
        let token = token_with_nbf("secret", 300, Some(20));
        assert!(verifier.verify(&token).is_ok());
    }
}
