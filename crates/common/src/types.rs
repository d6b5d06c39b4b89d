//! Shared domain types: tenants, principals, subjects, and the records
//! that travel between the gateway, the registry, and the counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::RelayError;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

id_newtype!(TenantId);
id_newtype!(AgentId);
id_newtype!(UserId);

/// Session ids are server-generated, never client-supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tenant status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
    Expired,
}

/// Tenant tier limits, sourced from the tenants table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantLimits {
    pub max_connections: u32,
    pub max_messages_per_day: u64,
    pub max_subjects_per_session: u32,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            max_connections: 1_000,
            max_messages_per_day: 1_000_000,
            max_subjects_per_session: 128,
        }
    }
}

/// Principal — either an agent or a dashboard user. The tenant id is
/// fixed at creation and never changes for the lifetime of the principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    Agent(AgentPrincipal),
    User(UserPrincipal),
}

impl Principal {
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            Principal::Agent(a) => &a.tenant_id,
            Principal::User(u) => &u.tenant_id,
        }
    }

    pub fn principal_id(&self) -> String {
        match self {
            Principal::Agent(a) => a.agent_id.to_string(),
            Principal::User(u) => u.user_id.to_string(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Principal::Agent(_) => Role::Agent,
            Principal::User(_) => Role::Dashboard,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPrincipal {
    pub agent_id: AgentId,
    pub tenant_id: TenantId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPrincipal {
    pub user_id: UserId,
    pub tenant_id: TenantId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Agent,
    Dashboard,
}

/// Subject — a dot-delimited path rewritten into a tenant's namespace
/// (`tenant.<tenant-id>.<dot-path>`) at the bus level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject(String);

impl Subject {
    /// Rewrite a client-supplied subject into the tenant's namespace.
    /// Accepts the string as-is if it is already correctly prefixed;
    /// rejects anything that would resolve outside the prefix.
    pub fn rewrite_for_tenant(raw: &str, tenant_id: &TenantId) -> Result<Self, RelayError> {
        if raw.is_empty() {
            return Err(RelayError::InvalidFrame("empty subject".into()));
        }
        let prefix = format!("tenant.{}.", tenant_id);
        let full = if raw.starts_with(&prefix) {
            raw.to_string()
        } else if raw.starts_with("tenant.") {
            // Names another tenant's namespace outright — reject.
            return Err(RelayError::InvalidFrame(
                "subject escapes tenant namespace".into(),
            ));
        } else {
            format!("{prefix}{raw}")
        };

        if !full.starts_with(&prefix) {
            return Err(RelayError::InvalidFrame(
                "subject escapes tenant namespace".into(),
            ));
        }
        if full.split('.').any(|tok| tok.is_empty()) {
            return Err(RelayError::InvalidFrame("malformed subject".into()));
        }
        Ok(Subject(full))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wildcards (`*`, `>`) are honored on subscribe, rejected on publish.
    pub fn has_wildcard(&self) -> bool {
        self.0.split('.').any(|tok| tok == "*" || tok == ">")
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The registry's view of a live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ConnectionRecord {
    #[schema(value_type = String)]
    pub session_id: SessionId,
    pub principal_id: String,
    #[schema(value_type = String)]
    pub tenant_id: TenantId,
    pub role: Role,
    pub server_instance_id: String,
    pub opened_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// Challenge — single-use bytes bound to an agent id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeRecord {
    pub agent_id: AgentId,
    pub created_at: DateTime<Utc>,
}

/// Durable per-(tenant, day) usage aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default, utoipa::ToSchema)]
pub struct DailyUsage {
    pub messages_in: i64,
    pub messages_out: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub active_agents: i64,
    pub active_channels: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_bare_subject_into_tenant_namespace() {
        let tenant = TenantId::new("t1");
        let subject = Subject::rewrite_for_tenant("events.x", &tenant).unwrap();
        assert_eq!(subject.as_str(), "tenant.t1.events.x");
    }

    #[test]
    fn accepts_already_prefixed_subject() {
        let tenant = TenantId::new("t1");
        let subject = Subject::rewrite_for_tenant("tenant.t1.events.x", &tenant).unwrap();
        assert_eq!(subject.as_str(), "tenant.t1.events.x");
    }

    #[test]
    fn rejects_escape_into_another_tenant() {
        let tenant = TenantId::new("t1");
        let err = Subject::rewrite_for_tenant("tenant.t2.events.x", &tenant).unwrap_err();
        assert!(matches!(err, RelayError::InvalidFrame(_)));
    }

    #[test]
    fn rejects_malformed_subject_with_empty_token() {
        let tenant = TenantId::new("t1");
        let err = Subject::rewrite_for_tenant("events..x", &tenant).unwrap_err();
        assert!(matches!(err, RelayError::InvalidFrame(_)));
    }

    #[test]
    fn wildcard_detection() {
        let tenant = TenantId::new("t1");
        let wildcard = Subject::rewrite_for_tenant("events.*", &tenant).unwrap();
        assert!(wildcard.has_wildcard());
        let rest = Subject::rewrite_for_tenant("events.>", &tenant).unwrap();
        assert!(rest.has_wildcard());
        let plain = Subject::rewrite_for_tenant("events.x", &tenant).unwrap();
        assert!(!plain.has_wildcard());
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }
}
