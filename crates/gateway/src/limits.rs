//! Tier limits are sourced from external configuration rather than
//! computed here. `TenantLimitsSource` is the seam a tenant-management
//! collaborator plugs into; the in-tree implementation falls back to
//! `ServerConfig` defaults and, when a pool is configured, an optional
//! Postgres lookup.

use async_trait::async_trait;
use relay_common::{TenantId, TenantLimits, TenantStatus};
use sqlx::PgPool;

#[async_trait]
pub trait TenantLimitsSource: Send + Sync {
    async fn limits_for(&self, tenant_id: &TenantId) -> TenantLimits;
    async fn status_of(&self, tenant_id: &TenantId) -> TenantStatus;
}

/// Reads the `tenants` table (id, max_connections, max_messages_per_day,
/// max_subjects, tier, status); falls back to defaults when the row is
/// absent or the pool is unset, so a bare `relay-gateway` still runs
/// without a tenant-management database wired up.
pub struct ConfiguredTenantLimits {
    pool: Option<PgPool>,
    defaults: TenantLimits,
}

impl ConfiguredTenantLimits {
    pub fn new(pool: Option<PgPool>) -> Self {
        Self {
            pool,
            defaults: TenantLimits::default(),
        }
    }
}

#[async_trait]
impl TenantLimitsSource for ConfiguredTenantLimits {
    async fn limits_for(&self, tenant_id: &TenantId) -> TenantLimits {
        let Some(pool) = &self.pool else {
            return self.defaults;
        };
        let row: Option<(i64, i64, i64)> = sqlx::query_as(
            "SELECT max_connections, max_messages_per_day, max_subjects FROM tenants WHERE id = $1",
        )
        .bind(tenant_id.as_ref())
        .fetch_optional(pool)
        .await
        .unwrap_or(None);

        match row {
            Some((max_connections, max_messages_per_day, max_subjects)) => TenantLimits {
                max_connections: max_connections.max(0) as u32,
                max_messages_per_day: max_messages_per_day.max(0) as u64,
                max_subjects_per_session: max_subjects.max(0) as u32,
            },
            None => self.defaults,
        }
    }

    async fn status_of(&self, tenant_id: &TenantId) -> TenantStatus {
        let Some(pool) = &self.pool else {
            return TenantStatus::Active;
        };
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM tenants WHERE id = $1")
            .bind(tenant_id.as_ref())
            .fetch_optional(pool)
            .await
            .unwrap_or(None);

        match row {
            Some((status,)) if status == "suspended" => TenantStatus::Suspended,
            Some((status,)) if status == "expired" => TenantStatus::Expired,
            _ => TenantStatus::Active,
        }
    }
}
