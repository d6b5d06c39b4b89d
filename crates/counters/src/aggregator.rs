//! Sweeps the live Redis counters into durable `daily_usage` rows and
//! answers `get_usage` by stitching durable history with whatever
//! counts are still live for the current (open) day.

use crate::counter::MessageCounter;
use chrono::{NaiveDate, Utc};
use relay_common::{DailyUsage, RelayError, TenantId};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct UsageAggregator {
    pool: PgPool,
    counter: Arc<MessageCounter>,
}

impl UsageAggregator {
    pub async fn connect(database_url: &str, counter: Arc<MessageCounter>) -> Result<Self, RelayError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|_| RelayError::InternalError)?;
        Ok(Self { pool, counter })
    }

    /// Run forever, snapshotting every known tenant's live counters into
    /// `daily_usage` once per sweep interval.
    pub async fn run_sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = self.sweep_once().await {
                warn!(error = %e, "usage sweep failed");
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<(), RelayError> {
        let today = Utc::now().date_naive();
        let counts = self
            .counter
            .read_counts_by_prefix(&format!("stats:d:{today}:"))
            .await?;

        let mut by_tenant: std::collections::HashMap<String, DailyUsage> = std::collections::HashMap::new();
        for (key, value) in &counts {
            let parts: Vec<&str> = key.split(':').collect();
            // stats : d : <date> : <tenant> : dir : <in|out> : <msgs|bytes>
            if parts.len() < 7 || parts[4] != "dir" {
                continue;
            }
            let tenant = parts[3].to_string();
            let usage = by_tenant.entry(tenant).or_default();
            match (parts[5], parts[6]) {
                ("in", "msgs") => usage.messages_in += value,
                ("in", "bytes") => usage.bytes_in += value,
                ("out", "msgs") => usage.messages_out += value,
                ("out", "bytes") => usage.bytes_out += value,
                _ => {}
            }
        }

        for (tenant, usage) in &by_tenant {
            self.upsert_daily_usage(&TenantId::new(tenant.clone()), today, usage).await?;
        }
        info!(tenants = by_tenant.len(), "usage sweep complete");
        Ok(())
    }

    async fn upsert_daily_usage(&self, tenant_id: &TenantId, date: NaiveDate, usage: &DailyUsage) -> Result<(), RelayError> {
        sqlx::query(
            r#"
            INSERT INTO daily_usage
                (tenant_id, date, messages_in, messages_out, bytes_in, bytes_out, active_agents, active_channels)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant_id, date) DO UPDATE SET
                messages_in = EXCLUDED.messages_in,
                messages_out = EXCLUDED.messages_out,
                bytes_in = EXCLUDED.bytes_in,
                bytes_out = EXCLUDED.bytes_out,
                active_agents = EXCLUDED.active_agents,
                active_channels = EXCLUDED.active_channels
            "#,
        )
        .bind(tenant_id.as_ref())
        .bind(date)
        .bind(usage.messages_in)
        .bind(usage.messages_out)
        .bind(usage.bytes_in)
        .bind(usage.bytes_out)
        .bind(usage.active_agents)
        .bind(usage.active_channels)
        .execute(&self.pool)
        .await
        .map_err(|_| RelayError::InternalError)?;
        Ok(())
    }

    /// Read usage across `[from_date, to_date]`. Durable days come from
    /// Postgres; if `to_date` is today, the open day's row is replaced
    /// with a freshly-swept snapshot of the live counters.
    pub async fn get_usage(&self, tenant_id: &TenantId, from_date: NaiveDate, to_date: NaiveDate) -> Result<Vec<(NaiveDate, DailyUsage)>, RelayError> {
        let rows: Vec<(NaiveDate, i64, i64, i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT date, messages_in, messages_out, bytes_in, bytes_out, active_agents, active_channels
            FROM daily_usage
            WHERE tenant_id = $1 AND date >= $2 AND date <= $3
            ORDER BY date
            "#,
        )
        .bind(tenant_id.as_ref())
        .bind(from_date)
        .bind(to_date)
        .fetch_all(&self.pool)
        .await
        .map_err(|_| RelayError::InternalError)?;

        let mut out: Vec<(NaiveDate, DailyUsage)> = rows
            .into_iter()
            .map(|(date, messages_in, messages_out, bytes_in, bytes_out, active_agents, active_channels)| {
                (
                    date,
                    DailyUsage {
                        messages_in,
                        messages_out,
                        bytes_in,
                        bytes_out,
                        active_agents,
                        active_channels,
                    },
                )
            })
            .collect();

        let today = Utc::now().date_naive();
        if to_date >= today && from_date <= today {
            self.sweep_once().await?;
            let live: Vec<(NaiveDate, i64, i64, i64, i64, i64, i64)> = sqlx::query_as(
                "SELECT date, messages_in, messages_out, bytes_in, bytes_out, active_agents, active_channels \
                 FROM daily_usage WHERE tenant_id = $1 AND date = $2",
            )
            .bind(tenant_id.as_ref())
            .bind(today)
            .fetch_all(&self.pool)
            .await
            .map_err(|_| RelayError::InternalError)?;

            out.retain(|(date, _)| *date != today);
            for (date, messages_in, messages_out, bytes_in, bytes_out, active_agents, active_channels) in live {
                out.push((
                    date,
                    DailyUsage {
                        messages_in,
                        messages_out,
                        bytes_in,
                        bytes_out,
                        active_agents,
                        active_channels,
                    },
                ));
            }
            out.sort_by_key(|(date, _)| *date);
        }

        Ok(out)
    }
}
