//! Thin read-only projections over the registry and counters for
//! operator tooling. No write endpoints — tenant and agent mutation
//! belongs to a separate management surface.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::NaiveDate;
use relay_common::{ConnectionRecord, DailyUsage, TenantId};
use relay_counters::UsageAggregator;
use relay_registry::ConnectionRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

pub struct AdminState {
    pub registry: Arc<ConnectionRegistry>,
    pub aggregator: Arc<UsageAggregator>,
}

pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/admin/tenants/:tenant_id/connections", get(list_connections))
        .route("/admin/tenants/:tenant_id/usage", get(get_usage))
        .route("/health", get(health_check))
        .with_state(state)
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Liveness/readiness probe.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "health"
)]
pub(crate) async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Live connections for a tenant, from `ConnectionRegistry::ListByTenant`.
#[utoipa::path(
    get,
    path = "/admin/tenants/{tenant_id}/connections",
    params(("tenant_id" = String, Path, description = "Tenant id")),
    responses((status = 200, description = "Connection records", body = [ConnectionRecord])),
    tag = "admin"
)]
pub(crate) async fn list_connections(
    State(state): State<Arc<AdminState>>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Vec<ConnectionRecord>>, (StatusCode, Json<ErrorResponse>)> {
    let tenant_id = TenantId::new(tenant_id);
    state
        .registry
        .list_by_tenant(&tenant_id)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, Json(ErrorResponse { error: e.category().to_string() })))
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    from: NaiveDate,
    to: NaiveDate,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UsageDay {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub usage: DailyUsage,
}

/// Durable-plus-live usage for a tenant over `[from, to]`, from
/// `UsageAggregator::GetUsage`.
#[utoipa::path(
    get,
    path = "/admin/tenants/{tenant_id}/usage",
    params(
        ("tenant_id" = String, Path, description = "Tenant id"),
        ("from" = String, Query, description = "Start date (YYYY-MM-DD)"),
        ("to" = String, Query, description = "End date (YYYY-MM-DD)"),
    ),
    responses((status = 200, description = "Per-day usage", body = [UsageDay])),
    tag = "admin"
)]
pub(crate) async fn get_usage(
    State(state): State<Arc<AdminState>>,
    Path(tenant_id): Path<String>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Vec<UsageDay>>, (StatusCode, Json<ErrorResponse>)> {
    let tenant_id = TenantId::new(tenant_id);
    state
        .aggregator
        .get_usage(&tenant_id, query.from, query.to)
        .await
        .map(|rows| Json(rows.into_iter().map(|(date, usage)| UsageDay { date, usage }).collect()))
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, Json(ErrorResponse { error: e.category().to_string() })))
}
