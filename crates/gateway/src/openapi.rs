//! OpenAPI document for the admin read surface. The WebSocket
//! endpoints aren't representable in OpenAPI and are documented in
//! prose only.

use utoipa::OpenApi;

#[derive(utoipa::OpenApi)]
#[openapi(
    info(
        title = "Relay gateway admin API",
        description = "Read-only operator projections over connection presence and tenant usage. The WebSocket gateway endpoints (/agents/{agent_id}, /dashboard) are not represented here.",
        version = "0.1.0"
    ),
    paths(
        crate::admin::health_check,
        crate::admin::list_connections,
        crate::admin::get_usage,
    ),
    components(schemas(
        crate::admin::HealthResponse,
        crate::admin::ErrorResponse,
        crate::admin::UsageDay,
        relay_common::ConnectionRecord,
        relay_common::DailyUsage,
        relay_common::Role,
    )),
    tags(
        (name = "admin", description = "Tenant connection and usage projections"),
        (name = "health", description = "Liveness/readiness"),
    )
)]
pub struct ApiDoc;
