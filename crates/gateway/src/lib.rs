//! `relay-gateway`: `SessionManager`, `Gateway`, `HeartbeatMonitor`,
//! and the read-only admin API.

pub mod admin;
pub mod frames;
pub mod gateway;
pub mod heartbeat;
pub mod limits;
pub mod openapi;
pub mod session;

pub use admin::AdminState;
pub use gateway::GatewayState;
pub use heartbeat::HeartbeatMonitor;
pub use limits::{ConfiguredTenantLimits, TenantLimitsSource};
pub use session::{Session, SessionManager};

use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Assembles the full HTTP surface: the two WebSocket upgrade
/// endpoints, the admin read API, and Swagger UI over it.
pub fn build_router(gateway_state: Arc<GatewayState>, admin_state: Arc<AdminState>) -> Router {
    gateway::router(gateway_state)
        .merge(admin::router(admin_state))
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", openapi::ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
}
