use axum::routing::get;
use axum::Router;

use crate::state::PlatformState;

pub mod admin;
pub mod auth;
pub mod events;
pub mod files;
pub mod health;
pub mod platform;
pub mod records;
pub mod workflows;

/// `/api` router. Literal segments (`_platform`, `_admin`, `_workflows`,
/// `_files`, `_events`, `auth`) win over the dynamic `{entity}` capture, so
/// the dynamic CRUD surface sits safely at the bottom.
pub fn api_router() -> Router<PlatformState> {
    Router::new()
        .route("/health", get(health::health))
        .merge(platform::router())
        .merge(auth::router())
        .merge(admin::router())
        .merge(workflows::router())
        .merge(files::router())
        .merge(events::router())
        .merge(records::router())
}
