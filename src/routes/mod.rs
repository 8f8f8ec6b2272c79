use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub mod admin;
pub mod auth;
pub mod dynamic;
pub mod files;
pub mod health;
pub mod workflows;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .nest("/api/{app}", app_router())
}

/// Per-app surface. Static prefixes (`auth`, `_admin`, `_workflows`,
/// `_files`) win over the dynamic `{entity}` routes.
fn app_router() -> Router<AppState> {
    Router::new()
        .merge(auth::router())
        .merge(workflows::router())
        .merge(files::router())
        .merge(admin::router())
        .merge(dynamic::router())
}
